fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        // Chunk payloads are large and already compressed; generate `bytes`
        // fields as `bytes::Bytes` so fan-out in the sample handler clones a
        // refcount instead of the underlying buffer.
        .bytes(["."])
        .compile(&["proto/replay.proto"], &["proto"])?;
    Ok(())
}
