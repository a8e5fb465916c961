use clap::Parser;
use replay_server::{replay_server_serve, ReplayServerOpts};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opts = ReplayServerOpts::parse();
    let addr = opts.listen_addr.parse()?;
    let (join_handle, _shutdown_send) = replay_server_serve(addr, opts).await?;
    join_handle.await?;
    Ok(())
}
