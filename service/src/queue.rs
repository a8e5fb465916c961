//! Read-ahead queue decoupling socket reads from insert processing
//! (spec §4.2). A capacity-1 `tokio::sync::mpsc` channel already gives us
//! the semantics the spec asks for: a reader task drains the wire into the
//! channel until the stream ends, and dropping the receiver end (on any
//! handler exit path) closes the channel, causing the reader's next send to
//! fail and the task to exit. That drop is the "scoped acquisition with
//! guaranteed release" the spec calls out — ordinary Rust ownership, no
//! extra bookkeeping needed.

use futures::Stream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tonic::Status;

/// Bounds how far the reader task may run ahead of the worker that consumes
/// the queue; kept at 1 so memory use stays flat regardless of backlog.
pub const READ_AHEAD_CAPACITY: usize = 1;

/// Spawns a reader task draining `source` into a capacity-1 channel and
/// returns `(reader_task, receiver)`. The caller should `drop` the receiver
/// (or let it go out of scope) on every exit path to guarantee the reader
/// task observes the close and terminates.
pub fn spawn_read_ahead<S, T>(
    mut source: S,
) -> (JoinHandle<()>, mpsc::Receiver<Result<T, Status>>)
where
    S: Stream<Item = Result<T, Status>> + Unpin + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel(READ_AHEAD_CAPACITY);
    let reader = tokio::spawn(async move {
        while let Some(item) = source.next().await {
            if tx.send(item).await.is_err() {
                tracing::debug!("read-ahead queue closed, reader task exiting");
                return;
            }
        }
    });
    (reader, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn drains_until_source_ends() {
        let source = stream::iter(vec![Ok::<_, Status>(1), Ok(2), Ok(3)]);
        let (reader, mut rx) = spawn_read_ahead(source);
        let mut collected = Vec::new();
        while let Some(item) = rx.recv().await {
            collected.push(item.unwrap());
        }
        reader.await.unwrap();
        assert_eq!(collected, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn dropping_receiver_stops_reader() {
        let source = stream::repeat(Ok::<_, Status>(1u32));
        let (reader, rx) = spawn_read_ahead(source);
        drop(rx);
        reader.await.unwrap();
    }
}
