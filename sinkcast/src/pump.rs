//! Background drain of a subprocess's output
//!
//! The pump is the only task besides the session itself. It owns the read
//! side of the subprocess output and talks to the session solely through a
//! [`LineQueue`]: an unbounded FIFO channel that closes when the pump
//! returns. Closure is only observable after every queued line has been
//! dequeued.

use std::time::Duration;

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::process::OutputLines;

/// Result of a non-blocking dequeue attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dequeue {
    Line(String),
    /// Nothing queued yet, producer still running: retry later
    Empty,
    /// Producer finished and every line has been consumed
    Closed,
}

/// Consumer end of the pump's output
#[derive(Debug)]
pub struct LineQueue {
    rx: UnboundedReceiver<String>,
}

impl LineQueue {
    /// Dequeue without waiting
    pub fn try_dequeue(&mut self) -> Dequeue {
        match self.rx.try_recv() {
            Ok(line) => Dequeue::Line(line),
            Err(TryRecvError::Empty) => Dequeue::Empty,
            Err(TryRecvError::Disconnected) => Dequeue::Closed,
        }
    }

    /// Wait for the next line; `None` once the queue is closed and drained
    pub async fn next_line(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Handle to the background drain task
#[derive(Debug)]
pub struct OutputPump {
    task: JoinHandle<usize>,
}

impl OutputPump {
    /// Start draining `source` on a background task
    pub fn spawn(source: OutputLines) -> (Self, LineQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(source, tx));
        (Self { task }, LineQueue { rx })
    }

    /// Wait for the task to finish; returns the number of lines delivered
    pub async fn join(self) -> usize {
        match self.task.await {
            Ok(count) => count,
            Err(e) => {
                warn!("Output pump task failed: {}", e);
                0
            }
        }
    }

    /// Wait up to `limit` for the task to finish, aborting it otherwise
    pub async fn join_timeout(mut self, limit: Duration) -> Option<usize> {
        match tokio::time::timeout(limit, &mut self.task).await {
            Ok(Ok(count)) => Some(count),
            Ok(Err(e)) => {
                warn!("Output pump task failed: {}", e);
                None
            }
            Err(_) => {
                warn!("Output pump still reading after {:?}, aborting it", limit);
                self.task.abort();
                None
            }
        }
    }

    /// Stop the task without waiting for end-of-stream
    pub fn abort(self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Read lines from `source` into `tx` until end-of-stream
///
/// Dropping `tx` on return is what closes the queue.
pub async fn run(mut source: OutputLines, tx: UnboundedSender<String>) -> usize {
    let mut delivered = 0usize;

    while let Some(item) = source.next().await {
        match item {
            Ok(line) => {
                if tx.send(line).is_err() {
                    debug!("Line queue consumer gone, stopping pump");
                    break;
                }
                delivered += 1;
            }
            Err(e) => {
                warn!("Error reading subprocess output, treating as end of stream: {}", e);
                break;
            }
        }
    }

    debug!(lines = delivered, "Output pump reached end of stream");
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::line_stream;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_try_dequeue_reports_closed_only_after_last_line() {
        let (pump, mut queue) = OutputPump::spawn(line_stream(Cursor::new(b"a\nb\n".to_vec())));
        assert_eq!(pump.join().await, 2);

        assert_eq!(queue.try_dequeue(), Dequeue::Line("a".to_string()));
        assert_eq!(queue.try_dequeue(), Dequeue::Line("b".to_string()));
        assert_eq!(queue.try_dequeue(), Dequeue::Closed);
        assert_eq!(queue.try_dequeue(), Dequeue::Closed);
    }

    #[tokio::test]
    async fn test_empty_while_producer_open() {
        // Write half kept alive: the reader never sees end of stream
        let (reader, _writer) = tokio::io::duplex(64);
        let (pump, mut queue) = OutputPump::spawn(line_stream(reader));

        assert_eq!(queue.try_dequeue(), Dequeue::Empty);
        assert!(!pump.is_finished());
        pump.abort();
    }

    #[tokio::test]
    async fn test_join_timeout_aborts_stuck_reader() {
        let (reader, _writer) = tokio::io::duplex(64);
        let (pump, _queue) = OutputPump::spawn(line_stream(reader));

        assert_eq!(pump.join_timeout(Duration::from_millis(50)).await, None);
    }

    #[tokio::test]
    async fn test_invalid_utf8_does_not_close_live_stream() {
        use tokio::io::AsyncWriteExt;

        let (reader, mut writer) = tokio::io::duplex(64);
        let (pump, mut queue) = OutputPump::spawn(line_stream(reader));

        writer.write_all(b"ok\n\xe9t\xe9\nstill streaming\n").await.unwrap();

        assert_eq!(queue.next_line().await.as_deref(), Some("ok"));
        assert_eq!(queue.next_line().await.as_deref(), Some("\u{FFFD}t\u{FFFD}"));
        assert_eq!(queue.next_line().await.as_deref(), Some("still streaming"));
        assert_eq!(queue.try_dequeue(), Dequeue::Empty);
        assert!(!pump.is_finished());

        drop(writer);
        assert_eq!(queue.next_line().await, None);
        assert_eq!(pump.join().await, 3);
    }

    #[tokio::test]
    async fn test_unterminated_last_line_is_delivered() {
        let (pump, mut queue) = OutputPump::spawn(line_stream(Cursor::new(b"one\ntwo".to_vec())));

        assert_eq!(queue.next_line().await.as_deref(), Some("one"));
        assert_eq!(queue.next_line().await.as_deref(), Some("two"));
        assert_eq!(queue.next_line().await, None);
        assert_eq!(pump.join().await, 2);
    }
}
