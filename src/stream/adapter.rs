//! Exact-size reads over a chunked notification stream
//!
//! Notifications arrive as chunks of whatever size the peer chose to send.
//! [`ByteStreamAdapter`] turns them back into a byte stream: a read asks for
//! `n` bytes and gets them in arrival order, splitting chunks as needed and
//! holding the unread tail of a split chunk for the next read.
//!
//! A read that cannot be satisfied from what is queued (under a bounded
//! [`ReadTimeout`]) or before the link closes returns what it has. That short result is the
//! normal timeout outcome, not an error.

use std::cmp;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use super::queue::EventQueue;

/// How long a read may wait for data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadTimeout {
    /// Wait until enough data arrives or the link closes.
    Blocking,
    /// Never wait. While the budget lasts the reader takes whatever is
    /// already queued and stops short when the queue runs dry. Once the
    /// budget is spent it makes one last non-blocking attempt.
    Bounded(Duration),
}

impl ReadTimeout {
    /// Millisecond form used in configuration: `0` means blocking.
    pub fn from_millis(ms: u64) -> Self {
        if ms == 0 {
            ReadTimeout::Blocking
        } else {
            ReadTimeout::Bounded(Duration::from_millis(ms))
        }
    }
}

/// Assembles exact-size reads from an [`EventQueue`].
///
/// Chunks move out of the queue into the adapter before any of their bytes
/// are returned, so dropping a pending `read` future loses nothing: the
/// next read picks up where it left off. Between reads the adapter holds at
/// most the unread tail of one chunk.
#[derive(Debug)]
pub struct ByteStreamAdapter {
    queue: Arc<EventQueue>,
    held: VecDeque<Bytes>,
}

impl ByteStreamAdapter {
    pub fn new(queue: Arc<EventQueue>) -> Self {
        Self {
            queue,
            held: VecDeque::new(),
        }
    }

    /// Bytes dequeued but not yet returned.
    pub fn pending_len(&self) -> usize {
        self.held.iter().map(Bytes::len).sum()
    }

    /// Drop the held tail. Returns how many bytes were discarded.
    pub fn discard_held(&mut self) -> usize {
        let discarded = self.pending_len();
        self.held.clear();
        discarded
    }

    /// Read up to `n` bytes.
    ///
    /// Returns exactly `n` bytes unless the queue runs dry first: at once
    /// under a bounded timeout, or once the link closes when blocking.
    pub async fn read(&mut self, n: usize, timeout: ReadTimeout) -> Vec<u8> {
        let deadline = match timeout {
            ReadTimeout::Blocking => None,
            ReadTimeout::Bounded(budget) => Some(Instant::now() + budget),
        };

        while self.pending_len() < n {
            let next = match deadline {
                None => self.queue.pop_wait().await,
                Some(deadline) if Instant::now() < deadline => match self.queue.try_pop() {
                    Some(chunk) => Some(chunk),
                    None => break,
                },
                Some(_) => {
                    // Catch data that landed exactly at the boundary.
                    if let Some(chunk) = self.queue.try_pop() {
                        self.held.push_back(chunk.data);
                    }
                    break;
                }
            };
            match next {
                Some(chunk) => self.held.push_back(chunk.data),
                None => break,
            }
        }

        self.take(n)
    }

    /// Move up to `n` held bytes into the output, keeping any tail.
    fn take(&mut self, n: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(cmp::min(n, self.pending_len()));
        while out.len() < n {
            let Some(mut front) = self.held.pop_front() else {
                break;
            };
            let wanted = n - out.len();
            if front.len() > wanted {
                let head = front.split_to(wanted);
                out.extend_from_slice(&head);
                self.held.push_front(front);
            } else {
                out.extend_from_slice(&front);
            }
        }
        out
    }

    /// Concatenate every chunk currently queued, without waiting.
    ///
    /// This drains the shared queue only: a tail held back by a previous
    /// [`read`](Self::read) is not included and stays for the next `read`.
    /// Mixing `read` and `read_all` can therefore split one response across
    /// both calls; callers exchanging command/response pairs should stick to
    /// one style per response.
    pub fn read_all(&self) -> Vec<u8> {
        drain_bytes(&self.queue)
    }
}

/// Concatenate and remove every chunk in `queue`, in arrival order.
pub fn drain_bytes(queue: &EventQueue) -> Vec<u8> {
    let mut out = Vec::new();
    for chunk in queue.drain() {
        out.extend_from_slice(&chunk.data);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::transport::{ConnectionHandle, NotificationChunk};
    use uuid::Uuid;

    fn push(queue: &EventQueue, data: &[u8]) {
        queue.push(NotificationChunk {
            handle: ConnectionHandle(0),
            characteristic: Uuid::nil(),
            data: Bytes::copy_from_slice(data),
        });
    }

    fn adapter() -> (Arc<EventQueue>, ByteStreamAdapter) {
        let queue = Arc::new(EventQueue::new());
        let adapter = ByteStreamAdapter::new(Arc::clone(&queue));
        (queue, adapter)
    }

    const NO_WAIT: ReadTimeout = ReadTimeout::Bounded(Duration::ZERO);

    #[tokio::test]
    async fn test_split_chunk_and_remainder() {
        let (queue, mut adapter) = adapter();
        push(&queue, &[0x01, 0x02, 0x03]);
        push(&queue, &[0x04, 0x05]);

        let budget = ReadTimeout::Bounded(Duration::from_millis(50));
        assert_eq!(adapter.read(4, budget).await, vec![0x01, 0x02, 0x03, 0x04]);
        assert_eq!(adapter.pending_len(), 1);
        assert_eq!(adapter.read(1, budget).await, vec![0x05]);
        assert_eq!(adapter.read(1, NO_WAIT).await, Vec::<u8>::new());
    }

    #[tokio::test]
    async fn test_satisfied_read_leaves_queue_alone() {
        let (queue, mut adapter) = adapter();
        push(&queue, &[1, 2]);
        push(&queue, &[3, 4]);
        push(&queue, &[5]);

        assert_eq!(adapter.read(2, ReadTimeout::Blocking).await, vec![1, 2]);
        assert_eq!(adapter.pending_len(), 0);
        assert_eq!(queue.len(), 2);
        assert_eq!(adapter.read(3, ReadTimeout::Blocking).await, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_zero_length_read() {
        let (queue, mut adapter) = adapter();
        push(&queue, &[1]);
        assert!(adapter.read(0, ReadTimeout::Blocking).await.is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_read_returns_short_on_empty_queue() {
        let (queue, mut adapter) = adapter();
        push(&queue, &[1, 2]);

        let start = Instant::now();
        let got = adapter.read(10, ReadTimeout::Bounded(Duration::from_secs(4))).await;
        assert_eq!(got, vec![1, 2]);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_read_does_not_wait_for_late_chunk() {
        let (queue, mut adapter) = adapter();
        let producer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            push(&producer, &[1, 2, 3]);
        });

        let budget = ReadTimeout::Bounded(Duration::from_millis(100));
        let start = Instant::now();
        assert!(adapter.read(3, budget).await.is_empty());
        assert_eq!(start.elapsed(), Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(adapter.read(3, budget).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_discard_held_tail() {
        let (queue, mut adapter) = adapter();
        push(&queue, &[1, 2, 3]);
        assert_eq!(adapter.read(1, NO_WAIT).await, vec![1]);
        assert_eq!(adapter.discard_held(), 2);
        push(&queue, &[4]);
        assert_eq!(adapter.read(3, NO_WAIT).await, vec![4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_budget_takes_one_chunk_only() {
        let (queue, mut adapter) = adapter();
        push(&queue, &[1, 2]);
        push(&queue, &[3, 4]);

        // Budget already spent: a single non-blocking attempt.
        assert_eq!(adapter.read(4, NO_WAIT).await, vec![1, 2]);
        assert_eq!(adapter.read(4, NO_WAIT).await, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_blocking_read_released_by_close() {
        let (queue, mut adapter) = adapter();
        push(&queue, &[1]);
        let closer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            closer.close();
        });
        assert_eq!(adapter.read(5, ReadTimeout::Blocking).await, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_read_loses_nothing() {
        let (queue, mut adapter) = adapter();
        push(&queue, &[1, 2, 3]);

        // Gives up while waiting for bytes that never come.
        let cancelled =
            tokio::time::timeout(Duration::from_millis(10), adapter.read(10, ReadTimeout::Blocking))
                .await;
        assert!(cancelled.is_err());

        push(&queue, &[4]);
        assert_eq!(adapter.read(4, NO_WAIT).await, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_read_all_ignores_held_tail() {
        let (queue, mut adapter) = adapter();
        push(&queue, &[1, 2, 3]);
        assert_eq!(adapter.read(1, NO_WAIT).await, vec![1]);

        push(&queue, &[4]);
        push(&queue, &[5, 6]);
        assert_eq!(adapter.read_all(), vec![4, 5, 6]);
        assert!(adapter.read_all().is_empty());
        assert_eq!(adapter.read(5, NO_WAIT).await, vec![2, 3]);
    }

    #[test]
    fn test_timeout_from_millis() {
        assert_eq!(ReadTimeout::from_millis(0), ReadTimeout::Blocking);
        assert_eq!(
            ReadTimeout::from_millis(250),
            ReadTimeout::Bounded(Duration::from_millis(250))
        );
    }
}
