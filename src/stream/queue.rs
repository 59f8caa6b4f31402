//! FIFO of received notification chunks
//!
//! Filled from the transport's delivery context (which must never block)
//! and drained by one or more readers. Each chunk is handed to exactly one
//! reader.
//!
//! The queue also tracks whether the link feeding it is open. A reader
//! waiting on an empty queue is released when the link closes, so a dropped
//! connection ends a blocked read instead of hanging it. Chunks queued
//! before the close stay readable.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::ble::transport::NotificationChunk;

#[derive(Debug)]
pub struct EventQueue {
    chunks: Mutex<VecDeque<NotificationChunk>>,
    changed: Notify,
    open: AtomicBool,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    /// Create an empty queue with its link marked open.
    pub fn new() -> Self {
        Self {
            chunks: Mutex::new(VecDeque::new()),
            changed: Notify::new(),
            open: AtomicBool::new(true),
        }
    }

    fn chunks(&self) -> MutexGuard<'_, VecDeque<NotificationChunk>> {
        self.chunks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a chunk. Never blocks beyond a short lock.
    pub fn push(&self, chunk: NotificationChunk) {
        self.chunks().push_back(chunk);
        self.changed.notify_waiters();
    }

    /// Take the oldest chunk, if any, without waiting.
    pub fn try_pop(&self) -> Option<NotificationChunk> {
        self.chunks().pop_front()
    }

    /// Take the oldest chunk, waiting for one to arrive.
    ///
    /// Returns `None` once the queue is empty and the link is closed.
    /// Cancel safe: a chunk is only removed in the same step that returns it.
    pub async fn pop_wait(&self) -> Option<NotificationChunk> {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            // Register before checking so a push between the check and the
            // await is not missed.
            changed.as_mut().enable();

            if let Some(chunk) = self.try_pop() {
                return Some(chunk);
            }
            if !self.is_open() {
                return None;
            }
            changed.await;
        }
    }

    /// Take every queued chunk, oldest first.
    pub fn drain(&self) -> Vec<NotificationChunk> {
        self.chunks().drain(..).collect()
    }

    /// Drop everything queued. Returns how many chunks were discarded.
    pub fn clear(&self) -> usize {
        let mut chunks = self.chunks();
        let count = chunks.len();
        chunks.clear();
        count
    }

    /// Number of queued chunks.
    pub fn len(&self) -> usize {
        self.chunks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total payload bytes currently queued.
    pub fn buffered_bytes(&self) -> usize {
        self.chunks().iter().map(|chunk| chunk.data.len()).sum()
    }

    /// Whether the link feeding this queue is up.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Mark the link as up.
    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    /// Mark the link as down and release every waiting reader.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::transport::ConnectionHandle;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    fn chunk(data: &'static [u8]) -> NotificationChunk {
        NotificationChunk {
            handle: ConnectionHandle(0),
            characteristic: Uuid::nil(),
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = EventQueue::new();
        queue.push(chunk(&[1]));
        queue.push(chunk(&[2, 3]));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.buffered_bytes(), 3);
        assert_eq!(queue.try_pop().unwrap().data, Bytes::from_static(&[1]));
        assert_eq!(queue.try_pop().unwrap().data, Bytes::from_static(&[2, 3]));
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_drain_and_clear() {
        let queue = EventQueue::new();
        queue.push(chunk(&[1]));
        queue.push(chunk(&[2]));
        let drained: Vec<u8> = queue.drain().iter().flat_map(|c| c.data.to_vec()).collect();
        assert_eq!(drained, vec![1, 2]);
        assert!(queue.is_empty());

        queue.push(chunk(&[3]));
        assert_eq!(queue.clear(), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_pop_wait_wakes_on_push() {
        let queue = Arc::new(EventQueue::new());
        let producer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.push(chunk(&[7]));
        });
        let got = queue.pop_wait().await.unwrap();
        assert_eq!(got.data, Bytes::from_static(&[7]));
    }

    #[tokio::test]
    async fn test_close_releases_waiter_but_keeps_data() {
        let queue = Arc::new(EventQueue::new());
        let closer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            closer.close();
        });
        assert!(queue.pop_wait().await.is_none());

        queue.push(chunk(&[9]));
        assert_eq!(queue.pop_wait().await.unwrap().data, Bytes::from_static(&[9]));
        assert!(queue.pop_wait().await.is_none());

        queue.open();
        assert!(queue.is_open());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_each_chunk_goes_to_one_reader() {
        let queue = Arc::new(EventQueue::new());
        let mut readers = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            readers.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(chunk) = queue.pop_wait().await {
                    got.push(chunk.data[0]);
                }
                got
            }));
        }
        for i in 0..200u8 {
            queue.push(NotificationChunk {
                handle: ConnectionHandle(0),
                characteristic: Uuid::nil(),
                data: Bytes::copy_from_slice(&[i]),
            });
            if i % 16 == 0 {
                tokio::task::yield_now().await;
            }
        }
        queue.close();

        let mut all = Vec::new();
        for reader in readers {
            all.extend(reader.await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (0..200u8).collect::<Vec<_>>());
    }
}
