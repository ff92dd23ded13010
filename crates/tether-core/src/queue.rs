//! Per-session outbound send queue.
//!
//! FIFO of already-encoded frames, drained by a single writer task, so at
//! most one frame is ever in flight: TCP orders the bytes, the queue
//! orders the messages. Two lanes share one channel (FIFO is preserved):
//! the data lane is gated on the session reaching `Ready`, the control
//! lane (Auth, KeepAlive) bypasses both the gate and any configured depth
//! bound.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use tokio::sync::{mpsc, oneshot};

use crate::error::SendError;

/// Which gate a queued frame is subject to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendLane {
    /// Auth and KeepAlive: written in any non-terminal state, never
    /// counted against the depth bound.
    Control,
    /// Application frames: written only once the session is `Ready`,
    /// subject to the depth bound.
    Data,
}

/// One encoded frame waiting for the writer.
pub struct QueuedFrame {
    /// Wire bytes.
    pub bytes: Vec<u8>,
    /// Gate class.
    pub lane: SendLane,
    /// Resolved once the bytes hit the socket buffer (or with the error
    /// that prevented it).
    pub completion: Option<oneshot::Sender<Result<(), SendError>>>,
}

/// Sending half of a session's queue. Cheap to clone.
#[derive(Clone)]
pub struct SendQueue {
    tx: mpsc::UnboundedSender<QueuedFrame>,
    depth: Option<usize>,
    queued: Arc<AtomicUsize>,
}

/// Receiving half, owned by the writer task.
pub struct SendQueueReceiver {
    rx: mpsc::UnboundedReceiver<QueuedFrame>,
    queued: Arc<AtomicUsize>,
}

/// Create a queue pair with an optional depth bound on the data lane.
#[must_use]
pub fn send_queue(depth: Option<usize>) -> (SendQueue, SendQueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let queued = Arc::new(AtomicUsize::new(0));
    (
        SendQueue { tx, depth, queued: Arc::clone(&queued) },
        SendQueueReceiver { rx, queued },
    )
}

impl SendQueue {
    /// Enqueue an encoded frame.
    ///
    /// # Errors
    ///
    /// - [`SendError::Backpressure`] if the data lane is at its configured
    ///   depth
    /// - [`SendError::NotConnected`] if the writer is gone
    pub fn enqueue(
        &self,
        bytes: Vec<u8>,
        lane: SendLane,
        completion: Option<oneshot::Sender<Result<(), SendError>>>,
    ) -> Result<(), SendError> {
        if lane == SendLane::Data {
            if let Some(depth) = self.depth {
                if self.queued.load(Ordering::Acquire) >= depth {
                    return Err(SendError::Backpressure(depth));
                }
            }
            self.queued.fetch_add(1, Ordering::AcqRel);
        }

        self.tx.send(QueuedFrame { bytes, lane, completion }).map_err(|e| {
            if e.0.lane == SendLane::Data {
                self.queued.fetch_sub(1, Ordering::AcqRel);
            }
            SendError::NotConnected
        })
    }

    /// Frames currently queued on the data lane.
    #[must_use]
    pub fn depth_in_use(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }
}

impl SendQueueReceiver {
    /// Wait for the next queued frame; `None` when every sender is gone.
    pub async fn recv(&mut self) -> Option<QueuedFrame> {
        let item = self.rx.recv().await;
        if let Some(frame) = &item {
            if frame.lane == SendLane::Data {
                self.queued.fetch_sub(1, Ordering::AcqRel);
            }
        }
        item
    }

    /// Drain everything still queued, failing each completion.
    ///
    /// Called on teardown so no caller waits forever on a dead session.
    pub fn fail_pending(&mut self) {
        while let Ok(frame) = self.rx.try_recv() {
            if frame.lane == SendLane::Data {
                self.queued.fetch_sub(1, Ordering::AcqRel);
            }
            if let Some(done) = frame.completion {
                let _ = done.send(Err(SendError::NotConnected));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_order_preserved_across_lanes() {
        let (queue, mut rx) = send_queue(None);
        queue.enqueue(vec![1], SendLane::Data, None).unwrap();
        queue.enqueue(vec![2], SendLane::Control, None).unwrap();
        queue.enqueue(vec![3], SendLane::Data, None).unwrap();

        assert_eq!(rx.recv().await.unwrap().bytes, vec![1]);
        assert_eq!(rx.recv().await.unwrap().bytes, vec![2]);
        assert_eq!(rx.recv().await.unwrap().bytes, vec![3]);
    }

    #[tokio::test]
    async fn depth_bound_applies_to_data_lane_only() {
        let (queue, mut rx) = send_queue(Some(2));
        queue.enqueue(vec![1], SendLane::Data, None).unwrap();
        queue.enqueue(vec![2], SendLane::Data, None).unwrap();

        assert!(matches!(
            queue.enqueue(vec![3], SendLane::Data, None),
            Err(SendError::Backpressure(2))
        ));
        // Control frames always fit.
        queue.enqueue(vec![4], SendLane::Control, None).unwrap();

        // Draining frees depth.
        rx.recv().await.unwrap();
        queue.enqueue(vec![5], SendLane::Data, None).unwrap();
    }

    #[tokio::test]
    async fn enqueue_after_writer_gone_is_not_connected() {
        let (queue, rx) = send_queue(None);
        drop(rx);
        assert!(matches!(
            queue.enqueue(vec![1], SendLane::Data, None),
            Err(SendError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn fail_pending_resolves_completions() {
        let (queue, mut rx) = send_queue(None);
        let (done_tx, done_rx) = oneshot::channel();
        queue.enqueue(vec![1], SendLane::Data, Some(done_tx)).unwrap();

        rx.fail_pending();
        assert!(matches!(done_rx.await, Ok(Err(SendError::NotConnected))));
        assert_eq!(queue.depth_in_use(), 0);
    }
}
