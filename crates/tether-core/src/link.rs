//! Async glue between a byte stream and the frame layer.
//!
//! [`FrameStream`] wraps the read half: chunked reads (at most the
//! process-wide buffer size per read) feed the assembler and yield whole
//! frames. [`run_writer`] drains a session's send queue into the write
//! half, honoring the ready gate and the cancellation token. Both are
//! generic over the stream type so plain TCP and TLS share one
//! implementation, and both observe cancellation within one I/O round.

use std::collections::VecDeque;

use tether_proto::{Frame, FrameAssembler, FrameKey};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::watch,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::MIN_RECEIVE_BUFFER,
    error::{LinkError, SendError},
    queue::{SendLane, SendQueueReceiver},
};

/// Frame-yielding wrapper over a read half.
pub struct FrameStream<R> {
    reader: R,
    assembler: FrameAssembler,
    read_buf: Vec<u8>,
    pending: VecDeque<Frame>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FrameStream<R> {
    /// Wrap a read half.
    ///
    /// `buffer_size` is clamped to the 256-byte floor; the value is fixed
    /// for the life of this stream even if the process-wide knob changes.
    pub fn new(
        reader: R,
        key: Option<FrameKey>,
        max_frame_bytes: usize,
        buffer_size: usize,
    ) -> Self {
        Self {
            reader,
            assembler: FrameAssembler::new(max_frame_bytes, key),
            read_buf: vec![0u8; buffer_size.max(MIN_RECEIVE_BUFFER)],
            pending: VecDeque::new(),
            eof: false,
        }
    }

    /// Next complete frame; `Ok(None)` on a clean end of stream.
    ///
    /// # Errors
    ///
    /// - [`LinkError::Io`] on socket failure
    /// - [`LinkError::Protocol`] on a wire violation, including
    ///   [`tether_proto::ProtocolError::UnexpectedEof`] when the peer
    ///   closed mid-frame
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, LinkError> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }
            if self.eof {
                return Ok(None);
            }

            let n = self.reader.read(&mut self.read_buf).await?;
            if n == 0 {
                self.eof = true;
                self.assembler.finish()?;
                return Ok(None);
            }
            self.pending.extend(self.assembler.feed(&self.read_buf[..n])?);
        }
    }
}

/// Drain a session's send queue into a write half.
///
/// Data-lane frames wait for the ready gate; control frames go straight
/// out. Completions resolve after `write_all` + `flush`, i.e. once the
/// bytes are in the socket buffer. Returns when cancelled, when every
/// queue sender is gone, or with the first write error; pending
/// completions are failed on the way out.
pub async fn run_writer<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut queue: SendQueueReceiver,
    mut ready: watch::Receiver<bool>,
    cancel: CancellationToken,
) -> Result<(), LinkError> {
    let result = loop {
        let item = tokio::select! {
            () = cancel.cancelled() => break Ok(()),
            item = queue.recv() => match item {
                Some(item) => item,
                None => break Ok(()),
            },
        };

        if item.lane == SendLane::Data && !*ready.borrow() {
            let gate = tokio::select! {
                () = cancel.cancelled() => Err(()),
                opened = ready.wait_for(|open| *open) => opened.map(|_| ()).map_err(|_| ()),
            };
            if gate.is_err() {
                if let Some(done) = item.completion {
                    let _ = done.send(Err(SendError::NotConnected));
                }
                break Ok(());
            }
        }

        match write_frame(&mut writer, &item.bytes).await {
            Ok(()) => {
                if let Some(done) = item.completion {
                    let _ = done.send(Ok(()));
                }
            },
            Err(e) => {
                if let Some(done) = item.completion {
                    let _ = done.send(Err(SendError::Io(e.to_string())));
                }
                break Err(LinkError::Io(e));
            },
        }
    };

    queue.fail_pending();
    result
}

async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use tether_proto::DEFAULT_MAX_FRAME_BYTES;
    use tokio::sync::oneshot;

    use super::*;
    use crate::queue::send_queue;

    #[tokio::test]
    async fn frame_stream_yields_frames_then_eof() {
        let frames = vec![Frame::message("a"), Frame::message("b")];
        let mut wire = Vec::new();
        for frame in &frames {
            wire.extend_from_slice(&frame.encode(None).unwrap());
        }

        let (client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            server.write_all(&wire).await.unwrap();
            server.shutdown().await.unwrap();
        });

        let mut stream = FrameStream::new(client, None, DEFAULT_MAX_FRAME_BYTES, 4096);
        assert_eq!(stream.next_frame().await.unwrap(), Some(frames[0].clone()));
        assert_eq!(stream.next_frame().await.unwrap(), Some(frames[1].clone()));
        assert_eq!(stream.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn frame_stream_reports_partial_frame_at_eof() {
        let wire = Frame::message("interrupted").encode(None).unwrap();

        let (client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            server.write_all(&wire[..wire.len() - 2]).await.unwrap();
            server.shutdown().await.unwrap();
        });

        let mut stream = FrameStream::new(client, None, DEFAULT_MAX_FRAME_BYTES, 4096);
        let result = stream.next_frame().await;
        assert!(matches!(
            result,
            Err(LinkError::Protocol(tether_proto::ProtocolError::UnexpectedEof { .. }))
        ));
    }

    #[tokio::test]
    async fn tiny_buffer_still_reassembles() {
        let frame = Frame::bytes(vec![9u8; 2000]);
        let wire = frame.encode(None).unwrap();

        let (client, mut server) = tokio::io::duplex(8192);
        tokio::spawn(async move {
            server.write_all(&wire).await.unwrap();
            server.shutdown().await.unwrap();
        });

        // Requested 1 byte; the floor clamps to 256.
        let mut stream = FrameStream::new(client, None, DEFAULT_MAX_FRAME_BYTES, 1);
        assert_eq!(stream.next_frame().await.unwrap(), Some(frame));
    }

    #[tokio::test]
    async fn writer_gates_data_until_ready() {
        let (queue, queue_rx) = send_queue(None);
        let (ready_tx, ready_rx) = watch::channel(false);
        let cancel = CancellationToken::new();

        let (mut read_side, write_side) = tokio::io::duplex(4096);
        let writer = tokio::spawn(run_writer(write_side, queue_rx, ready_rx, cancel.clone()));

        let (done_tx, done_rx) = oneshot::channel();
        let wire = Frame::message("gated").encode(None).unwrap();
        queue.enqueue(wire.clone(), SendLane::Data, Some(done_tx)).unwrap();

        // Not ready yet: nothing may arrive.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let mut probe = [0u8; 1];
        let peek = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            read_side.read(&mut probe),
        )
        .await;
        assert!(peek.is_err(), "data lane must wait for the ready gate");

        ready_tx.send(true).unwrap();
        done_rx.await.unwrap().unwrap();

        let mut got = vec![0u8; wire.len()];
        read_side.read_exact(&mut got).await.unwrap();
        assert_eq!(got, wire);

        cancel.cancel();
        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn control_lane_bypasses_the_gate() {
        let (queue, queue_rx) = send_queue(None);
        let (_ready_tx, ready_rx) = watch::channel(false);
        let cancel = CancellationToken::new();

        let (mut read_side, write_side) = tokio::io::duplex(4096);
        let _writer = tokio::spawn(run_writer(write_side, queue_rx, ready_rx, cancel.clone()));

        let wire = Frame::keep_alive().encode(None).unwrap();
        queue.enqueue(wire.clone(), SendLane::Control, None).unwrap();

        let mut got = vec![0u8; wire.len()];
        read_side.read_exact(&mut got).await.unwrap();
        assert_eq!(got, wire);
        cancel.cancel();
    }

    #[tokio::test]
    async fn cancellation_fails_pending_sends() {
        let (queue, queue_rx) = send_queue(None);
        let (_ready_tx, ready_rx) = watch::channel(false);
        let cancel = CancellationToken::new();

        let (_read_side, write_side) = tokio::io::duplex(4096);
        let writer = tokio::spawn(run_writer(write_side, queue_rx, ready_rx, cancel.clone()));

        let (done_tx, done_rx) = oneshot::channel();
        queue
            .enqueue(Frame::message("doomed").encode(None).unwrap(), SendLane::Data, Some(done_tx))
            .unwrap();

        // Give the writer a chance to pick the item up and park on the gate.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();

        assert!(matches!(done_rx.await, Ok(Err(SendError::NotConnected))));
        writer.await.unwrap().unwrap();
    }
}
