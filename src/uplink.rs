//! Client to target pipeline.
//!
//! Inbound WebSocket messages cannot be paused, so instead of applying backpressure
//! the uplink buffers them in a small bounded queue and drops the whole session if
//! the queue overflows. A single drain loop per session writes the queue to the
//! target, merging adjacent chunks into fewer, larger writes.

use bytes::{Bytes, BytesMut};
use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};
use thiserror::Error;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Notify,
};
use tracing::{debug, trace};

use crate::config::FlowConfig;
use crate::session::{Cause, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Overflow {
    #[error("uplink queue has no free slot")]
    Slots,
    #[error("uplink queue byte cap exceeded")]
    Bytes,
}

/// Bounded FIFO of pending chunks
#[derive(Debug)]
pub struct UplinkQueue {
    chunks: VecDeque<Bytes>,
    queued_bytes: usize,
    slots: usize,
    byte_cap: usize,
}

impl UplinkQueue {
    #[must_use]
    pub fn new(slots: usize, byte_cap: usize) -> Self {
        Self {
            chunks: VecDeque::with_capacity(slots),
            queued_bytes: 0,
            slots,
            byte_cap,
        }
    }

    pub fn push(&mut self, chunk: Bytes) -> Result<(), Overflow> {
        if self.chunks.len() >= self.slots {
            return Err(Overflow::Slots);
        }
        if self.queued_bytes + chunk.len() > self.byte_cap {
            return Err(Overflow::Bytes);
        }
        self.queued_bytes += chunk.len();
        self.chunks.push_back(chunk);
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    #[must_use]
    pub const fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Removes up to `max_chunks` chunks from the front, stopping before the merged
    /// size would pass `merge_max`. The first chunk is always taken, however large.
    pub fn take_batch(&mut self, max_chunks: usize, merge_max: usize) -> Option<Bytes> {
        let mut count = 0;
        let mut size = 0;
        for chunk in self.chunks.iter().take(max_chunks.max(1)) {
            if count > 0 && size + chunk.len() > merge_max {
                break;
            }
            size += chunk.len();
            count += 1;
        }

        let batch = match count {
            0 => return None,
            1 => self.chunks.pop_front()?,
            _ => {
                let mut merged = BytesMut::with_capacity(size);
                for chunk in self.chunks.drain(..count) {
                    merged.extend_from_slice(&chunk);
                }
                merged.freeze()
            }
        };
        self.queued_bytes -= batch.len();
        Some(batch)
    }
}

pub struct Uplink<'s> {
    session: &'s Session,
    queue: Mutex<UplinkQueue>,
    wake: Notify,
    flow: FlowConfig,
}

impl<'s> Uplink<'s> {
    #[must_use]
    pub fn new(session: &'s Session, flow: FlowConfig) -> Self {
        Self {
            session,
            queue: Mutex::new(UplinkQueue::new(flow.queue_slots, flow.queue_byte_cap)),
            wake: Notify::new(),
            flow,
        }
    }

    fn queue(&self) -> MutexGuard<'_, UplinkQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a chunk for the target. Overflow terminates the session.
    pub fn push(&self, chunk: Bytes) {
        if self.session.is_terminated() || chunk.is_empty() {
            return;
        }

        let len = chunk.len();
        let pushed = self.queue().push(chunk);
        match pushed {
            Ok(()) => {
                trace!(bytes = len, "Queued chunk for target");
                self.wake.notify_one();
            }
            Err(overflow) => {
                debug!(error = %overflow, bytes = len, "Dropping session on uplink overflow");
                self.session.terminate(Cause::UplinkOverflow);
            }
        }
    }

    /// Bytes accepted but not yet written to the target
    #[cfg(test)]
    pub(crate) fn pending_bytes(&self) -> usize {
        self.queue().queued_bytes()
    }

    /// Whether the queue already holds enough to write without waiting a turn
    fn flush_due(&self) -> bool {
        let queue = self.queue();
        queue.queued_bytes() >= self.flow.merge_max
            || queue.len() >= self.flow.eager_slots
            || queue
                .chunks
                .back()
                .is_some_and(|chunk| chunk.len() > self.flow.large_chunk)
    }

    fn next_batch(&self) -> Option<Bytes> {
        self.queue()
            .take_batch(self.flow.coalesce_chunks, self.flow.merge_max)
    }

    /// Writes queued chunks to `writer` until the session terminates, then shuts the
    /// writer down. Run exactly once per session.
    pub async fn drain<W>(&self, mut writer: W)
    where
        W: AsyncWrite + Unpin,
    {
        while !self.session.is_terminated() {
            tokio::select! {
                biased;
                () = self.session.terminated() => break,
                () = self.wake.notified() => {}
            }

            // Let a burst of small pushes land before merging them.
            if !self.flush_due() {
                tokio::task::yield_now().await;
            }

            while !self.session.is_terminated() {
                let Some(batch) = self.next_batch() else {
                    break;
                };
                let written = tokio::select! {
                    biased;
                    () = self.session.terminated() => break,
                    result = writer.write_all(&batch) => result,
                };
                if let Err(e) = written {
                    debug!(error = %e, bytes = batch.len(), "Failed to write to target");
                    self.session.terminate(Cause::TargetWriteFailed);
                    break;
                }
                trace!(bytes = batch.len(), "Forwarded client data to target");
            }
        }

        if let Err(e) = writer.shutdown().await {
            debug!(error = %e, "Target writer shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io,
        pin::Pin,
        sync::Arc,
        task::{Context, Poll},
        time::Duration,
    };
    use tokio::time::{sleep, timeout};

    const TEST_TIMEOUT: Duration = Duration::from_secs(1);

    /// Records every individual write so coalescing is observable
    #[derive(Clone, Default)]
    struct RecordingWriter {
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
        shut_down: Arc<Mutex<bool>>,
    }

    impl RecordingWriter {
        fn writes(&self) -> Vec<Vec<u8>> {
            self.writes.lock().unwrap().clone()
        }
    }

    impl AsyncWrite for RecordingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.writes.lock().unwrap().push(buf.to_vec());
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            *self.shut_down.lock().unwrap() = true;
            Poll::Ready(Ok(()))
        }
    }

    fn chunk(byte: u8, len: usize) -> Bytes {
        Bytes::from(vec![byte; len])
    }

    mod queue {
        use super::*;

        #[test]
        fn fails_when_slots_are_exhausted() {
            let mut queue = UplinkQueue::new(2, 1024);
            queue.push(chunk(1, 1)).unwrap();
            queue.push(chunk(2, 1)).unwrap();
            assert_eq!(queue.push(chunk(3, 1)), Err(Overflow::Slots));
            assert_eq!(queue.len(), 2);
        }

        #[test]
        fn fails_when_byte_cap_would_be_exceeded() {
            let mut queue = UplinkQueue::new(8, 10);
            queue.push(chunk(1, 6)).unwrap();
            assert_eq!(queue.push(chunk(2, 5)), Err(Overflow::Bytes));
            queue.push(chunk(3, 4)).unwrap();
            assert_eq!(queue.queued_bytes(), 10);
        }

        #[test]
        fn merges_in_fifo_order() {
            let mut queue = UplinkQueue::new(8, 1024);
            queue.push(Bytes::from_static(b"A")).unwrap();
            queue.push(Bytes::from_static(b"BB")).unwrap();
            queue.push(Bytes::from_static(b"CCC")).unwrap();
            assert_eq!(queue.take_batch(16, 1024).unwrap(), &b"ABBCCC"[..]);
            assert!(queue.is_empty());
            assert_eq!(queue.queued_bytes(), 0);
        }

        #[test]
        fn caps_chunk_count_per_batch() {
            let mut queue = UplinkQueue::new(32, 1024);
            for i in 0..20 {
                queue.push(chunk(i, 1)).unwrap();
            }
            assert_eq!(queue.take_batch(16, 1024).unwrap().len(), 16);
            assert_eq!(queue.take_batch(16, 1024).unwrap().len(), 4);
            assert_eq!(queue.take_batch(16, 1024), None);
        }

        #[test]
        fn stops_before_merge_limit() {
            let mut queue = UplinkQueue::new(8, 1024);
            queue.push(chunk(1, 6)).unwrap();
            queue.push(chunk(2, 4)).unwrap();
            queue.push(chunk(3, 1)).unwrap();
            assert_eq!(queue.take_batch(16, 10).unwrap().len(), 10);
            assert_eq!(queue.take_batch(16, 10).unwrap(), chunk(3, 1));
        }

        #[test]
        fn oversized_chunk_goes_alone() {
            let mut queue = UplinkQueue::new(8, 1024);
            queue.push(chunk(1, 100)).unwrap();
            queue.push(chunk(2, 1)).unwrap();
            assert_eq!(queue.take_batch(16, 10).unwrap(), chunk(1, 100));
            assert_eq!(queue.take_batch(16, 10).unwrap(), chunk(2, 1));
        }
    }

    mod pipeline {
        use super::*;

        #[tokio::test]
        async fn coalesces_rapid_pushes_in_order() {
            let session = Session::new();
            let uplink = Uplink::new(&session, FlowConfig::default());
            let writer = RecordingWriter::default();

            let feeder = async {
                uplink.push(Bytes::from_static(b"A"));
                uplink.push(Bytes::from_static(b"BB"));
                uplink.push(Bytes::from_static(b"CCC"));
                sleep(Duration::from_millis(50)).await;
                session.terminate(Cause::ClientClosed);
            };
            timeout(TEST_TIMEOUT, async { tokio::join!(feeder, uplink.drain(writer.clone())) })
                .await
                .unwrap();

            assert_eq!(writer.writes(), vec![b"ABBCCC".to_vec()]);
            assert!(*writer.shut_down.lock().unwrap());
        }

        #[tokio::test]
        async fn preserves_order_across_batches() {
            let session = Session::new();
            let flow = FlowConfig {
                merge_max: 4,
                ..FlowConfig::default()
            };
            let uplink = Uplink::new(&session, flow);
            let writer = RecordingWriter::default();

            let feeder = async {
                for part in [&b"abc"[..], b"de", b"fgh", b"i"] {
                    uplink.push(Bytes::copy_from_slice(part));
                }
                sleep(Duration::from_millis(50)).await;
                session.terminate(Cause::ClientClosed);
            };
            timeout(TEST_TIMEOUT, async { tokio::join!(feeder, uplink.drain(writer.clone())) })
                .await
                .unwrap();

            let writes = writer.writes();
            assert_eq!(writes, vec![b"abc".to_vec(), b"de".to_vec(), b"fghi".to_vec()]);
        }

        #[tokio::test]
        async fn matches_expected_target_stream() {
            let session = Session::new();
            let uplink = Uplink::new(&session, FlowConfig::default());
            let target = tokio_test::io::Builder::new()
                .write(b"hello world")
                .build();

            let feeder = async {
                uplink.push(Bytes::from_static(b"hello"));
                uplink.push(Bytes::from_static(b" world"));
                sleep(Duration::from_millis(50)).await;
                session.terminate(Cause::ClientClosed);
            };
            timeout(TEST_TIMEOUT, async { tokio::join!(feeder, uplink.drain(target)) })
                .await
                .unwrap();
        }

        #[test]
        fn overflow_terminates_session_and_drops_later_pushes() {
            let session = Session::new();
            let flow = FlowConfig {
                queue_byte_cap: 16,
                merge_max: 16,
                ..FlowConfig::default()
            };
            let uplink = Uplink::new(&session, flow);

            uplink.push(chunk(1, 10));
            assert!(!session.is_terminated());
            uplink.push(chunk(2, 10));
            assert!(session.is_terminated());
            assert_eq!(session.cause(), Some(Cause::UplinkOverflow));

            uplink.push(chunk(3, 1));
            assert_eq!(uplink.queue().len(), 1);
        }

        #[tokio::test]
        async fn no_writes_after_overflow() {
            let session = Session::new();
            let flow = FlowConfig {
                queue_slots: 4,
                eager_slots: 4,
                ..FlowConfig::default()
            };
            let uplink = Uplink::new(&session, flow);
            let writer = RecordingWriter::default();

            // Fill past capacity before the drain ever runs.
            for i in 0..5 {
                uplink.push(chunk(i, 1));
            }
            assert!(session.is_terminated());

            timeout(TEST_TIMEOUT, uplink.drain(writer.clone()))
                .await
                .unwrap();
            assert!(writer.writes().is_empty());
        }

        #[tokio::test]
        async fn write_failure_terminates_session() {
            let session = Session::new();
            let uplink = Uplink::new(&session, FlowConfig::default());
            let target = tokio_test::io::Builder::new()
                .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
                .build();

            uplink.push(Bytes::from_static(b"payload"));
            timeout(TEST_TIMEOUT, uplink.drain(target)).await.unwrap();

            assert_eq!(session.cause(), Some(Cause::TargetWriteFailed));
        }

        #[tokio::test]
        async fn push_after_termination_is_ignored() {
            let session = Session::new();
            session.terminate(Cause::ClientClosed);
            let uplink = Uplink::new(&session, FlowConfig::default());
            uplink.push(Bytes::from_static(b"late"));
            assert!(uplink.queue().is_empty());
        }
    }
}
