//! Target to client pipeline.
//!
//! Reads the target in short bursts whose length adapts to the client's outbound
//! backlog, pausing entirely while the backlog sits above the high-water mark.
//! The first chunk is prefixed with the reply preamble.

use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use crate::config::FlowConfig;
use crate::protocol::RESPONSE_HEADER;
use crate::session::{Cause, Session};

/// Reads per burst while the client keeps up
pub const FAST_BURST: usize = 8;
/// Reads per burst while the client lags
pub const SLOW_BURST: usize = 2;

/// Yields spent re-checking the backlog before falling back to timed waits
const BACKLOG_SPIN_LIMIT: u32 = 20;
const BACKLOG_BACKOFF_MIN: Duration = Duration::from_millis(1);
const BACKLOG_BACKOFF_MAX: Duration = Duration::from_millis(32);

/// Outbound half of the client transport as the downlink sees it
pub trait ClientSink {
    /// Queues one binary message without waiting for it to be flushed
    fn send(&self, data: Bytes) -> Result<(), SinkClosed>;

    /// Bytes queued for the client but not yet flushed
    fn buffered_amount(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("client sink is closed")]
pub struct SinkClosed;

/// Forwards target data to the client until the session ends.
/// End of stream from the target terminates the session.
pub async fn run_downlink<R, C>(session: &Session, mut target: R, client: &C, flow: &FlowConfig)
where
    R: AsyncRead + Unpin,
    C: ClientSink + ?Sized,
{
    let mut first = true;
    let mut buffer = BytesMut::with_capacity(flow.read_buffer_size);

    while !session.is_terminated() {
        if client.buffered_amount() > flow.ws_high_water {
            wait_for_backlog(session, client, flow.ws_low_water).await;
            if session.is_terminated() {
                break;
            }
        }

        let burst = if client.buffered_amount() < flow.ws_low_water {
            FAST_BURST
        } else {
            SLOW_BURST
        };

        for _ in 0..burst {
            buffer.reserve(flow.read_buffer_size);
            let read = tokio::select! {
                biased;
                () = session.terminated() => return,
                result = target.read_buf(&mut buffer) => result,
            };

            let chunk = match read {
                Ok(0) => {
                    debug!("Target connection closed");
                    session.terminate(Cause::TargetClosed);
                    return;
                }
                Ok(_) => buffer.split().freeze(),
                Err(e) => {
                    debug!(error = %e, "Failed to read from target");
                    session.terminate(Cause::TargetReadFailed);
                    return;
                }
            };

            let message = if first {
                first = false;
                frame_first_chunk(&chunk)
            } else {
                chunk
            };

            trace!(bytes = message.len(), "Forwarding target data to client");
            if client.send(message).is_err() {
                session.terminate(Cause::ClientSendFailed);
                return;
            }

            if client.buffered_amount() > flow.ws_high_water {
                break;
            }
        }
    }
}

fn frame_first_chunk(chunk: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(RESPONSE_HEADER.len() + chunk.len());
    frame.extend_from_slice(&RESPONSE_HEADER);
    frame.extend_from_slice(chunk);
    frame.freeze()
}

/// Waits until the client backlog drops below `low_water` or the session ends.
/// Spins on scheduler yields first, then backs off with growing sleeps.
async fn wait_for_backlog<C>(session: &Session, client: &C, low_water: usize)
where
    C: ClientSink + ?Sized,
{
    let mut spins = 0;
    let mut backoff = BACKLOG_BACKOFF_MIN;

    while !session.is_terminated() && client.buffered_amount() >= low_water {
        if spins < BACKLOG_SPIN_LIMIT {
            spins += 1;
            tokio::task::yield_now().await;
            continue;
        }

        tokio::select! {
            biased;
            () = session.terminated() => return,
            () = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(BACKLOG_BACKOFF_MAX);
    }
}
