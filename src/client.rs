//! The client WebSocket as the pipelines see it.
//!
//! Outbound messages go through an unbounded channel to a single writer, and the
//! bytes sitting in that channel or in flight are counted so the downlink can
//! observe the client's backlog. Inbound messages are fed to the uplink.

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::{
    future::poll_fn,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as TungsteniteError, Message, error::ProtocolError};
use tracing::{debug, error, warn};

use crate::downlink::{ClientSink, SinkClosed};
use crate::session::{Cause, Session};
use crate::uplink::Uplink;

/// Sending side handed to the downlink
#[derive(Debug)]
pub struct ClientOutbound {
    sender: mpsc::UnboundedSender<Bytes>,
    backlog: Arc<AtomicUsize>,
}

/// Receiving side consumed by [`run_client_writer`]
#[derive(Debug)]
pub struct ClientQueue {
    receiver: mpsc::UnboundedReceiver<Bytes>,
    backlog: Arc<AtomicUsize>,
}

#[must_use]
pub fn client_channel() -> (ClientOutbound, ClientQueue) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let backlog = Arc::new(AtomicUsize::new(0));
    (
        ClientOutbound {
            sender,
            backlog: backlog.clone(),
        },
        ClientQueue { receiver, backlog },
    )
}

impl ClientSink for ClientOutbound {
    fn send(&self, data: Bytes) -> Result<(), SinkClosed> {
        let len = data.len();
        self.backlog.fetch_add(len, Ordering::AcqRel);
        self.sender.send(data).map_err(|_| {
            self.backlog.fetch_sub(len, Ordering::AcqRel);
            SinkClosed
        })
    }

    fn buffered_amount(&self) -> usize {
        self.backlog.load(Ordering::Acquire)
    }
}

/// Writes queued messages to the client. Once the session ends, whatever the
/// downlink already queued is flushed within `close_grace`, then a Close frame is sent.
pub async fn run_client_writer<K>(
    session: &Session,
    mut sink: K,
    mut queue: ClientQueue,
    close_grace: Duration,
) where
    K: Sink<Message, Error = TungsteniteError> + Unpin,
{
    // A message the sink has not accepted yet. It stays here across termination
    // so the farewell flush sends it ahead of everything still queued.
    let mut held: Option<Bytes> = None;

    loop {
        let next = tokio::select! {
            biased;
            () = session.terminated() => None,
            message = queue.receiver.recv() => message,
        };
        let Some(data) = next else {
            break;
        };

        let len = data.len();
        held = Some(data);
        let sent = tokio::select! {
            biased;
            () = session.terminated() => break,
            result = deliver(&mut sink, &mut held) => result,
        };
        queue.backlog.fetch_sub(len, Ordering::AcqRel);

        if let Err(e) = sent {
            debug!(error = %e, bytes = len, "Failed to send WebSocket message");
            session.terminate(Cause::ClientSendFailed);
            break;
        }
    }

    queue.receiver.close();
    let farewell = async {
        if let Some(data) = held.take() {
            sink.feed(Message::Binary(data)).await?;
        }
        while let Ok(data) = queue.receiver.try_recv() {
            sink.feed(Message::Binary(data)).await?;
        }
        sink.close().await
    };
    match tokio::time::timeout(close_grace, farewell).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "WebSocket close failed"),
        Err(_) => debug!("WebSocket close timed out"),
    }
}

/// Hands the held message to the sink once it is ready, then flushes. The
/// message only leaves `held` when the sink takes ownership of it.
async fn deliver<K>(sink: &mut K, held: &mut Option<Bytes>) -> Result<(), TungsteniteError>
where
    K: Sink<Message, Error = TungsteniteError> + Unpin,
{
    poll_fn(|cx| sink.poll_ready_unpin(cx)).await?;
    if let Some(data) = held.take() {
        sink.start_send_unpin(Message::Binary(data))?;
    }
    sink.flush().await
}

/// Feeds client messages into the uplink until the client goes away or the
/// session ends
pub async fn pump_client_messages<St>(session: &Session, mut stream: St, uplink: &Uplink<'_>)
where
    St: Stream<Item = Result<Message, TungsteniteError>> + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            () = session.terminated() => return,
            message = stream.next() => message,
        };

        match next {
            Some(Ok(Message::Binary(data))) => uplink.push(data),
            Some(Ok(Message::Text(_))) => {
                warn!("Dropping text message (binary only)");
            }
            Some(Ok(Message::Close(_))) | None => {
                debug!("WebSocket connection closed");
                session.terminate(Cause::ClientClosed);
                return;
            }
            Some(Err(e)) => {
                match e {
                    TungsteniteError::ConnectionClosed
                    | TungsteniteError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                        debug!("Client disconnected: {e}");
                    }
                    _ => {
                        error!("WebSocket error: {e}");
                    }
                }
                session.terminate(Cause::ClientError);
                return;
            }
            Some(Ok(_)) => {}
        }
    }
}
