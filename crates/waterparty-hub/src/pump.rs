//! Per-client inbound and outbound pumps.
//!
//! A connection is any `Sink<WireFrame>` + `Stream<Item = Result<WireFrame>>`
//! pair, so the pumps run the same over a WebSocket or an in-memory channel.

use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::{ClientHandle, Mailbox};
use crate::config::HubConfig;
use crate::dispatch::Dispatcher;
use crate::error::HubError;

/// One transport frame, independent of the WebSocket library underneath.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping,
    Pong,
    Close,
}

/// Why a pump stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PumpExit {
    /// The peer closed the connection or the stream ended.
    PeerClosed,
    /// No pong arrived before the read deadline.
    TimedOut,
    /// The client was closed locally (unregistered, evicted, replaced).
    Closed,
    /// A read or write failed.
    Transport,
}

/// Read frames until the peer goes away, the read deadline passes, or the
/// client is closed. Oversize and malformed frames are dropped.
pub async fn run_inbound<S>(
    mut stream: S,
    client: &ClientHandle,
    dispatcher: &Dispatcher,
    config: &HubConfig,
) -> PumpExit
where
    S: Stream<Item = Result<WireFrame, HubError>> + Unpin,
{
    let pong_wait = config.pong_wait();
    let mut deadline = Instant::now() + pong_wait;

    loop {
        let next = tokio::select! {
            biased;
            () = client.closed() => return PumpExit::Closed,
            next = time::timeout_at(deadline, stream.next()) => next,
        };

        let frame = match next {
            Err(_) => {
                info!(user_id = %client.user_id(), "read deadline expired");
                return PumpExit::TimedOut;
            }
            Ok(None) => return PumpExit::PeerClosed,
            Ok(Some(Err(e))) => {
                debug!(user_id = %client.user_id(), error = %e, "read failed");
                return PumpExit::Transport;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            WireFrame::Pong => deadline = Instant::now() + pong_wait,
            WireFrame::Ping => {}
            WireFrame::Close => return PumpExit::PeerClosed,
            WireFrame::Text(text) => {
                if text.len() > config.max_frame_size {
                    drop_oversize(client, text.len(), config);
                    continue;
                }
                dispatcher.dispatch_frame(client, &text).await;
            }
            WireFrame::Binary(bytes) => {
                if bytes.len() > config.max_frame_size {
                    drop_oversize(client, bytes.len(), config);
                    continue;
                }
                match String::from_utf8(bytes) {
                    Ok(text) => dispatcher.dispatch_frame(client, &text).await,
                    Err(_) => debug!(user_id = %client.user_id(), "dropping non-utf8 frame"),
                }
            }
        }
    }
}

fn drop_oversize(client: &ClientHandle, len: usize, config: &HubConfig) {
    warn!(
        user_id = %client.user_id(),
        len,
        max = config.max_frame_size,
        "dropping oversize frame"
    );
}

/// Drain the mailbox to the connection, pinging on every tick.
///
/// On close the frames still queued are flushed, then a close frame is sent.
pub async fn run_outbound<K>(
    mut sink: K,
    client: &ClientHandle,
    mut mailbox: Mailbox,
    config: &HubConfig,
) -> PumpExit
where
    K: Sink<WireFrame, Error = HubError> + Unpin,
{
    let write_wait = config.write_wait();
    let period = config.ping_period();
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = client.closed() => {
                if let Some(batch) = mailbox.drain() {
                    let _ = write(&mut sink, WireFrame::Text(batch), write_wait).await;
                }
                let _ = write(&mut sink, WireFrame::Close, write_wait).await;
                let _ = time::timeout(write_wait, sink.close()).await;
                return PumpExit::Closed;
            }
            next = mailbox.recv() => {
                let Some(first) = next else {
                    let _ = write(&mut sink, WireFrame::Close, write_wait).await;
                    return PumpExit::Closed;
                };
                let batch = mailbox.coalesce(first);
                if let Err(e) = write(&mut sink, WireFrame::Text(batch), write_wait).await {
                    debug!(user_id = %client.user_id(), error = %e, "write failed");
                    return PumpExit::Transport;
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = write(&mut sink, WireFrame::Ping, write_wait).await {
                    debug!(user_id = %client.user_id(), error = %e, "ping failed");
                    return PumpExit::Transport;
                }
            }
        }
    }
}

async fn write<K>(sink: &mut K, frame: WireFrame, wait: Duration) -> Result<(), HubError>
where
    K: Sink<WireFrame, Error = HubError> + Unpin,
{
    match time::timeout(wait, sink.send(frame)).await {
        Ok(result) => result,
        Err(_) => Err(HubError::WriteTimeout(wait)),
    }
}

/// Run both pumps for a registered client. When either stops the client is
/// unregistered, which closes the other.
pub async fn serve_client<K, S>(
    dispatcher: Arc<Dispatcher>,
    client: ClientHandle,
    mailbox: Mailbox,
    sink: K,
    stream: S,
    config: HubConfig,
) -> PumpExit
where
    K: Sink<WireFrame, Error = HubError> + Send + Unpin + 'static,
    S: Stream<Item = Result<WireFrame, HubError>> + Send + Unpin + 'static,
{
    let hub = dispatcher.hub().clone();

    let mut outbound = tokio::spawn({
        let client = client.clone();
        let config = config.clone();
        async move { run_outbound(sink, &client, mailbox, &config).await }
    });
    let mut inbound = tokio::spawn({
        let client = client.clone();
        async move { run_inbound(stream, &client, &dispatcher, &config).await }
    });

    let (side, exit) = tokio::select! {
        exit = &mut inbound => {
            hub.unregister(&client).await;
            let _ = (&mut outbound).await;
            ("inbound", exit)
        }
        exit = &mut outbound => {
            hub.unregister(&client).await;
            let _ = (&mut inbound).await;
            ("outbound", exit)
        }
    };

    let exit = exit.unwrap_or_else(|e| {
        warn!(user_id = %client.user_id(), error = %e, "pump task failed");
        PumpExit::Transport
    });
    info!(
        user_id = %client.user_id(),
        connection_id = %client.connection_id(),
        side,
        ?exit,
        connected_secs = client.age().as_secs(),
        "client disconnected"
    );
    exit
}
