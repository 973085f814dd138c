//! Per-connection actor.
//!
//! Each WebSocket gets two halves. The read half runs on the connection
//! task: it decodes inbound frames, stores them through the message service
//! and hands the results to the hub. The write half is spawned and is the
//! only writer on the socket: it drains the hub queue, pings on an interval
//! and closes the socket when the queue closes or the snapshot expires.

use crate::config::Config;
use crate::handlers::AppState;
use crate::metrics::{self, ConnectionMetricsGuard};
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitStream;
use futures_util::{Sink, SinkExt, StreamExt};
use huddle_protocol::Address;
use std::sync::Arc;
use std::time::Duration;
use tenvis_huddle_core::{ChatError, ClientId, ConnectionSnapshot, MessageTarget};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

/// Close code sent when the connection snapshot has expired.
pub const CLOSE_SNAPSHOT_EXPIRED: u16 = 4000;

/// Timing for one connection.
#[derive(Debug, Clone, Copy)]
pub struct ClientSettings {
    pub ping_interval: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl From<&Config> for ClientSettings {
    fn from(config: &Config) -> Self {
        Self {
            ping_interval: config.heartbeat.interval(),
            read_timeout: config.heartbeat.timeout(),
            write_timeout: config.heartbeat.write_timeout(),
        }
    }
}

/// Why the write half stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteExit {
    /// The hub dropped this client's queue.
    QueueClosed,
    /// The snapshot expired; the client should reconnect.
    Expired,
    /// A write failed or timed out.
    Failed,
}

/// Why the read half stopped.
#[derive(Debug)]
enum ReadExit {
    Closed,
    Error,
    Timeout,
    Writer(WriteExit),
}

/// Drive one WebSocket until either half stops.
pub async fn serve(socket: WebSocket, state: Arc<AppState>, snapshot: Arc<ConnectionSnapshot>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let user_id = snapshot.user_id;

    let (client_id, outbound) = match state.hub.register(Arc::clone(&snapshot)).await {
        Ok(registered) => registered,
        Err(e) => {
            warn!(user_id, error = %e, "Hub unavailable, dropping connection");
            return;
        }
    };
    info!(client_id, user_id, "Client connected");

    let settings = ClientSettings::from(&state.config);
    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(write_pump(
        sink,
        outbound,
        settings,
        snapshot.expires_at(),
    ));

    let exit = read_pump(stream, &state, &snapshot, client_id, settings, &mut writer).await;

    if let Err(e) = state.hub.unregister(client_id).await {
        warn!(client_id, error = %e, "Failed to unregister client");
    }
    if !matches!(exit, ReadExit::Writer(_)) {
        // Unregistering closes the queue, which makes the writer send a
        // close frame and stop.
        if timeout(settings.write_timeout, &mut writer).await.is_err() {
            writer.abort();
        }
    }

    info!(client_id, user_id, reason = ?exit, "Client disconnected");
}

async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    state: &AppState,
    snapshot: &ConnectionSnapshot,
    client_id: ClientId,
    settings: ClientSettings,
    writer: &mut JoinHandle<WriteExit>,
) -> ReadExit {
    let mut deadline = Instant::now() + settings.read_timeout;

    loop {
        tokio::select! {
            joined = &mut *writer => {
                let exit = joined.unwrap_or(WriteExit::Failed);
                if exit == WriteExit::QueueClosed {
                    warn!(client_id, user_id = snapshot.user_id, "Evicted by hub");
                    metrics::record_outbound_closed();
                }
                return ReadExit::Writer(exit);
            }
            next = timeout_at(deadline, stream.next()) => {
                let message = match next {
                    Err(_) => {
                        debug!(client_id, "Read deadline lapsed");
                        return ReadExit::Timeout;
                    }
                    Ok(None) => return ReadExit::Closed,
                    Ok(Some(Err(e))) => {
                        debug!(client_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        return ReadExit::Error;
                    }
                    Ok(Some(Ok(message))) => message,
                };

                match message {
                    Message::Text(text) => handle_frame(state, snapshot, text.as_bytes()).await,
                    Message::Binary(data) => handle_frame(state, snapshot, &data).await,
                    Message::Pong(_) => deadline = Instant::now() + settings.read_timeout,
                    Message::Ping(_) => {}
                    Message::Close(_) => return ReadExit::Closed,
                }
            }
        }
    }
}

async fn handle_frame(state: &AppState, snapshot: &ConnectionSnapshot, data: &[u8]) {
    let user_id = snapshot.user_id;
    metrics::record_frame(data.len(), "inbound");

    if snapshot.is_expired() {
        debug!(user_id, "Dropping frame read after snapshot expiry");
        metrics::record_dropped_frame("expired");
        return;
    }

    let frame = match state.codec.decode_inbound(data) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(user_id, error = %e, "Dropping undecodable frame");
            metrics::record_dropped_frame("decode");
            return;
        }
    };
    if frame.is_blank() {
        metrics::record_dropped_frame("blank");
        return;
    }
    let Some(address) = frame.address() else {
        debug!(user_id, "Dropping frame without an address");
        metrics::record_dropped_frame("unaddressed");
        return;
    };

    let target = match address {
        Address::Conversation(id) => MessageTarget::Conversation(id),
        Address::Team(id) => MessageTarget::LegacyTeam(id),
        Address::Recipient(id) => MessageTarget::LegacyDirect(id),
    };

    let started = Instant::now();
    match state.messages.send(target, user_id, &frame.content).await {
        Ok(sent) => {
            state.publish(&sent).await;
            metrics::record_send_latency(started.elapsed().as_secs_f64());
        }
        Err(ChatError::Blocked) => {
            metrics::record_dropped_frame("blocked");
        }
        Err(e) => {
            warn!(user_id, ?target, error = %e, "Message rejected");
            metrics::record_dropped_frame("rejected");
        }
    }
}

async fn write_pump<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<Arc<str>>,
    settings: ClientSettings,
    expires_at: Instant,
) -> WriteExit
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let mut ping = tokio::time::interval_at(
        Instant::now() + settings.ping_interval,
        settings.ping_interval,
    );
    let expiry = tokio::time::sleep_until(expires_at);
    tokio::pin!(expiry);

    let exit = loop {
        // Unbiased so a busy queue cannot starve pings.
        tokio::select! {
            queued = outbound.recv() => match queued {
                Some(payload) => {
                    let batch = write_batch(&mut sink, payload, &mut outbound);
                    if !matches!(timeout(settings.write_timeout, batch).await, Ok(Ok(()))) {
                        break WriteExit::Failed;
                    }
                }
                None => break WriteExit::QueueClosed,
            },
            _ = ping.tick() => {
                let sent = timeout(settings.write_timeout, sink.send(Message::Ping(Vec::new()))).await;
                if !matches!(sent, Ok(Ok(()))) {
                    break WriteExit::Failed;
                }
            }
            () = &mut expiry => break WriteExit::Expired,
        }
    };

    let close = match exit {
        WriteExit::Expired => Some(CloseFrame {
            code: CLOSE_SNAPSHOT_EXPIRED,
            reason: "session expired".into(),
        }),
        WriteExit::QueueClosed | WriteExit::Failed => None,
    };
    let _ = timeout(settings.write_timeout, sink.send(Message::Close(close))).await;
    exit
}

/// Write one payload plus whatever else is already queued, then flush once.
async fn write_batch<S>(
    sink: &mut S,
    first: Arc<str>,
    outbound: &mut mpsc::Receiver<Arc<str>>,
) -> Result<(), axum::Error>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    sink.feed(Message::Text(first.to_string())).await?;
    while let Ok(payload) = outbound.try_recv() {
        sink.feed(Message::Text(payload.to_string())).await?;
    }
    sink.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::sink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings(ping_interval: Duration) -> ClientSettings {
        ClientSettings {
            ping_interval,
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
        }
    }

    /// A sink that counts pings and accepts everything else.
    fn ping_counter(pings: &Arc<AtomicUsize>) -> impl Sink<Message, Error = axum::Error> + Unpin {
        let pings = Arc::clone(pings);
        Box::pin(sink::unfold((), move |(), message: Message| {
            let pings = Arc::clone(&pings);
            async move {
                if matches!(message, Message::Ping(_)) {
                    pings.fetch_add(1, Ordering::SeqCst);
                }
                Ok::<_, axum::Error>(())
            }
        }))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pings_continue_while_queue_is_busy() {
        let pings = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel(8);

        let producer = tokio::spawn(async move {
            let payload: Arc<str> = Arc::from("{}");
            while tx.send(Arc::clone(&payload)).await.is_ok() {}
        });
        let writer = tokio::spawn(write_pump(
            ping_counter(&pings),
            rx,
            settings(Duration::from_millis(20)),
            Instant::now() + Duration::from_secs(60),
        ));

        let deadline = Instant::now() + Duration::from_secs(5);
        while pings.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "no ping sent under load");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        writer.abort();
        producer.abort();
    }

    #[tokio::test]
    async fn test_writer_stops_when_queue_closes() {
        let pings = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel(8);
        tx.send(Arc::from("{}")).await.unwrap();
        drop(tx);

        let exit = write_pump(
            ping_counter(&pings),
            rx,
            settings(Duration::from_secs(30)),
            Instant::now() + Duration::from_secs(60),
        )
        .await;
        assert_eq!(exit, WriteExit::QueueClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_reports_expiry() {
        let pings = Arc::new(AtomicUsize::new(0));
        let (_tx, rx) = mpsc::channel(8);

        let exit = write_pump(
            ping_counter(&pings),
            rx,
            settings(Duration::from_secs(30)),
            Instant::now() + Duration::from_secs(5),
        )
        .await;
        assert_eq!(exit, WriteExit::Expired);
    }
}
