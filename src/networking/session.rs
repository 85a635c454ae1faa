use futures::stream::{SplitSink, SplitStream};
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{event, Level};
use url::Url;

use crate::dispatcher::Dispatcher;
use crate::networking::correlator::{Correlator, FrameSink, ReplyMatch};
use crate::networking::wire::{self, OutboundFrame};
use crate::time::create_timestamp;
use crate::{Result, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal, reached only by explicit shutdown.
    Closed,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub relay_url: Url,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub reconnect_delay: Duration,
    pub register_timeout: Duration,
    pub send_timeout: Duration,
    /// Long-lived interactive mode: schedule one reconnect attempt after an
    /// unexpected close. One-shot callers leave this off and rely on
    /// `ensure_connected` instead.
    pub reconnect_on_drop: bool,
}

impl SessionConfig {
    pub fn new(relay_url: Url) -> SessionConfig {
        SessionConfig {
            relay_url,
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
            register_timeout: Duration::from_secs(10),
            // Message delivery may need relay-side routing, so it gets a
            // longer deadline than registration.
            send_timeout: Duration::from_secs(15),
            reconnect_on_drop: false,
        }
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// One logical duplex connection to the relay. Owns the physical websocket,
/// its keepalive timer and reconnection handling, republishes every decoded
/// inbound frame through the dispatcher, and exposes the correlator-backed
/// operations (`register`, `send_message`).
pub struct TransportSession {
    config: SessionConfig,
    dispatcher: Arc<Dispatcher>,
    correlator: Correlator,
    state: Mutex<SessionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    // Held for the duration of a physical connect so concurrent connect()
    // callers wait on the in-flight attempt instead of dialing again.
    connect_gate: tokio::sync::Mutex<()>,
    physical_attempts: AtomicUsize,
    // Handle to ourselves for the tasks we spawn; if the session is gone
    // they simply wind down.
    me: Weak<TransportSession>,
}

impl TransportSession {
    pub fn new(config: SessionConfig, dispatcher: Arc<Dispatcher>) -> Arc<TransportSession> {
        Arc::new_cyclic(|me| TransportSession {
            config,
            correlator: Correlator::new(dispatcher.clone()),
            dispatcher,
            state: Mutex::new(SessionState::Disconnected),
            outbound: Mutex::new(None),
            keepalive: Mutex::new(None),
            connect_gate: tokio::sync::Mutex::new(()),
            physical_attempts: AtomicUsize::new(0),
            me: me.clone(),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, next: SessionState) {
        *self.state.lock().unwrap() = next;
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Physical dial count, for observability and tests.
    pub fn physical_attempts(&self) -> usize {
        self.physical_attempts.load(Ordering::SeqCst)
    }

    /// Opens the physical connection unless one is already up. Concurrent
    /// calls while an attempt is in flight await that attempt's outcome.
    pub async fn connect(&self) -> Result<()> {
        match self.state() {
            SessionState::Connected => return Ok(()),
            SessionState::Closed => return Err(TransportError::SessionClosed.into()),
            _ => {}
        }
        let _gate = self.connect_gate.lock().await;
        match self.state() {
            // The attempt this call waited on already settled things.
            SessionState::Connected => return Ok(()),
            SessionState::Closed => return Err(TransportError::SessionClosed.into()),
            _ => {}
        }

        self.set_state(SessionState::Connecting);
        self.physical_attempts.fetch_add(1, Ordering::SeqCst);
        let attempt = connect_async(self.config.relay_url.clone());
        let ws_stream = match tokio::time::timeout(self.config.connect_timeout, attempt).await {
            Err(_) => {
                self.set_state(SessionState::Disconnected);
                return Err(TransportError::ConnectTimeout.into());
            }
            Ok(Err(error)) => {
                self.set_state(SessionState::Disconnected);
                return Err(TransportError::ConnectRefused(error.to_string()).into());
            }
            Ok(Ok((ws_stream, _response))) => ws_stream,
        };

        let (write_sink, read_stream) = ws_stream.split();
        let sender = self.spawn_writer(write_sink);
        {
            // Commit under the state lock: close() may have landed while
            // the dial was in flight, and Closed is terminal. Dropping the
            // sender ends the writer task and with it the fresh stream.
            let mut state = self.state.lock().unwrap();
            if *state == SessionState::Closed {
                return Err(TransportError::SessionClosed.into());
            }
            *self.outbound.lock().unwrap() = Some(sender.clone());
            *self.keepalive.lock().unwrap() = Some(self.spawn_keepalive(sender));
            *state = SessionState::Connected;
        }
        // No stream-end event can exist until the reader does, so spawning
        // it after the commit keeps its Disconnected transition ordered
        // after ours.
        self.spawn_reader(read_stream);
        event!(Level::INFO, "connected to relay {}", self.config.relay_url);
        Ok(())
    }

    /// Connects only if not already connected; bounded polled wait while an
    /// attempt from elsewhere is in progress.
    pub async fn ensure_connected(&self) -> Result<()> {
        let deadline = Instant::now() + self.config.connect_timeout;
        loop {
            match self.state() {
                SessionState::Connected => return Ok(()),
                SessionState::Closed => return Err(TransportError::SessionClosed.into()),
                SessionState::Connecting => {
                    if Instant::now() >= deadline {
                        return Err(TransportError::ConnectTimeout.into());
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                SessionState::Disconnected => return self.connect().await,
            }
        }
    }

    /// Stops keepalive and tears the connection down. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        self.stop_keepalive();
        // Dropping the sender ends the writer-forward task, which flushes
        // and closes the websocket sink.
        self.outbound.lock().unwrap().take();
        event!(Level::INFO, "session closed");
    }

    /// Registers `address` with the relay and awaits the matching
    /// `registered` acknowledgment.
    pub async fn register(&self, address: &str) -> Result<Value> {
        let want = address.to_string();
        self.correlator
            .send_and_await(
                self,
                OutboundFrame::register(address),
                ReplyMatch::on(wire::EVENT_REGISTERED, move |payload| {
                    payload.get("address").and_then(Value::as_str) == Some(want.as_str())
                }),
                self.config.register_timeout,
            )
            .await
    }

    /// Sends a text to `to` and awaits the relay's `messageSent` ack for
    /// that recipient, failing early on a `messageError`.
    pub async fn send_message(&self, from: &str, to: &str, text: &str) -> Result<Value> {
        let want = to.to_string();
        self.correlator
            .send_and_await(
                self,
                OutboundFrame::message(from, to, text),
                ReplyMatch::on(wire::EVENT_MESSAGE_SENT, move |payload| {
                    payload.get("to").and_then(Value::as_str) == Some(want.as_str())
                })
                .with_failure(wire::EVENT_MESSAGE_ERROR),
                self.config.send_timeout,
            )
            .await
    }

    fn spawn_writer(&self, write_sink: WsSink) -> mpsc::UnboundedSender<WsMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = UnboundedReceiverStream::new(receiver).map(Ok);
        tokio::spawn(receiver.forward(write_sink).map(|result| {
            if let Err(error) = result {
                event!(Level::ERROR, "error writing to relay socket: {}", error);
            }
        }));
        sender
    }

    fn spawn_keepalive(&self, sender: mpsc::UnboundedSender<WsMessage>) -> JoinHandle<()> {
        let interval = self.config.keepalive_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // interval fires immediately; the connection is fresh, skip it
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let frame = OutboundFrame::ping(create_timestamp());
                if sender.send(WsMessage::Text(frame.encode())).is_err() {
                    break;
                }
            }
        })
    }

    fn stop_keepalive(&self) {
        if let Some(handle) = self.keepalive.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Dispatches inbound frames in arrival order until the stream ends.
    fn spawn_reader(&self, mut read_stream: WsSource) {
        let session = match self.me.upgrade() {
            Some(session) => session,
            None => return,
        };
        tokio::spawn(async move {
            while let Some(result) = read_stream.next().await {
                match result {
                    Ok(WsMessage::Text(raw)) => match wire::decode_frame(&raw) {
                        Some((kind, payload)) => session.dispatcher.publish(&kind, &payload),
                        None => event!(Level::WARN, "dropping malformed inbound frame"),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(error) => {
                        event!(Level::ERROR, "error reading from relay socket: {}", error);
                        break;
                    }
                }
            }
            session.handle_stream_end();
        });
    }

    /// Unexpected close: stop keepalive, drop back to `Disconnected`, and in
    /// long-lived mode schedule exactly one reconnect attempt. A failed
    /// retry is logged and swallowed; the next caller-initiated operation
    /// retries via `ensure_connected`.
    fn handle_stream_end(&self) {
        if self.state() == SessionState::Closed {
            return;
        }
        self.stop_keepalive();
        self.outbound.lock().unwrap().take();
        self.set_state(SessionState::Disconnected);
        event!(Level::INFO, "relay connection lost");
        if self.config.reconnect_on_drop {
            let session = match self.me.upgrade() {
                Some(session) => session,
                None => return,
            };
            tokio::spawn(async move {
                tokio::time::sleep(session.config.reconnect_delay).await;
                if session.state() != SessionState::Disconnected {
                    return;
                }
                if let Err(error) = session.connect().await {
                    event!(Level::WARN, "scheduled reconnect failed: {}", error);
                }
            });
        }
    }
}

impl FrameSink for TransportSession {
    fn send_frame(&self, frame: &OutboundFrame) -> Result<()> {
        let outbound = self.outbound.lock().unwrap();
        match outbound.as_ref() {
            Some(sender) => sender
                .send(WsMessage::Text(frame.encode()))
                .map_err(|_| TransportError::ChannelClosed.into()),
            None => Err(TransportError::ChannelClosed.into()),
        }
    }
}
