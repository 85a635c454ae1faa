use clap::{App, Arg};
use config::Config;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{event, Level};
use url::Url;

use crate::dialog::Message;
use crate::dispatcher::{Dispatcher, HandlerId};
use crate::networking::session::{SessionConfig, TransportSession};
use crate::networking::wire::{self, InboundMessage};
use crate::services::{LedgerService, SigningService};
use crate::storage::{ConversationStore, DialogSummary};
use crate::time::{create_timestamp, wire_seconds_to_millis};
use crate::{Error, Result};

/// Explicit session context: the current identity plus the transport and
/// store it operates over. Constructing one wires the inbound-message
/// subscription into the store, the single point where the two halves of
/// the core touch.
pub struct ChatClient {
    identity: String,
    session: Arc<TransportSession>,
    store: Arc<ConversationStore>,
    ledger: Option<Arc<dyn LedgerService>>,
}

impl ChatClient {
    /// The store bridge is wired at most once per dispatcher, so clients
    /// sharing a session must also share its store.
    pub fn new(
        identity: &str,
        session: Arc<TransportSession>,
        store: Arc<ConversationStore>,
    ) -> ChatClient {
        wire_inbound_messages(session.dispatcher(), store.clone());
        ChatClient {
            identity: identity.to_string(),
            session,
            store,
            ledger: None,
        }
    }

    /// Takes the registration identity from the signing collaborator.
    pub fn from_signer(
        signer: &dyn SigningService,
        session: Arc<TransportSession>,
        store: Arc<ConversationStore>,
    ) -> ChatClient {
        ChatClient::new(&signer.public_identity(), session, store)
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn LedgerService>) -> ChatClient {
        self.ledger = Some(ledger);
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn session(&self) -> &Arc<TransportSession> {
        &self.session
    }

    /// Connects if necessary and registers this client's identity with the
    /// relay.
    pub async fn register(&self) -> Result<()> {
        self.session.ensure_connected().await?;
        self.session.register(&self.identity).await?;
        Ok(())
    }

    /// Correlated send: the message is persisted locally only once the relay
    /// acknowledges it.
    pub async fn send_text(&self, to: &str, text: &str) -> Result<Message> {
        self.session.ensure_connected().await?;
        self.session.send_message(&self.identity, to, text).await?;
        self.store
            .append_message(&self.identity, to, text, create_timestamp())
            .await
    }

    pub async fn dialogs(&self) -> Result<Vec<DialogSummary>> {
        self.store.list_dialogs(&self.identity).await
    }

    pub async fn messages_with(&self, other: &str, limit: Option<usize>) -> Result<Vec<Message>> {
        self.store.list_messages(&self.identity, other, limit).await
    }

    pub async fn mark_read_from(&self, other: &str) -> Result<usize> {
        self.store
            .mark_read(&self.identity, other, &self.identity)
            .await
    }

    pub async fn unread_total(&self) -> Result<usize> {
        self.store.unread_total(&self.identity).await
    }

    pub async fn balance(&self) -> Result<u64> {
        match &self.ledger {
            Some(ledger) => ledger.query_balance(&self.identity).await,
            None => Err(Error::Config("no ledger service configured".into())),
        }
    }
}

/// Subscribes the store to inbound `message` events. Wire timestamps are
/// seconds; the store keeps milliseconds. Malformed payloads are dropped at
/// this boundary with a warning.
///
/// The bridge is identity-agnostic, so one subscription per dispatcher is
/// enough; a second would persist every inbound message twice. Returns
/// `None` when the dispatcher already carries a `message` bridge.
pub fn wire_inbound_messages(
    dispatcher: &Dispatcher,
    store: Arc<ConversationStore>,
) -> Option<HandlerId> {
    if dispatcher.handler_count(wire::EVENT_MESSAGE) > 0 {
        return None;
    }
    let id = dispatcher.subscribe(wire::EVENT_MESSAGE, move |payload| {
        let inbound: InboundMessage = match serde_json::from_value(payload.clone()) {
            Ok(inbound) => inbound,
            Err(err) => {
                event!(Level::WARN, "dropping malformed message payload: {}", err);
                return Ok(());
            }
        };
        let store = store.clone();
        tokio::spawn(async move {
            let timestamp = wire_seconds_to_millis(inbound.timestamp);
            if let Err(err) = store
                .append_message(&inbound.from, &inbound.to, &inbound.text, timestamp)
                .await
            {
                event!(Level::ERROR, "failed to persist inbound message: {}", err);
            }
        });
        Ok(())
    });
    Some(id)
}

/// Entry point for the binary: load settings, bring up a long-lived session
/// with reconnect-on-drop, register, then hold until ctrl-c.
pub async fn run() -> Result<()> {
    let matches = App::new("relaychat")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Text messaging through a multiplexing relay")
        .arg(
            Arg::with_name("address")
                .long("address")
                .takes_value(true)
                .help("identity to register with the relay"),
        )
        .arg(
            Arg::with_name("relay")
                .long("relay")
                .takes_value(true)
                .help("websocket url of the relay"),
        )
        .arg(
            Arg::with_name("data_dir")
                .long("data-dir")
                .takes_value(true)
                .help("directory for dialog and contact records"),
        )
        .get_matches();

    let mut settings = Config::default();
    // Missing config file is fine when flags cover everything.
    let _ = settings.merge(config::File::with_name("config"));

    let address = matches
        .value_of("address")
        .map(str::to_string)
        .or_else(|| settings.get::<String>("client.address").ok())
        .ok_or_else(|| Error::Config("client address missing (--address or client.address)".into()))?;
    let relay = matches
        .value_of("relay")
        .map(str::to_string)
        .or_else(|| settings.get::<String>("relay.url").ok())
        .ok_or_else(|| Error::Config("relay url missing (--relay or relay.url)".into()))?;
    let relay_url =
        Url::parse(&relay).map_err(|err| Error::Config(format!("invalid relay url: {}", err)))?;
    let data_dir = matches
        .value_of("data_dir")
        .map(str::to_string)
        .or_else(|| settings.get::<String>("storage.path").ok())
        .unwrap_or_else(|| String::from("./data/dialogs"));

    let mut session_config = SessionConfig::new(relay_url);
    session_config.reconnect_on_drop = true;
    if let Ok(ms) = settings.get::<u64>("relay.connect_timeout_ms") {
        session_config.connect_timeout = Duration::from_millis(ms);
    }
    if let Ok(ms) = settings.get::<u64>("relay.keepalive_interval_ms") {
        session_config.keepalive_interval = Duration::from_millis(ms);
    }
    if let Ok(ms) = settings.get::<u64>("relay.reconnect_delay_ms") {
        session_config.reconnect_delay = Duration::from_millis(ms);
    }

    let dispatcher = Arc::new(Dispatcher::new());
    let session = TransportSession::new(session_config, dispatcher);
    let store = Arc::new(ConversationStore::new(&data_dir)?);
    let client = ChatClient::new(&address, session.clone(), store);

    client.register().await?;
    event!(
        Level::INFO,
        "registered as {}, storing dialogs under {}",
        client.identity(),
        data_dir
    );

    tokio::select! {
        _ = signal::ctrl_c() => {
            event!(Level::INFO, "shutting down");
        }
    }
    session.close();
    Ok(())
}
