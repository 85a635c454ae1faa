/*!
# relaychat

A client for exchanging short text messages through a relay that multiplexes
many participants over a single duplex websocket.

The crate is split along its failure domains:

- [`networking::session`] owns the physical connection: connect with a
  bounded timeout, keepalive pings, automatic reconnection, and typed event
  fan-out of every inbound frame.
- [`networking::correlator`] turns fire-and-forget sends into awaitable
  calls by matching later inbound events to pending requests.
- [`dispatcher`] is the in-process event bus the two lean on.
- [`storage`] persists dialogs and the contact directory durably, tolerating
  crashes mid-write and corrupted records.

The halves meet only in [`client`], where inbound message events are wired
into store writes.
*/
pub mod client;
pub mod dialog;
pub mod dispatcher;
pub mod errors;
pub mod networking;
pub mod services;
pub mod storage;
pub mod time;

pub use crate::errors::{Error, Result, StorageError, TransportError};
