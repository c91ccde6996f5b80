//! Client engine for the debugger wire protocol (DWP) spoken by managed-runtime
//! debuggees.
//!
//! The crate is layered bottom-up:
//!
//! - [`codec`]: big-endian framing and the tagged [`Value`] encoding.
//! - [`transport`]: any split-able ordered byte stream (TCP, in-memory pipes).
//! - [`connection`]: the protocol engine. Handshake, version negotiation,
//!   request/reply correlation, buffering, and disconnect/crash teardown.
//! - [`events`], [`subscription`], [`invoke`]: event decoding, event requests
//!   and the remote-invocation sub-protocol.
//! - [`session`]: one connection plus the event queue, the subscription
//!   registry and per-kind identity caches of [`mirror`] handles.
//!
//! Per-command accessors live on [`Connection`] (see `accessors.rs`) and are
//! gated on the negotiated protocol version before anything is sent.

mod accessors;
pub mod cache;
pub mod codec;
pub mod commands;
pub mod connection;
pub mod error;
pub mod events;
pub mod invoke;
pub mod mirror;
mod poison;
pub mod session;
pub mod subscription;
pub mod transport;
pub mod types;

#[cfg(any(test, feature = "wire-test-support"))]
pub mod mock;

pub use cache::IdentityCache;
pub use codec::{
    decode_packet_bytes, decode_value_bytes, validate_packet_length, DwpReader, DwpWriter, Packet,
};
pub use connection::{Connection, ConnectionConfig, ConnectionState, PendingReplies};
pub use error::{DwpError, Result};
pub use events::{EventDetail, EventKind, EventRecord, EventSet};
pub use invoke::{InvokeBatch, InvokeOptions, InvokeOutcome, InvokeResult, PendingInvoke};
pub use mirror::{Mirror, ObjectKind};
pub use session::Session;
pub use subscription::{EventFilter, Subscription, SubscriptionRegistry};
pub use transport::{connect_tcp, TcpConfig, Transport};
pub use types::{Feature, ObjectTag, SuspendPolicy, Value, VersionInfo, VmVersion};
