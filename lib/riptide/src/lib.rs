//! `riptide` is a connection-oriented, encrypted, message transport layered on unreliable
//! datagrams. A `Host` owns one datagram endpoint and any number of `Peer` connections;
//! each peer carries a negotiated set of channels, and every channel delivers discrete
//! messages under its own reliability and ordering discipline.
//!
//! All protocol state advances inside `Host::service`, which the application pumps on a
//! single thread. Multiple hosts may run concurrently, each on its own thread.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

/// Wire magic. Datagrams not leading with this word are dropped before parsing.
pub const PROTOCOL_MAGIC: u32 = 0x5249_5054;

/// Incompatible protocol revisions bump this.
pub const PROTOCOL_VERSION: u8 = 1;

pub mod address;
pub mod channel;
pub mod command;
pub mod compress;
pub mod config;
pub mod event;
pub mod frame;
pub mod host;
pub mod network;
pub mod peer;
pub mod support;

pub use crate::address::{Address, FamilyMode};
pub use crate::channel::ChannelKind;
pub use crate::compress::{Compressor, DeflateCompressor};
pub use crate::config::{Config, SimulatorConfig, ThrottleConfig};
pub use crate::event::{DenialReason, Event, PeerHandle};
pub use crate::host::{Host, Instance};
pub use crate::network::{Network, SwitchFabric};
pub use crate::support::{ErrorType, NetworkError, NetworkResult};
