//! Core engine of the Reticulum network stack: packet framing, identities
//! and destinations, announce propagation, authenticated encrypted links and
//! windowed resource transfer, all running over byte-framed interfaces.
//!
//! The engine is a value, not a process-wide singleton: construct a
//! [`transport::Transport`] with a [`transport::TransportConfig`], attach
//! interfaces, register destinations, and watch its event streams.

pub mod buffer;
pub mod crypt;
pub mod destination;
pub mod error;
pub mod hash;
pub mod identity;
pub mod iface;
pub mod packet;
pub mod receipt;
pub mod resource;
pub mod transport;

pub use crate::destination::link::{Link, LinkEvent, LinkEventData, LinkId, LinkStatus};
pub use crate::destination::{
    DestinationName, SingleInputDestination, SingleOutputDestination,
};
pub use crate::error::CoreError;
pub use crate::hash::{Sha256Hash, TruncatedHash};
pub use crate::identity::{Identity, PrivateIdentity};
pub use crate::packet::Packet;
pub use crate::transport::{Transport, TransportConfig};
