//! Clients for the external daemons the runtime consumes.
//!
//! The manager allocates subid ranges and provisions backing directories for
//! special container paths; the filesystem virtualizer serves virtualized
//! `/proc` and `/sys` views. Both are reached over RPC whose transport is
//! owned by the embedding runtime; the core consumes them through the
//! [`manager::ManagerRpc`] and [`virtualizer::VirtualizerRpc`] traits.

pub mod manager;
pub mod virtualizer;
