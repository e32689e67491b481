//! valkey-cluster-client
//!
//! A cluster-aware client for Valkey-compatible servers. Commands are
//! routed to the primary owning their key's hash slot; `MOVED`/`ASK`/
//! `TRYAGAIN` redirections are followed transparently; topology
//! refreshes are coalesced so a redirect storm costs one query. Read
//! commands can be served from a per-connection client-side cache, a
//! dedicated session pins one wire for transactional work, and the
//! repository layer maps typed records onto hash entities guarded by an
//! optimistic version field.

pub mod client;
pub mod cluster;
pub mod command;
pub mod config;
pub mod repo;
pub mod script;
pub mod utils;

#[cfg(test)]
pub(crate) mod testkit;

pub use client::{Conn, ConnFactory, NodeConnection, Wire};
pub use cluster::{ClusterClient, DedicatedSession};
pub use command::{Command, CommandBuilder, ANY_SLOT, SLOT_COUNT};
pub use config::{AuthConfig, ClusterOptions, ConnectionOptions, PubSubHandlers, SubscribeSource};
pub use repo::{HashRecord, HashRepository, VERSION_FIELD};
pub use script::Script;
pub use utils::{ClientError, ProtocolError, Redirect, RespValue, Result};
