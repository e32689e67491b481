//! Connection contract consumed by the cluster dispatcher
//!
//! A [`NodeConnection`] is the client's handle to one node address. It is
//! shared by the topology cache, the dispatcher, and any dedicated
//! sessions that borrow a wire from it, so implementations must be safe
//! for concurrent submits. The factory performs no IO: connections dial
//! lazily on first use.

use std::sync::Arc;
use std::time::Duration;

use crate::command::Command;
use crate::config::ConnectionOptions;
use crate::utils::{RespValue, Result};

/// Shared handle to a per-node connection
pub type Conn = Arc<dyn NodeConnection>;

/// Creates a connection handle for an address; must not block
pub type ConnFactory = Arc<dyn Fn(&str, &ConnectionOptions) -> Conn + Send + Sync>;

/// An exclusive wire borrowed from a connection for a dedicated session
pub trait Wire: Send {
    /// Submit a single command and await its reply
    fn submit(&mut self, cmd: &Command) -> Result<RespValue>;

    /// Submit a pipeline and await all replies in order
    fn submit_multi(&mut self, cmds: &[&Command]) -> Result<Vec<RespValue>>;
}

/// Client-owned handle for a specific node address
pub trait NodeConnection: Send + Sync {
    /// The node address this connection serves
    fn addr(&self) -> &str;

    /// Establish the transport eagerly (bootstrap path)
    fn dial(&self) -> Result<()>;

    /// Submit a single command, await the reply
    fn submit(&self, cmd: &Command) -> Result<RespValue>;

    /// Submit a pipeline, await all replies in order
    fn submit_multi(&self, cmds: &[&Command]) -> Result<Vec<RespValue>>;

    /// Submit a cacheable read, honouring the reply cache with `ttl`
    fn submit_cached(&self, cmd: &Command, ttl: Duration) -> Result<RespValue>;

    /// Borrow an exclusive wire for a dedicated session
    fn acquire_wire(&self) -> Result<Box<dyn Wire>>;

    /// Return a borrowed wire; the connection may recycle or discard it
    fn return_wire(&self, wire: Box<dyn Wire>);

    /// Shut down; outstanding and future operations fail `ConnClosing`.
    /// Idempotent: later calls are no-ops.
    fn close(&self);
}
