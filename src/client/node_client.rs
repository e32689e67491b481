//! Default per-node connection built on the raw TCP transport
//!
//! One [`TcpNodeClient`] serves all slots owned by its node. Shared
//! submits run through a single mutex-guarded lane, which preserves
//! submission order per connection. Dedicated wires get a private socket
//! each, so session state never leaks into the shared lane. Cacheable
//! reads are served from a TTL-stamped reply cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use super::connection::{Conn, ConnFactory, NodeConnection, Wire};
use super::raw_connection::RawConnection;
use crate::command::Command;
use crate::config::ConnectionOptions;
use crate::utils::{ClientError, RespValue, Result};

struct CacheEntry {
    expires_at: Instant,
    value: RespValue,
}

pub struct TcpNodeClient {
    addr: String,
    options: ConnectionOptions,
    /// Shared submit lane, dialled on first use
    lane: Mutex<Option<RawConnection>>,
    /// Server-assisted reply cache for cacheable reads
    cache: Mutex<HashMap<Vec<u8>, CacheEntry>>,
    closing: AtomicBool,
}

impl TcpNodeClient {
    pub fn new(addr: &str, options: ConnectionOptions) -> Self {
        Self {
            addr: addr.to_string(),
            options,
            lane: Mutex::new(None),
            cache: Mutex::new(HashMap::new()),
            closing: AtomicBool::new(false),
        }
    }

    fn connect(&self) -> Result<RawConnection> {
        RawConnection::connect(&self.addr, &self.options).map_err(|e| match e {
            ClientError::Transport(source) => ClientError::ConnectFailed {
                addr: self.addr.clone(),
                source,
            },
            other => other,
        })
    }

    /// Run `f` against the shared lane, dialling it if necessary.
    /// Any failure discards the lane so the next submit redials; after a
    /// protocol error the stream position is unknown anyway.
    fn with_lane<T>(&self, f: impl FnOnce(&mut RawConnection) -> Result<T>) -> Result<T> {
        if self.closing.load(Ordering::Acquire) {
            return Err(ClientError::ConnClosing);
        }
        let mut lane = self.lane.lock().unwrap();
        if lane.is_none() {
            *lane = Some(self.connect()?);
        }
        match f(lane.as_mut().unwrap()) {
            Ok(v) => Ok(v),
            Err(e) => {
                *lane = None;
                Err(e)
            }
        }
    }

    fn cache_key(cmd: &Command) -> Vec<u8> {
        let mut key = Vec::with_capacity(32);
        for arg in cmd.args() {
            key.extend_from_slice(arg);
            key.push(0);
        }
        key
    }
}

impl NodeConnection for TcpNodeClient {
    fn addr(&self) -> &str {
        &self.addr
    }

    fn dial(&self) -> Result<()> {
        self.with_lane(|_| Ok(()))
    }

    fn submit(&self, cmd: &Command) -> Result<RespValue> {
        self.with_lane(|lane| lane.submit(cmd.args()))
    }

    fn submit_multi(&self, cmds: &[&Command]) -> Result<Vec<RespValue>> {
        let batches: Vec<&[Vec<u8>]> = cmds.iter().map(|c| c.args()).collect();
        self.with_lane(|lane| lane.submit_pipeline(&batches))
    }

    fn submit_cached(&self, cmd: &Command, ttl: Duration) -> Result<RespValue> {
        let key = Self::cache_key(cmd);
        let now = Instant::now();
        {
            let mut cache = self.cache.lock().unwrap();
            match cache.get(&key) {
                Some(entry) if entry.expires_at > now => return Ok(entry.value.clone()),
                Some(_) => {
                    cache.remove(&key);
                }
                None => {}
            }
        }

        let value = self.submit(cmd)?;

        // Error replies (including redirections) must never be served
        // from the cache.
        if !value.is_error() {
            self.cache.lock().unwrap().insert(
                key,
                CacheEntry {
                    expires_at: now + ttl,
                    value: value.clone(),
                },
            );
        }
        Ok(value)
    }

    fn acquire_wire(&self) -> Result<Box<dyn Wire>> {
        if self.closing.load(Ordering::Acquire) {
            return Err(ClientError::ConnClosing);
        }
        Ok(Box::new(TcpWire {
            raw: self.connect()?,
        }))
    }

    fn return_wire(&self, wire: Box<dyn Wire>) {
        // Each wire owns a private socket; dropping the handle closes it.
        drop(wire);
    }

    fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(addr = %self.addr, "closing node connection");
        self.lane.lock().unwrap().take();
        self.cache.lock().unwrap().clear();
    }
}

/// Exclusive wire backed by its own socket
struct TcpWire {
    raw: RawConnection,
}

impl Wire for TcpWire {
    fn submit(&mut self, cmd: &Command) -> Result<RespValue> {
        self.raw.submit(cmd.args())
    }

    fn submit_multi(&mut self, cmds: &[&Command]) -> Result<Vec<RespValue>> {
        let batches: Vec<&[Vec<u8>]> = cmds.iter().map(|c| c.args()).collect();
        self.raw.submit_pipeline(&batches)
    }
}

/// The default connection factory: lazily-dialled TCP node clients
pub fn tcp_factory() -> ConnFactory {
    Arc::new(|addr, options| Arc::new(TcpNodeClient::new(addr, options.clone())) as Conn)
}
