//! Cluster topology cache
//!
//! Maps each of the 16,384 hash slots to the connection currently owning
//! it, plus an address-to-connection map. Both live under one lock so a
//! snapshot replacement is atomic from a reader's standpoint: a reader
//! sees the whole old snapshot or the whole new one, never a slot vector
//! pointing at a connection that has been dropped from the map.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::thread;

use tracing::warn;

use crate::client::connection::{Conn, ConnFactory};
use crate::command::{ANY_SLOT, SLOT_COUNT};
use crate::config::ConnectionOptions;
use crate::utils::{ClientError, ProtocolError, RespValue, Result};

/// One primary's share of the key space, parsed from the topology query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotGroup {
    /// Inclusive `[lo, hi]` slot ranges owned by the primary
    pub ranges: Vec<(u16, u16)>,
    /// Replica addresses; parsed but unused for routing
    pub replicas: Vec<String>,
}

/// Parse a topology reply into per-primary slot groups
///
/// The reply is an array of entries `[lo, hi, primary, replica...]`,
/// where each node is an array `[host, port, id?]`. Entries sharing one
/// primary address are merged into a single group.
pub fn parse_slot_groups(reply: &RespValue) -> Result<HashMap<String, SlotGroup>> {
    let entries = reply
        .as_array()
        .ok_or_else(|| parse_err("topology reply is not an array"))?;

    let mut groups: HashMap<String, SlotGroup> = HashMap::with_capacity(entries.len());
    for entry in entries {
        let parts = entry
            .as_array()
            .ok_or_else(|| parse_err("slot entry is not an array"))?;
        if parts.len() < 3 {
            return Err(parse_err("slot entry has fewer than 3 elements"));
        }

        let lo = slot_bound(&parts[0])?;
        let hi = slot_bound(&parts[1])?;
        if lo > hi {
            return Err(parse_err("slot range is inverted"));
        }

        let primary = parse_node_entry(&parts[2])?;
        let group = groups.entry(primary).or_insert_with(|| SlotGroup {
            ranges: Vec::new(),
            replicas: parts[3..]
                .iter()
                .filter_map(|n| parse_node_entry(n).ok())
                .collect(),
        });
        group.ranges.push((lo, hi));
    }
    Ok(groups)
}

fn slot_bound(value: &RespValue) -> Result<u16> {
    let n = value
        .as_i64()
        .ok_or_else(|| parse_err("slot bound is not an integer"))?;
    if !(0..i64::from(SLOT_COUNT)).contains(&n) {
        return Err(parse_err("slot bound out of range"));
    }
    Ok(n as u16)
}

fn parse_node_entry(value: &RespValue) -> Result<String> {
    let parts = value
        .as_array()
        .ok_or_else(|| parse_err("node entry is not an array"))?;
    let host = parts
        .first()
        .and_then(|v| v.as_str())
        .ok_or_else(|| parse_err("node host missing"))?;
    let port = parts
        .get(1)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| parse_err("node port missing"))?;
    Ok(format!("{}:{}", host, port))
}

fn parse_err(msg: &str) -> ClientError {
    ProtocolError::Parse(msg.to_string()).into()
}

/// A consistent (slot vector, connection map) pair
pub struct Snapshot {
    pub slots: Vec<Option<Conn>>,
    pub conns: HashMap<String, Conn>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            slots: vec![None; SLOT_COUNT as usize],
            conns: HashMap::new(),
        }
    }
}

/// Concurrent slot-to-connection cache
pub struct TopologyCache {
    factory: ConnFactory,
    options: ConnectionOptions,
    inner: RwLock<Snapshot>,
}

impl TopologyCache {
    pub fn new(factory: ConnFactory, options: ConnectionOptions) -> Self {
        Self {
            factory,
            options,
            inner: RwLock::new(Snapshot::empty()),
        }
    }

    /// Create a connection handle for `addr` without registering it.
    /// The factory performs no IO.
    pub fn create(&self, addr: &str) -> Conn {
        (self.factory)(addr, &self.options)
    }

    /// Current owner of `slot`, or an arbitrary connection for
    /// [`ANY_SLOT`]. Callers must not depend on which connection the
    /// any-slot path picks.
    pub fn lookup(&self, slot: u16) -> Option<Conn> {
        let inner = self.inner.read().unwrap();
        if slot == ANY_SLOT {
            inner.conns.values().next().cloned()
        } else {
            inner.slots.get(slot as usize)?.clone()
        }
    }

    /// Existing connection for `addr`, or one freshly created and
    /// registered. Double-checked so concurrent callers never end up
    /// with two distinct connections to one address.
    pub fn pick_or_create(&self, addr: &str) -> Conn {
        {
            let inner = self.inner.read().unwrap();
            if let Some(conn) = inner.conns.get(addr) {
                return conn.clone();
            }
        }
        let mut inner = self.inner.write().unwrap();
        if let Some(conn) = inner.conns.get(addr) {
            return conn.clone();
        }
        let conn = self.create(addr);
        inner.conns.insert(addr.to_string(), conn.clone());
        conn
    }

    /// Register a seed connection, returning any displaced previous
    /// connection for the caller to shut down. Slots still pointing at
    /// the displaced connection are cleared.
    pub fn install(&self, addr: &str, conn: Conn) -> Option<Conn> {
        let mut inner = self.inner.write().unwrap();
        let prev = inner.conns.insert(addr.to_string(), conn);
        if let Some(prev) = &prev {
            for slot in inner.slots.iter_mut() {
                if let Some(existing) = slot {
                    if Arc::ptr_eq(existing, prev) {
                        *slot = None;
                    }
                }
            }
        }
        prev
    }

    /// Atomically install a fresh snapshot. Returns the connections no
    /// longer reachable; the caller schedules their shutdown.
    pub fn replace(&self, snapshot: Snapshot) -> Vec<Conn> {
        let mut inner = self.inner.write().unwrap();
        let mut removed = Vec::new();
        for (addr, conn) in inner.conns.iter() {
            let kept = snapshot
                .conns
                .get(addr)
                .map_or(false, |next| Arc::ptr_eq(next, conn));
            if !kept {
                removed.push(conn.clone());
            }
        }
        *inner = snapshot;
        removed
    }

    /// Drop the given addresses, returning their connections for
    /// shutdown. Slots still pointing at a demoted connection are
    /// cleared so readers never observe a slot outside the map.
    pub fn remove(&self, addrs: &[String]) -> Vec<Conn> {
        let mut inner = self.inner.write().unwrap();
        let mut removed = Vec::with_capacity(addrs.len());
        for addr in addrs {
            if let Some(conn) = inner.conns.remove(addr) {
                removed.push(conn);
            }
        }
        if !removed.is_empty() {
            for slot in inner.slots.iter_mut() {
                if let Some(conn) = slot {
                    if removed.iter().any(|r| Arc::ptr_eq(r, conn)) {
                        *slot = None;
                    }
                }
            }
        }
        removed
    }

    /// Read-side copy of the address map, for iteration without
    /// holding the lock across IO
    pub fn conn_pairs(&self) -> Vec<(String, Conn)> {
        let inner = self.inner.read().unwrap();
        inner
            .conns
            .iter()
            .map(|(addr, conn)| (addr.clone(), conn.clone()))
            .collect()
    }

    pub fn conn_map(&self) -> HashMap<String, Conn> {
        self.inner.read().unwrap().conns.clone()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.inner.read().unwrap().conns.keys().cloned().collect()
    }
}

/// Shut a connection down in the background; topology maintenance never
/// blocks on socket teardown.
pub(crate) fn schedule_close(conn: Conn) {
    if let Err(e) = thread::Builder::new()
        .name("conn-close".into())
        .spawn(move || conn.close())
    {
        warn!(error = %e, "failed to spawn connection shutdown");
    }
}
