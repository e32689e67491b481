//! Cluster client: slot-keyed dispatch with redirection handling
//!
//! The client keeps one connection per primary, looks the owner up by the
//! command's slot tag, and interprets the server's routing errors:
//! `MOVED` re-targets and schedules an asynchronous topology refresh,
//! `ASK` re-attempts once behind an `ASKING` preamble, `TRYAGAIN` yields
//! and retries from the slot lookup. Redirections never reach callers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use super::dedicated::DedicatedSession;
use super::refresh::SingleFlight;
use super::topology::{parse_slot_groups, schedule_close, Snapshot, TopologyCache};
use crate::client::connection::{Conn, ConnFactory};
use crate::client::node_client::tcp_factory;
use crate::command::{Command, CommandBuilder, ANY_SLOT, SLOT_COUNT};
use crate::config::{ClusterOptions, SubscribeSource};
use crate::repo::{HashRecord, HashRepository};
use crate::script::Script;
use crate::utils::{ClientError, ProtocolError, Redirect, RespValue, Result};

/// Ceiling on MOVED/ASK/TRYAGAIN handling per dispatch, guarding against
/// adversarial redirect cycles. When hit, the last reply is surfaced.
const MAX_REDIRECTS: u32 = 32;

/// Cluster client handle; clones share one underlying client
#[derive(Clone)]
pub struct ClusterClient {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    options: ClusterOptions,
    pub(crate) cmd: CommandBuilder,
    topology: TopologyCache,
    refresh_gate: SingleFlight,
    closed: AtomicBool,
}

impl ClusterClient {
    /// Connect to the cluster reachable through `options.initial_addresses`
    pub fn new(options: ClusterOptions) -> Result<Self> {
        Self::with_factory(options, tcp_factory())
    }

    /// Like [`new`](Self::new) with a custom connection factory
    pub fn with_factory(mut options: ClusterOptions, factory: ConnFactory) -> Result<Self> {
        if options.initial_addresses.is_empty() {
            return Err(ClientError::NoNodes);
        }
        if options.shuffle_initial {
            options.initial_addresses.shuffle(&mut rand::thread_rng());
        }

        let topology = TopologyCache::new(factory, options.connection_options.clone());
        let pubsub = options.connection_options.pubsub.clone();
        let shared = Arc::new(Shared {
            options,
            cmd: CommandBuilder::new(),
            topology,
            refresh_gate: SingleFlight::new(),
            closed: AtomicBool::new(false),
        });

        shared.seed()?;
        shared.refresh()?;

        if let Some(pubsub) = pubsub {
            let source = Arc::clone(&shared);
            let provider: SubscribeSource = Arc::new(move || loop {
                match source.pick(ANY_SLOT) {
                    Ok(conn) => return Some(conn),
                    Err(ClientError::ConnClosing) => return None,
                    Err(_) => thread::yield_now(),
                }
            });
            (pubsub.install)(provider);
        }

        Ok(Self { shared })
    }

    /// The command assembler backing this client
    pub fn cmd(&self) -> &CommandBuilder {
        &self.shared.cmd
    }

    /// Execute a command against the node owning its slot
    pub fn execute(&self, cmd: Command) -> Result<RespValue> {
        let result = self.shared.dispatch(&cmd, None);
        self.shared.cmd.reclaim(cmd);
        result
    }

    /// Execute a cacheable read through the per-connection reply cache
    pub fn execute_cached(&self, cmd: Command, ttl: Duration) -> Result<RespValue> {
        if !cmd.is_cacheable() {
            self.shared.cmd.reclaim(cmd);
            return Err(ProtocolError::NotCacheable.into());
        }
        let result = self.shared.dispatch(&cmd, Some(ttl));
        self.shared.cmd.reclaim(cmd);
        result
    }

    /// Run `f` with a session pinned to a single wire
    ///
    /// The wire is released when the scope ends, however it ends.
    pub fn dedicated<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut DedicatedSession) -> T,
    {
        let mut session = DedicatedSession::new(Arc::clone(&self.shared));
        let out = f(&mut session);
        session.release();
        out
    }

    /// Wrap a server-side script body for repeated execution
    pub fn script(&self, body: &str) -> Script {
        Script::new(body)
    }

    /// A versioned hash repository for records of type `T` under
    /// `<prefix>:<id>` keys
    pub fn hash_repository<T: HashRecord + Default>(&self, prefix: &str) -> HashRepository<T> {
        HashRepository::new(prefix, self.clone())
    }

    /// Force a topology refresh now (coalesced with concurrent callers)
    pub fn refresh(&self) -> Result<()> {
        self.shared.refresh()
    }

    /// Addresses of the nodes currently known to the client
    pub fn nodes(&self) -> Vec<String> {
        self.shared.topology.addresses()
    }

    /// Shut the client down; connections close in the background
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for (_, conn) in self.shared.topology.conn_pairs() {
            schedule_close(conn);
        }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Shared {
    /// Dial the configured seed addresses in order; the first that
    /// answers is registered and returned.
    fn seed(&self) -> Result<Conn> {
        if self.options.initial_addresses.is_empty() {
            return Err(ClientError::NoNodes);
        }
        let mut last_err = ClientError::NoNodes;
        for addr in &self.options.initial_addresses {
            let conn = self.topology.create(addr);
            match conn.dial() {
                Ok(()) => {
                    if let Some(prev) = self.topology.install(addr, conn.clone()) {
                        schedule_close(prev);
                    }
                    return Ok(conn);
                }
                Err(e) => {
                    warn!(addr = %addr, error = %e, "seed dial failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Re-seed from inside a refresh: a dial failure here means the
    /// refresh as a whole failed, not just one connection.
    fn reseed(&self) -> Result<Conn> {
        self.seed().map_err(|e| match e {
            ClientError::NoNodes => ClientError::NoNodes,
            other => ClientError::RefreshFailed(other.to_string()),
        })
    }

    pub(crate) fn refresh(self: &Arc<Self>) -> Result<()> {
        let shared = Arc::clone(self);
        self.refresh_gate.run(move || shared.refresh_topology())
    }

    /// Fire-and-forget refresh after a MOVED redirect; the redirected
    /// command does not wait for the new snapshot.
    fn spawn_refresh(self: &Arc<Self>) {
        let shared = Arc::clone(self);
        if let Err(e) = thread::Builder::new()
            .name("topology-refresh".into())
            .spawn(move || {
                if let Err(e) = shared.refresh() {
                    warn!(error = %e, "asynchronous topology refresh failed");
                }
            })
        {
            warn!(error = %e, "failed to spawn topology refresh");
        }
    }

    /// One full refresh attempt; runs inside the single-flight gate
    fn refresh_topology(&self) -> Result<()> {
        let mut reseeded_after_failure = false;
        let mut reseeded_after_empty = false;

        let groups = loop {
            let (reply, dead, last_err) = self.query_topology();

            if !dead.is_empty() {
                warn!(nodes = ?dead, "demoting unreachable nodes");
                for conn in self.topology.remove(&dead) {
                    schedule_close(conn);
                }
            }

            let reply = match reply {
                Some(reply) => reply,
                None => {
                    // Every known node failed; fall back to the seeds.
                    if reseeded_after_failure {
                        return Err(match last_err {
                            Some(cause) => ClientError::RefreshFailed(cause.to_string()),
                            None => ClientError::NoNodes,
                        });
                    }
                    reseeded_after_failure = true;
                    self.reseed()?;
                    continue;
                }
            };

            let groups = parse_slot_groups(&reply)?;
            if groups.is_empty() {
                // A node answering with no groups is not to be trusted;
                // re-seed and ask once more. A second empty reply stands.
                if reseeded_after_empty {
                    break groups;
                }
                reseeded_after_empty = true;
                self.reseed()?;
                continue;
            }
            break groups;
        };

        let current = self.topology.conn_map();
        let mut masters: HashMap<String, Conn> = HashMap::with_capacity(groups.len());
        for addr in groups.keys() {
            let conn = current
                .get(addr)
                .cloned()
                .unwrap_or_else(|| self.topology.create(addr));
            masters.insert(addr.clone(), conn);
        }

        let mut slots: Vec<Option<Conn>> = vec![None; SLOT_COUNT as usize];
        for (addr, group) in &groups {
            let conn = &masters[addr];
            for &(lo, hi) in &group.ranges {
                for slot in lo..=hi {
                    slots[slot as usize] = Some(conn.clone());
                }
            }
        }

        let removed = self.topology.replace(Snapshot {
            slots,
            conns: masters,
        });
        for conn in removed {
            schedule_close(conn);
        }

        info!(primaries = groups.len(), "cluster topology refreshed");
        Ok(())
    }

    /// Ask each known node for the topology until one answers.
    /// Returns the reply, the addresses that failed before it, and the
    /// last error seen.
    fn query_topology(&self) -> (Option<RespValue>, Vec<String>, Option<ClientError>) {
        let mut dead = Vec::new();
        let mut last_err = None;
        for (addr, conn) in self.topology.conn_pairs() {
            let cmd = self.cmd.cluster_slots();
            let outcome = conn.submit(&cmd);
            self.cmd.reclaim(cmd);
            match outcome {
                Ok(reply) if !reply.is_error() => return (Some(reply), dead, last_err),
                Ok(reply) => {
                    let msg = reply.as_server_error().unwrap_or("routing error").to_string();
                    warn!(addr = %addr, error = %msg, "topology query rejected");
                    dead.push(addr);
                    last_err = Some(ClientError::Server(msg));
                }
                Err(e) => {
                    warn!(addr = %addr, error = %e, "topology query failed");
                    dead.push(addr);
                    last_err = Some(e);
                }
            }
        }
        (None, dead, last_err)
    }

    /// Connection owning `slot`, refreshing once when uncovered
    pub(crate) fn pick(self: &Arc<Self>, slot: u16) -> Result<Conn> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::ConnClosing);
        }
        if let Some(conn) = self.topology.lookup(slot) {
            return Ok(conn);
        }
        self.refresh()?;
        self.topology.lookup(slot).ok_or(ClientError::NoSlot)
    }

    fn submit(&self, conn: &Conn, cmd: &Command, ttl: Option<Duration>) -> Result<RespValue> {
        match ttl {
            Some(ttl) => conn.submit_cached(cmd, ttl),
            None => conn.submit(cmd),
        }
    }

    pub(crate) fn dispatch(self: &Arc<Self>, cmd: &Command, ttl: Option<Duration>) -> Result<RespValue> {
        let mut hops = 0u32;
        'pick: loop {
            let conn = self.pick(cmd.slot())?;
            let mut reply = self.submit(&conn, cmd, ttl)?;

            loop {
                let redirect = match reply.redirect() {
                    Some(redirect) => redirect,
                    None => return Ok(reply),
                };
                hops += 1;
                if hops > MAX_REDIRECTS {
                    warn!(command = cmd.name(), "redirect ceiling reached");
                    return Ok(reply);
                }
                match redirect {
                    Redirect::Moved(addr) => {
                        debug!(command = cmd.name(), target = %addr, "following MOVED");
                        self.spawn_refresh();
                        let target = self.topology.pick_or_create(&addr);
                        reply = self.submit(&target, cmd, ttl)?;
                    }
                    Redirect::Ask(addr) => {
                        debug!(command = cmd.name(), target = %addr, "following ASK");
                        // The asked node is not the authoritative owner,
                        // so this leg never goes through the cache.
                        let target = self.topology.pick_or_create(&addr);
                        let asking = self.cmd.asking();
                        let outcome = target.submit_multi(&[&asking, cmd]);
                        self.cmd.reclaim(asking);
                        let mut replies = outcome?;
                        if replies.len() != 2 {
                            return Err(ProtocolError::UnexpectedResponse {
                                expected: "2 replies".into(),
                                actual: format!("{} replies", replies.len()),
                            }
                            .into());
                        }
                        reply = replies.pop().expect("length checked above");
                    }
                    Redirect::TryAgain => {
                        thread::yield_now();
                        continue 'pick;
                    }
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn topology(&self) -> &TopologyCache {
        &self.topology
    }
}
