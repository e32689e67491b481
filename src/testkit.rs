//! Shared mock plumbing for in-crate tests
//!
//! Mock connections answer from scripted handlers keyed by address, log
//! every submitted command, and count lifecycle events so tests can
//! assert routing, demotion, and release behaviour without a server.
//! `HashNode` is an in-memory node that emulates the handful of hash and
//! script commands the repository layer needs, including the atomic
//! save-script semantics.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::client::connection::{Conn, ConnFactory, NodeConnection, Wire};
use crate::command::Command;
use crate::config::ConnectionOptions;
use crate::script::Script;
use crate::utils::{ClientError, RespValue, Result};

pub type Handler = Arc<dyn Fn(&[Vec<u8>]) -> Result<RespValue> + Send + Sync>;

pub fn bulk(s: &str) -> RespValue {
    RespValue::BulkString(s.as_bytes().to_vec())
}

pub fn ok() -> RespValue {
    RespValue::SimpleString("OK".to_string())
}

/// Topology reply in the slot-group wire shape:
/// `[[lo, hi, [host, port, id]], ...]`
pub fn slots_reply(entries: &[(i64, i64, &str)]) -> RespValue {
    RespValue::Array(
        entries
            .iter()
            .map(|(lo, hi, addr)| {
                let (host, port) = addr.rsplit_once(':').expect("addr is host:port");
                RespValue::Array(vec![
                    RespValue::Integer(*lo),
                    RespValue::Integer(*hi),
                    RespValue::Array(vec![
                        bulk(host),
                        RespValue::Integer(port.parse().expect("numeric port")),
                        bulk("nodeid"),
                    ]),
                ])
            })
            .collect(),
    )
}

/// Poll `f` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    f()
}

struct MockState {
    addr: String,
    handler: Handler,
    dial_fail: Arc<Mutex<HashSet<String>>>,
    lane_log: Mutex<Vec<Vec<String>>>,
    wire_log: Mutex<Vec<Vec<String>>>,
    cache: Mutex<HashMap<Vec<u8>, (Instant, RespValue)>>,
    close_calls: AtomicUsize,
    wires_acquired: AtomicUsize,
    wires_returned: AtomicUsize,
    cached_calls: AtomicUsize,
    fail_submits: AtomicBool,
    fail_wires: AtomicBool,
    closing: AtomicBool,
}

impl MockState {
    fn stringify(args: &[Vec<u8>]) -> Vec<String> {
        args.iter()
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect()
    }

    fn answer(&self, args: &[Vec<u8>]) -> Result<RespValue> {
        if self.closing.load(Ordering::Acquire) {
            return Err(ClientError::ConnClosing);
        }
        if self.fail_submits.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "mock transport down").into());
        }
        (self.handler)(args)
    }
}

pub struct MockConnection {
    state: Arc<MockState>,
}

impl MockConnection {
    pub fn close_calls(&self) -> usize {
        self.state.close_calls.load(Ordering::SeqCst)
    }

    pub fn wires_acquired(&self) -> usize {
        self.state.wires_acquired.load(Ordering::SeqCst)
    }

    pub fn wires_returned(&self) -> usize {
        self.state.wires_returned.load(Ordering::SeqCst)
    }

    pub fn cached_calls(&self) -> usize {
        self.state.cached_calls.load(Ordering::SeqCst)
    }

    /// Commands submitted on the shared lane, in order
    pub fn log(&self) -> Vec<Vec<String>> {
        self.state.lane_log.lock().unwrap().clone()
    }

    /// Commands submitted over dedicated wires, in order
    pub fn wire_log(&self) -> Vec<Vec<String>> {
        self.state.wire_log.lock().unwrap().clone()
    }

    /// Make every subsequent submit fail with a transport error
    pub fn fail_submits(&self) {
        self.state.fail_submits.store(true, Ordering::Release);
    }

    /// Make wire acquisition fail as if the connection were closing
    pub fn fail_wires(&self) {
        self.state.fail_wires.store(true, Ordering::Release);
    }
}

impl NodeConnection for MockConnection {
    fn addr(&self) -> &str {
        &self.state.addr
    }

    fn dial(&self) -> Result<()> {
        if self.state.dial_fail.lock().unwrap().contains(&self.state.addr) {
            return Err(ClientError::ConnectFailed {
                addr: self.state.addr.clone(),
                source: Arc::new(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "mock dial refused",
                )),
            });
        }
        Ok(())
    }

    fn submit(&self, cmd: &Command) -> Result<RespValue> {
        let reply = self.state.answer(cmd.args());
        self.state
            .lane_log
            .lock()
            .unwrap()
            .push(MockState::stringify(cmd.args()));
        reply
    }

    fn submit_multi(&self, cmds: &[&Command]) -> Result<Vec<RespValue>> {
        let mut replies = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            replies.push(self.submit(cmd)?);
        }
        Ok(replies)
    }

    fn submit_cached(&self, cmd: &Command, ttl: Duration) -> Result<RespValue> {
        self.state.cached_calls.fetch_add(1, Ordering::SeqCst);
        let mut key = Vec::new();
        for arg in cmd.args() {
            key.extend_from_slice(arg);
            key.push(0);
        }
        let now = Instant::now();
        {
            let cache = self.state.cache.lock().unwrap();
            if let Some((expires_at, value)) = cache.get(&key) {
                if *expires_at > now {
                    return Ok(value.clone());
                }
            }
        }
        let value = self.submit(cmd)?;
        if !value.is_error() {
            self.state
                .cache
                .lock()
                .unwrap()
                .insert(key, (now + ttl, value.clone()));
        }
        Ok(value)
    }

    fn acquire_wire(&self) -> Result<Box<dyn Wire>> {
        if self.state.closing.load(Ordering::Acquire) || self.state.fail_wires.load(Ordering::Acquire)
        {
            return Err(ClientError::ConnClosing);
        }
        self.state.wires_acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockWire {
            state: Arc::clone(&self.state),
        }))
    }

    fn return_wire(&self, wire: Box<dyn Wire>) {
        self.state.wires_returned.fetch_add(1, Ordering::SeqCst);
        drop(wire);
    }

    fn close(&self) {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
        self.state.closing.store(true, Ordering::Release);
    }
}

struct MockWire {
    state: Arc<MockState>,
}

impl Wire for MockWire {
    fn submit(&mut self, cmd: &Command) -> Result<RespValue> {
        let reply = self.state.answer(cmd.args());
        self.state
            .wire_log
            .lock()
            .unwrap()
            .push(MockState::stringify(cmd.args()));
        reply
    }

    fn submit_multi(&mut self, cmds: &[&Command]) -> Result<Vec<RespValue>> {
        let mut replies = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            replies.push(self.submit(cmd)?);
        }
        Ok(replies)
    }
}

/// Factory producing scripted mock connections
pub struct MockFactory {
    handlers: Mutex<HashMap<String, Handler>>,
    dial_fail: Arc<Mutex<HashSet<String>>>,
    created: Mutex<Vec<(String, Arc<MockConnection>)>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: Mutex::new(HashMap::new()),
            dial_fail: Arc::new(Mutex::new(HashSet::new())),
            created: Mutex::new(Vec::new()),
        })
    }

    /// Answer every command on `addr` with a fixed reply
    pub fn register(&self, addr: &str, reply: RespValue) {
        self.register_fn(addr, move |_| Ok(reply.clone()));
    }

    /// Answer commands on `addr` with a handler
    pub fn register_fn<F>(&self, addr: &str, handler: F)
    where
        F: Fn(&[Vec<u8>]) -> Result<RespValue> + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap()
            .insert(addr.to_string(), Arc::new(handler));
    }

    pub fn fail_dial(&self, addr: &str) {
        self.dial_fail.lock().unwrap().insert(addr.to_string());
    }

    pub fn allow_dial(&self, addr: &str) {
        self.dial_fail.lock().unwrap().remove(addr);
    }

    /// The most recently created connection for `addr`
    pub fn conn(&self, addr: &str) -> Option<Arc<MockConnection>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(a, _)| a == addr)
            .map(|(_, conn)| Arc::clone(conn))
    }

    pub fn created_count(&self, addr: &str) -> usize {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _)| a == addr)
            .count()
    }

    pub fn conn_factory(self: &Arc<Self>) -> ConnFactory {
        let factory = Arc::clone(self);
        Arc::new(move |addr: &str, _options: &ConnectionOptions| -> Conn {
            let handler = factory
                .handlers
                .lock()
                .unwrap()
                .get(addr)
                .cloned()
                .unwrap_or_else(|| {
                    Arc::new(|_: &[Vec<u8>]| {
                        Ok(RespValue::Error("ERR unhandled mock command".into()))
                    })
                });
            let conn = Arc::new(MockConnection {
                state: Arc::new(MockState {
                    addr: addr.to_string(),
                    handler,
                    dial_fail: Arc::clone(&factory.dial_fail),
                    lane_log: Mutex::new(Vec::new()),
                    wire_log: Mutex::new(Vec::new()),
                    cache: Mutex::new(HashMap::new()),
                    close_calls: AtomicUsize::new(0),
                    wires_acquired: AtomicUsize::new(0),
                    wires_returned: AtomicUsize::new(0),
                    cached_calls: AtomicUsize::new(0),
                    fail_submits: AtomicBool::new(false),
                    fail_wires: AtomicBool::new(false),
                    closing: AtomicBool::new(false),
                }),
            });
            factory
                .created
                .lock()
                .unwrap()
                .push((addr.to_string(), Arc::clone(&conn)));
            conn
        })
    }
}

/// In-memory node emulating the hash and script commands the repository
/// layer uses. The save script runs under one lock, so its
/// compare-and-set is atomic exactly like the server-side original.
pub struct HashNode {
    store: Mutex<HashMap<String, HashMap<String, String>>>,
    scripts: Mutex<HashSet<String>>,
    commands: AtomicUsize,
    noscript: AtomicUsize,
}

impl HashNode {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            store: Mutex::new(HashMap::new()),
            scripts: Mutex::new(HashSet::new()),
            commands: AtomicUsize::new(0),
            noscript: AtomicUsize::new(0),
        })
    }

    pub fn handler(
        self: &Arc<Self>,
        addr: &str,
    ) -> impl Fn(&[Vec<u8>]) -> Result<RespValue> + Send + Sync + 'static {
        let node = Arc::clone(self);
        let addr = addr.to_string();
        move |args| node.dispatch(&addr, args)
    }

    /// Total non-topology commands this node has served
    pub fn command_count(&self) -> usize {
        self.commands.load(Ordering::SeqCst)
    }

    /// How many times EVALSHA was rejected with NOSCRIPT
    pub fn noscript_replies(&self) -> usize {
        self.noscript.load(Ordering::SeqCst)
    }

    pub fn stored_field(&self, key: &str, field: &str) -> Option<String> {
        self.store
            .lock()
            .unwrap()
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned()
    }

    pub fn seed_hash(&self, key: &str, fields: &[(&str, &str)]) {
        let mut store = self.store.lock().unwrap();
        let hash = store.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.to_string(), value.to_string());
        }
    }

    fn dispatch(&self, addr: &str, args: &[Vec<u8>]) -> Result<RespValue> {
        let name = String::from_utf8_lossy(&args[0]).to_uppercase();
        if name == "CLUSTER" {
            return Ok(slots_reply(&[(0, 16383, addr)]));
        }
        self.commands.fetch_add(1, Ordering::SeqCst);

        let arg = |i: usize| String::from_utf8_lossy(&args[i]).into_owned();
        match name.as_str() {
            "PING" => Ok(RespValue::SimpleString("PONG".into())),
            "HGETALL" => {
                let store = self.store.lock().unwrap();
                let mut out = Vec::new();
                if let Some(hash) = store.get(&arg(1)) {
                    for (field, value) in hash {
                        out.push(bulk(field));
                        out.push(bulk(value));
                    }
                }
                Ok(RespValue::Array(out))
            }
            "HGET" => {
                let store = self.store.lock().unwrap();
                Ok(store
                    .get(&arg(1))
                    .and_then(|hash| hash.get(&arg(2)))
                    .map_or(RespValue::Null, |v| bulk(v)))
            }
            "HSET" => {
                let mut store = self.store.lock().unwrap();
                let hash = store.entry(arg(1)).or_default();
                let mut added = 0;
                for pair in args[2..].chunks_exact(2) {
                    let field = String::from_utf8_lossy(&pair[0]).into_owned();
                    let value = String::from_utf8_lossy(&pair[1]).into_owned();
                    if hash.insert(field, value).is_none() {
                        added += 1;
                    }
                }
                Ok(RespValue::Integer(added))
            }
            "DEL" => {
                let mut store = self.store.lock().unwrap();
                let removed = store.remove(&arg(1)).is_some();
                Ok(RespValue::Integer(removed as i64))
            }
            "EVALSHA" => {
                if !self.scripts.lock().unwrap().contains(&arg(1)) {
                    self.noscript.fetch_add(1, Ordering::SeqCst);
                    return Ok(RespValue::Error(
                        "NOSCRIPT No matching script. Please use EVAL.".into(),
                    ));
                }
                self.run_save_script(args)
            }
            "EVAL" => {
                let body = arg(1);
                self.scripts
                    .lock()
                    .unwrap()
                    .insert(Script::new(&body).sha1().to_string());
                self.run_save_script(args)
            }
            _ => Ok(ok()),
        }
    }

    /// The compare-and-set semantics of the repository save script
    fn run_save_script(&self, args: &[Vec<u8>]) -> Result<RespValue> {
        let text = |bytes: &Vec<u8>| String::from_utf8_lossy(bytes).into_owned();
        let numkeys: usize = text(&args[2]).parse().expect("numeric numkeys");
        let key = text(&args[3]);
        let argv = &args[3 + numkeys..];
        let version = text(&argv[1]);

        let mut store = self.store.lock().unwrap();
        let current = store.get(&key).and_then(|hash| hash.get("_v")).cloned();
        if current.is_none() || current.as_deref() == Some(version.as_str()) {
            let bumped = (version.parse::<u64>().expect("numeric version") + 1).to_string();
            let hash = store.entry(key).or_default();
            hash.insert("_v".to_string(), bumped.clone());
            for pair in argv[2..].chunks_exact(2) {
                hash.insert(text(&pair[0]), text(&pair[1]));
            }
            Ok(bulk(&bumped))
        } else {
            Ok(RespValue::Null)
        }
    }
}
