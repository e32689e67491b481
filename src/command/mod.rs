//! Command assembly and slot derivation
//!
//! Commands are built through a [`CommandBuilder`] that owns a free-list
//! of argument buffers: every built command draws its buffer from the
//! pool and the dispatcher returns it with [`CommandBuilder::reclaim`]
//! after the reply has been produced, exactly once per command.
//!
//! Each command carries a slot tag derived from its first key (CRC16 over
//! the key or its `{tag}` substring, modulo 16384) and a cacheable marker
//! for the read-only subset eligible for the client-side cache.

use std::sync::Mutex;

/// Sentinel slot for commands with no key affinity
pub const ANY_SLOT: u16 = u16::MAX;

/// Number of hash slots in the cluster key space
pub const SLOT_COUNT: u16 = 16384;

/// A fully assembled command, tagged for routing
#[derive(Debug)]
pub struct Command {
    args: Vec<Vec<u8>>,
    slot: u16,
    cacheable: bool,
}

impl Command {
    /// The slot this command routes to, or [`ANY_SLOT`]
    pub fn slot(&self) -> u16 {
        self.slot
    }

    /// Whether the command may be served from the client-side cache
    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    /// Raw argument vector, command name first
    pub fn args(&self) -> &[Vec<u8>] {
        &self.args
    }

    /// Command name as UTF-8, for diagnostics
    pub fn name(&self) -> &str {
        self.args
            .first()
            .and_then(|a| std::str::from_utf8(a).ok())
            .unwrap_or("")
    }
}

/// Derive the hash slot for a key
///
/// Honours the `{tag}` convention: when the key contains a non-empty
/// brace-delimited substring, only that substring is hashed, so related
/// keys can be forced onto one slot.
pub fn slot_for_key(key: &[u8]) -> u16 {
    if let Some(start) = key.iter().position(|&b| b == b'{') {
        if let Some(end) = key[start + 1..].iter().position(|&b| b == b'}') {
            if end > 0 {
                return crc16(&key[start + 1..start + 1 + end]) % SLOT_COUNT;
            }
        }
    }
    crc16(key) % SLOT_COUNT
}

/// CRC16 (XMODEM) used for cluster slot derivation
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Command factory with a pooled free-list of argument buffers
#[derive(Default)]
pub struct CommandBuilder {
    pool: Mutex<Vec<Vec<Vec<u8>>>>,
}

impl CommandBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn buffer(&self) -> Vec<Vec<u8>> {
        self.pool.lock().unwrap().pop().unwrap_or_default()
    }

    /// Return a command's buffer to the pool
    ///
    /// Must be called exactly once per built command, on success and
    /// error paths alike.
    pub fn reclaim(&self, cmd: Command) {
        let mut args = cmd.args;
        args.clear();
        self.pool.lock().unwrap().push(args);
    }

    /// Number of buffers currently parked in the pool
    pub fn pooled(&self) -> usize {
        self.pool.lock().unwrap().len()
    }

    /// Assemble an arbitrary command
    ///
    /// `key` designates the routing key when the command has one;
    /// `cacheable` must only be set for read-only commands.
    pub fn raw<A: AsRef<[u8]>>(&self, args: &[A], key: Option<&[u8]>, cacheable: bool) -> Command {
        let mut buf = self.buffer();
        buf.extend(args.iter().map(|a| a.as_ref().to_vec()));
        Command {
            args: buf,
            slot: key.map_or(ANY_SLOT, slot_for_key),
            cacheable,
        }
    }

    pub fn ping(&self) -> Command {
        self.raw(&["PING"], None, false)
    }

    pub fn get(&self, key: &str) -> Command {
        self.raw(&["GET", key], Some(key.as_bytes()), true)
    }

    pub fn set(&self, key: &str, value: &str) -> Command {
        self.raw(&["SET", key, value], Some(key.as_bytes()), false)
    }

    pub fn del(&self, key: &str) -> Command {
        self.raw(&["DEL", key], Some(key.as_bytes()), false)
    }

    pub fn hget(&self, key: &str, field: &str) -> Command {
        self.raw(&["HGET", key, field], Some(key.as_bytes()), true)
    }

    pub fn hgetall(&self, key: &str) -> Command {
        self.raw(&["HGETALL", key], Some(key.as_bytes()), true)
    }

    /// HSET with field-value pairs
    pub fn hset<'a, I>(&self, key: &str, pairs: I) -> Command
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut buf = self.buffer();
        buf.push(b"HSET".to_vec());
        buf.push(key.as_bytes().to_vec());
        for (field, value) in pairs {
            buf.push(field.as_bytes().to_vec());
            buf.push(value.as_bytes().to_vec());
        }
        Command {
            args: buf,
            slot: slot_for_key(key.as_bytes()),
            cacheable: false,
        }
    }

    pub fn multi(&self) -> Command {
        self.raw(&["MULTI"], None, false)
    }

    pub fn exec(&self) -> Command {
        self.raw(&["EXEC"], None, false)
    }

    pub fn watch(&self, key: &str) -> Command {
        self.raw(&["WATCH", key], Some(key.as_bytes()), false)
    }

    pub fn subscribe(&self, channel: &str) -> Command {
        self.raw(&["SUBSCRIBE", channel], None, false)
    }

    /// ASKING preamble for migrating-slot retries
    pub fn asking(&self) -> Command {
        self.raw(&["ASKING"], None, false)
    }

    /// Topology query answered in the slot-group format
    pub fn cluster_slots(&self) -> Command {
        self.raw(&["CLUSTER", "SLOTS"], None, false)
    }

    pub fn eval(&self, body: &str, keys: &[String], args: &[String]) -> Command {
        self.script_call("EVAL", body, keys, args)
    }

    pub fn evalsha(&self, sha1: &str, keys: &[String], args: &[String]) -> Command {
        self.script_call("EVALSHA", sha1, keys, args)
    }

    pub fn eval_ro(&self, body: &str, keys: &[String], args: &[String]) -> Command {
        self.script_call("EVAL_RO", body, keys, args)
    }

    pub fn evalsha_ro(&self, sha1: &str, keys: &[String], args: &[String]) -> Command {
        self.script_call("EVALSHA_RO", sha1, keys, args)
    }

    fn script_call(&self, name: &str, target: &str, keys: &[String], args: &[String]) -> Command {
        let mut buf = self.buffer();
        buf.push(name.as_bytes().to_vec());
        buf.push(target.as_bytes().to_vec());
        buf.push(keys.len().to_string().into_bytes());
        for key in keys {
            buf.push(key.as_bytes().to_vec());
        }
        for arg in args {
            buf.push(arg.as_bytes().to_vec());
        }
        Command {
            args: buf,
            slot: keys
                .first()
                .map_or(ANY_SLOT, |k| slot_for_key(k.as_bytes())),
            cacheable: false,
        }
    }
}
