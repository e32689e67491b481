//! Versioned hash repository
//!
//! Persists typed records as hash entities keyed `<prefix>:<id>`, with
//! optimistic concurrency through a monotonic version field (`_v`). The
//! version guard and the multi-field write are collapsed into one atomic
//! server-side script, so a save is a single round-trip compare-and-set:
//! a concurrent writer with a stale version gets `VersionMismatch` and
//! can refetch and retry.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::time::Duration;

use uuid::Uuid;

use crate::cluster::ClusterClient;
use crate::script::Script;
use crate::utils::{ClientError, RespValue, Result};

/// Hash field holding the record version, stored as decimal text
pub const VERSION_FIELD: &str = "_v";

/// Compare-and-set write: keeps the stored version if it is absent or
/// equals ARGV[2], bumps it by one, writes all fields, and returns the
/// new version; a lost race returns nil.
const SAVE_SCRIPT: &str = "\
local v = redis.call('HGET',KEYS[1],'_v')
if (not v or v == ARGV[2])
then
  ARGV[2] = tostring(tonumber(ARGV[2])+1)
  if redis.call('HSET',KEYS[1],unpack(ARGV)) then return ARGV[2] end
end
return nil
";

/// Static adapter between a record type and its hash representation
///
/// `fields` returns the data fields only; the id and version travel
/// separately. `apply_fields` must tolerate missing fields (they
/// deserialise as the record's defaults).
pub trait HashRecord: Send {
    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
    fn fields(&self) -> HashMap<String, String>;
    fn apply_fields(&mut self, fields: &HashMap<String, String>) -> Result<()>;
}

/// Repository of `T` records stored under `<prefix>:<id>` keys
pub struct HashRepository<T> {
    prefix: String,
    client: ClusterClient,
    save_script: Script,
    _record: PhantomData<fn() -> T>,
}

impl<T: HashRecord + Default> HashRepository<T> {
    pub(crate) fn new(prefix: &str, client: ClusterClient) -> Self {
        Self {
            prefix: prefix.to_string(),
            client,
            save_script: Script::new(SAVE_SCRIPT),
            _record: PhantomData,
        }
    }

    fn key(&self, id: &str) -> String {
        format!("{}:{}", self.prefix, id)
    }

    /// A fresh record with a generated identifier and version 0.
    /// No server call is made.
    pub fn make(&self) -> T {
        let mut record = T::default();
        record.set_id(Uuid::new_v4().simple().to_string());
        record
    }

    /// Read the record stored under `id`; `None` when the hash is absent
    pub fn fetch(&self, id: &str) -> Result<Option<T>> {
        let reply = self.client.execute(self.client.cmd().hgetall(&self.key(id)))?;
        self.materialise(id, reply)
    }

    /// Like [`fetch`](Self::fetch), served through the client-side cache
    pub fn fetch_cached(&self, id: &str, ttl: Duration) -> Result<Option<T>> {
        let reply = self
            .client
            .execute_cached(self.client.cmd().hgetall(&self.key(id)), ttl)?;
        self.materialise(id, reply)
    }

    /// Persist the record, enforcing the version guard
    ///
    /// On success the record's in-memory version is advanced to the
    /// stored one. A concurrent writer that got there first yields
    /// [`ClientError::VersionMismatch`]; the caller may refetch and
    /// retry.
    pub fn save(&self, record: &mut T) -> Result<()> {
        let mut args = Vec::with_capacity(2);
        args.push(VERSION_FIELD.to_string());
        args.push(record.version().to_string());
        for (field, value) in record.fields() {
            if field == VERSION_FIELD {
                continue;
            }
            args.push(field);
            args.push(value);
        }

        let keys = vec![self.key(record.id())];
        let reply = self.save_script.exec(&self.client, &keys, &args)?;

        if reply.is_nil() {
            return Err(ClientError::VersionMismatch);
        }
        if let Some(msg) = reply.as_server_error() {
            return Err(ClientError::Server(msg.to_string()));
        }
        let stored = reply
            .as_str()
            .ok_or_else(|| ClientError::Decode("save reply is not a string".into()))?;
        let version = stored
            .parse()
            .map_err(|_| ClientError::Decode(format!("stored version {stored:?} is not numeric")))?;
        record.set_version(version);
        Ok(())
    }

    /// Delete the hash stored under `id`
    pub fn remove(&self, id: &str) -> Result<()> {
        let reply = self.client.execute(self.client.cmd().del(&self.key(id)))?;
        if let Some(msg) = reply.as_server_error() {
            return Err(ClientError::Server(msg.to_string()));
        }
        Ok(())
    }

    fn materialise(&self, id: &str, reply: RespValue) -> Result<Option<T>> {
        if let Some(msg) = reply.as_server_error() {
            return Err(ClientError::Server(msg.to_string()));
        }
        if reply.is_nil() {
            return Ok(None);
        }
        let pairs = reply
            .as_field_map()
            .ok_or_else(|| ClientError::Decode("hash reply is not a field map".into()))?;
        if pairs.is_empty() {
            return Ok(None);
        }

        let fields: HashMap<String, String> = pairs.into_iter().collect();
        let mut record = T::default();
        record.set_id(id.to_string());
        if let Some(version) = fields.get(VERSION_FIELD) {
            let version = version.parse().map_err(|_| {
                ClientError::Decode(format!("stored version {version:?} is not numeric"))
            })?;
            record.set_version(version);
        }
        record.apply_fields(&fields)?;
        Ok(Some(record))
    }
}
