//! Server-side script execution
//!
//! Scripts are addressed by their SHA-1 digest so the body crosses the
//! wire only when a node does not have it cached yet: execution first
//! tries `EVALSHA` and falls back to `EVAL` on a `NOSCRIPT` reply. The
//! fallback is internal; callers never see `NOSCRIPT`.

use sha1::{Digest, Sha1};

use crate::cluster::ClusterClient;
use crate::utils::{RespValue, Result};

pub struct Script {
    body: String,
    sha1: String,
}

impl Script {
    pub fn new(body: &str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(body.as_bytes());
        Self {
            body: body.to_string(),
            sha1: format!("{:x}", hasher.finalize()),
        }
    }

    /// Hex SHA-1 digest of the script body
    pub fn sha1(&self) -> &str {
        &self.sha1
    }

    /// Execute on the node owning the first key
    pub fn exec(&self, client: &ClusterClient, keys: &[String], args: &[String]) -> Result<RespValue> {
        let reply = client.execute(client.cmd().evalsha(&self.sha1, keys, args))?;
        if reply.is_no_script() {
            return client.execute(client.cmd().eval(&self.body, keys, args));
        }
        Ok(reply)
    }

    /// Execute through the read-only script variants, allowed on
    /// replicas by the server
    pub fn exec_read(
        &self,
        client: &ClusterClient,
        keys: &[String],
        args: &[String],
    ) -> Result<RespValue> {
        let reply = client.execute(client.cmd().evalsha_ro(&self.sha1, keys, args))?;
        if reply.is_no_script() {
            return client.execute(client.cmd().eval_ro(&self.body, keys, args));
        }
        Ok(reply)
    }
}
