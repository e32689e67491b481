//! Dedicated sessions: one pinned wire for transactional work
//!
//! The first command carrying a concrete slot pins the session; from
//! then on every command must target that slot (or carry no slot at
//! all), because the wire belongs to the node owning it. Violating the
//! pin is a programmer error and panics.

use std::sync::Arc;

use super::client::Shared;
use crate::client::connection::{Conn, Wire};
use crate::command::{Command, ANY_SLOT};
use crate::utils::{RespValue, Result};

pub struct DedicatedSession {
    shared: Arc<Shared>,
    conn: Option<Conn>,
    wire: Option<Box<dyn Wire>>,
    slot: u16,
}

impl DedicatedSession {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            conn: None,
            wire: None,
            slot: ANY_SLOT,
        }
    }

    fn check(&mut self, slot: u16) {
        if slot == ANY_SLOT {
            return;
        }
        if self.slot == ANY_SLOT {
            self.slot = slot;
        } else if self.slot != slot {
            panic!("cross slot command in a dedicated session is prohibited");
        }
    }

    /// Borrow the wire lazily, once the session slot is known
    fn acquire(&mut self) -> Result<()> {
        if self.wire.is_some() {
            return Ok(());
        }
        if self.slot == ANY_SLOT {
            panic!("the first command in a dedicated session must carry a slot key");
        }
        let conn = self.shared.pick(self.slot)?;
        let wire = conn.acquire_wire()?;
        self.conn = Some(conn);
        self.wire = Some(wire);
        Ok(())
    }

    /// Execute a command on the session's wire
    pub fn execute(&mut self, cmd: Command) -> Result<RespValue> {
        self.check(cmd.slot());
        let result = match self.acquire() {
            Ok(()) => self.wire.as_mut().expect("acquired above").submit(&cmd),
            Err(e) => Err(e),
        };
        self.shared.cmd.reclaim(cmd);
        result
    }

    /// Execute a pipeline on the session's wire
    ///
    /// On acquisition or transport failure every element of the returned
    /// vector carries the error.
    pub fn execute_multi(&mut self, cmds: Vec<Command>) -> Vec<Result<RespValue>> {
        if cmds.is_empty() {
            return Vec::new();
        }
        for cmd in &cmds {
            self.check(cmd.slot());
        }
        let results = match self.acquire() {
            Ok(()) => {
                let refs: Vec<&Command> = cmds.iter().collect();
                match self.wire.as_mut().expect("acquired above").submit_multi(&refs) {
                    Ok(replies) => replies.into_iter().map(Ok).collect(),
                    Err(e) => cmds.iter().map(|_| Err(e.clone())).collect(),
                }
            }
            Err(e) => cmds.iter().map(|_| Err(e.clone())).collect(),
        };
        for cmd in cmds {
            self.shared.cmd.reclaim(cmd);
        }
        results
    }

    /// Return the wire to its owning connection. No-op when the wire was
    /// never acquired; never runs twice.
    pub(crate) fn release(&mut self) {
        if let (Some(conn), Some(wire)) = (self.conn.take(), self.wire.take()) {
            conn.return_wire(wire);
        }
    }
}

impl Drop for DedicatedSession {
    fn drop(&mut self) {
        // Covers early returns and panics inside the session scope.
        self.release();
    }
}
