//! Coroutine bookkeeping for latent calls.
//!
//! A latent native call issued from a coroutine suspends that coroutine and
//! hands the host a continuation token. When the host signals completion,
//! the token resolves back to the coroutine and its resume hook runs with
//! zero additional arguments. Tokens are issued once and consumed once.

use rustc_hash::FxHashMap;

use crate::script::runtime::ScriptFunction;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CoroutineId(u32);

impl CoroutineId {
    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// Opaque token written into a latent call's `LatentInfo` parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContinuationToken(u64);

impl ContinuationToken {
    pub fn from_raw(raw: u64) -> ContinuationToken {
        ContinuationToken(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Which thread of execution script code is currently running on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ThreadId {
    #[default]
    Primary,
    Coroutine(CoroutineId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoroutineStatus {
    Running,
    Suspended,
    Dead,
}

struct CoroutineState {
    status: CoroutineStatus,
    resume: Option<ScriptFunction>,
}

#[derive(Default)]
pub struct CoroutineTable {
    coroutines: FxHashMap<CoroutineId, CoroutineState>,
    pending: FxHashMap<ContinuationToken, CoroutineId>,
    next_id: u32,
    next_token: u64,
}

impl CoroutineTable {
    pub fn new() -> CoroutineTable {
        CoroutineTable::default()
    }

    /// Registers a running coroutine. `resume` runs when a latent call
    /// issued from it completes.
    pub fn spawn(&mut self, resume: Option<ScriptFunction>) -> CoroutineId {
        let id = CoroutineId(self.next_id);
        self.next_id += 1;
        self.coroutines.insert(
            id,
            CoroutineState {
                status: CoroutineStatus::Running,
                resume,
            },
        );
        id
    }

    pub fn status(&self, id: CoroutineId) -> CoroutineStatus {
        self.coroutines
            .get(&id)
            .map(|c| c.status)
            .unwrap_or(CoroutineStatus::Dead)
    }

    /// Issues a fresh continuation token bound to `id`.
    pub fn issue_token(&mut self, id: CoroutineId) -> ContinuationToken {
        let token = ContinuationToken(self.next_token);
        self.next_token += 1;
        self.pending.insert(token, id);
        token
    }

    pub fn suspend(&mut self, id: CoroutineId) {
        if let Some(c) = self.coroutines.get_mut(&id) {
            if c.status == CoroutineStatus::Running {
                c.status = CoroutineStatus::Suspended;
            }
        }
    }

    /// Consumes `token`, returning the coroutine it was bound to.
    pub fn take_pending(&mut self, token: ContinuationToken) -> Option<CoroutineId> {
        self.pending.remove(&token)
    }

    pub fn resume_hook(&mut self, id: CoroutineId) -> Option<ScriptFunction> {
        let c = self.coroutines.get_mut(&id)?;
        c.status = CoroutineStatus::Running;
        c.resume.clone()
    }

    pub fn finish(&mut self, id: CoroutineId) {
        if let Some(c) = self.coroutines.get_mut(&id) {
            c.status = CoroutineStatus::Dead;
        }
        self.pending.retain(|_, v| *v != id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.coroutines.clear();
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_binds_and_consumes() {
        let mut table = CoroutineTable::new();
        let id = table.spawn(None);
        let token = table.issue_token(id);
        table.suspend(id);
        assert_eq!(table.status(id), CoroutineStatus::Suspended);
        assert_eq!(table.take_pending(token), Some(id));
        assert_eq!(table.take_pending(token), None);
    }

    #[test]
    fn finish_drops_outstanding_tokens() {
        let mut table = CoroutineTable::new();
        let id = table.spawn(None);
        let token = table.issue_token(id);
        table.finish(id);
        assert_eq!(table.status(id), CoroutineStatus::Dead);
        assert_eq!(table.take_pending(token), None);
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn unknown_coroutine_is_dead() {
        let table = CoroutineTable::new();
        assert_eq!(table.status(CoroutineId(99)), CoroutineStatus::Dead);
    }
}
