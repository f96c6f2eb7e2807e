//! In-flight transaction entries and the table that indexes them.
//!
//! One `RwRequest` exists per transaction that is waiting on duplicate
//! acks. All mutable state sits behind a single per-entry mutex held
//! briefly per event (ack arrival, retransmit, timeout); the identity
//! fields are fixed at creation. The table hands out counted references
//! (`Arc`), so an entry removed from the table survives until the last
//! event handler releases it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::arbiter::RecordMeta;
use crate::msg::RwMsg;
use crate::namespace::Namespace;
use crate::partition::PartitionReservation;
use crate::transaction::ClientOrigin;
use crate::types::{Digest, NodeId, ResultCode};

/// Completion callback. Runs with the entry lock held once the terminal
/// result is known; returns whether the entry should leave the table
/// (false keeps it discoverable for a follow-on phase).
pub type DupResCb = Box<dyn Fn(&mut RwCore) -> bool + Send + Sync>;

/// Timeout callback. Runs with the entry lock held after the deadline
/// passed; receives the client origin taken from the entry.
pub type TimeoutCb = Box<dyn Fn(&mut RwCore, ClientOrigin) + Send + Sync>;

/// Mutable state of an in-flight entry, guarded by the entry lock.
pub struct RwCore {
    /// Original client request payload, owned until completion or restart.
    pub msgp: Option<Bytes>,
    /// Client origin. `None` means the timeout side already took ownership
    /// of delivering a result.
    pub origin: Option<ClientOrigin>,
    /// Partition lease, held for the entry's whole lifetime.
    pub rsv: Option<PartitionReservation>,
    /// Composed outbound request, kept for retransmission.
    pub dest_msg: Option<RwMsg>,
    pub dest_nodes: Vec<NodeId>,
    pub dest_complete: Vec<bool>,
    /// Best candidate ack so far. The full message is retained so its
    /// field views stay valid until winner application.
    pub best_dup_msg: Option<RwMsg>,
    pub best_dup_meta: RecordMeta,
    pub best_dup_result: ResultCode,
    /// Terminal flag; once set no further duplicate-resolution transitions
    /// happen on this entry.
    pub dup_res_complete: bool,
    pub result_code: ResultCode,
    pub xmit_at: Instant,
    pub retry_interval: Duration,
    pub end_time: Instant,
    /// Published last during setup; the retransmit sweep ignores entries
    /// that are not yet set up.
    pub is_set_up: bool,
}

impl RwCore {
    fn new(now: Instant) -> RwCore {
        RwCore {
            msgp: None,
            origin: None,
            rsv: None,
            dest_msg: None,
            dest_nodes: Vec::new(),
            dest_complete: Vec::new(),
            best_dup_msg: None,
            best_dup_meta: RecordMeta::default(),
            best_dup_result: ResultCode::Unknown,
            dup_res_complete: false,
            result_code: ResultCode::Ok,
            xmit_at: now,
            retry_interval: Duration::ZERO,
            end_time: now,
            is_set_up: false,
        }
    }
}

/// One in-flight read/write transaction.
pub struct RwRequest {
    pub ns: Arc<Namespace>,
    pub keyd: Digest,
    /// Disambiguates successive transactions on the same key.
    pub tid: u32,
    core: Mutex<RwCore>,
    dup_res_cb: OnceLock<DupResCb>,
    timeout_cb: OnceLock<TimeoutCb>,
}

impl RwRequest {
    pub fn new(ns: Arc<Namespace>, keyd: Digest, tid: u32, now: Instant) -> Arc<RwRequest> {
        Arc::new(RwRequest {
            ns,
            keyd,
            tid,
            core: Mutex::new(RwCore::new(now)),
            dup_res_cb: OnceLock::new(),
            timeout_cb: OnceLock::new(),
        })
    }

    /// Acquire the entry lock. A poisoned lock is recovered rather than
    /// propagated; the state transitions are all panic-free.
    pub fn lock(&self) -> MutexGuard<'_, RwCore> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach the completion and timeout callbacks. Set once during setup,
    /// before the entry is published to other threads.
    pub fn set_callbacks(&self, on_done: DupResCb, on_timeout: TimeoutCb) {
        let _ = self.dup_res_cb.set(on_done);
        let _ = self.timeout_cb.set(on_timeout);
    }

    pub fn dup_res_cb(&self) -> Option<&DupResCb> {
        self.dup_res_cb.get()
    }

    pub fn timeout_cb(&self) -> Option<&TimeoutCb> {
        self.timeout_cb.get()
    }

    pub fn table_key(&self) -> RwKey {
        RwKey {
            ns_id: self.ns.id,
            digest: self.keyd,
        }
    }
}

/// Key of the in-flight table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RwKey {
    pub ns_id: u32,
    pub digest: Digest,
}

/// Table of in-flight transactions, keyed by `(namespace id, digest)`.
#[derive(Default)]
pub struct RwTable {
    entries: RwLock<HashMap<RwKey, Arc<RwRequest>>>,
    next_tid: AtomicU32,
}

impl RwTable {
    pub fn new() -> RwTable {
        RwTable::default()
    }

    /// Allocate a transaction id for a new entry.
    pub fn next_tid(&self) -> u32 {
        self.next_tid.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert an entry. Fails (returns false) when a transaction for the
    /// same key is already in flight.
    pub fn insert(&self, rw: Arc<RwRequest>) -> bool {
        let Ok(mut guard) = self.entries.write() else {
            return false;
        };
        match guard.entry(rw.table_key()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(rw);
                true
            }
        }
    }

    /// Look up an entry, returning a counted reference the caller releases
    /// by dropping.
    pub fn get(&self, key: &RwKey) -> Option<Arc<RwRequest>> {
        let guard = self.entries.read().ok()?;
        guard.get(key).cloned()
    }

    /// Remove `rw` from the table. A different entry that has since taken
    /// the same key is left alone.
    pub fn remove(&self, key: &RwKey, rw: &Arc<RwRequest>) {
        let Ok(mut guard) = self.entries.write() else {
            return;
        };
        if guard.get(key).is_some_and(|held| Arc::ptr_eq(held, rw)) {
            guard.remove(key);
        }
    }

    /// Counted references to every current entry, for the retransmit sweep.
    pub fn snapshot(&self) -> Vec<Arc<RwRequest>> {
        match self.entries.read() {
            Ok(guard) => guard.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
