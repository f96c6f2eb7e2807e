//! Partition trees, scoped reservations, and the replace-if-better installer.
//!
//! A reservation pins a partition's tree while a caller reads or writes it,
//! and carries the partition's current duplicate-node list. Reservations are
//! scoped resources: dropping one releases the lease, so every exit path
//! balances automatically.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::arbiter::{self, ConflictPolicy, RecordMeta, Winner};
use crate::namespace::{Namespace, NamespaceRegistry};
use crate::record::{self, RemoteRecord, StoredRecord};
use crate::types::{Digest, NodeId, ResultCode};

/// Storage-layer failure, carrying the wire result code forwarded to peers.
#[derive(Clone, Copy, Debug)]
pub struct StorageError {
    pub code: ResultCode,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "storage error ({:?})", self.code)
    }
}

impl std::error::Error for StorageError {}

/// In-memory record tree for one partition.
#[derive(Debug, Default)]
pub struct PartitionTree {
    records: RwLock<HashMap<Digest, StoredRecord>>,
    read_fault: Mutex<Option<ResultCode>>,
}

impl PartitionTree {
    /// Index lookup: version metadata only, no record open.
    pub fn get_meta(&self, keyd: &Digest) -> Option<RecordMeta> {
        let guard = self.records.read().ok()?;
        guard.get(keyd).map(|r| r.meta)
    }

    /// Open a record for reading and load its bins.
    pub fn open_read(&self, keyd: &Digest) -> Result<Option<StoredRecord>, StorageError> {
        if let Ok(fault) = self.read_fault.lock() {
            if let Some(code) = *fault {
                return Err(StorageError { code });
            }
        }
        let guard = self
            .records
            .read()
            .map_err(|_| StorageError {
                code: ResultCode::Unknown,
            })?;
        Ok(guard.get(keyd).cloned())
    }

    /// Insert or overwrite a record unconditionally.
    pub fn put(&self, keyd: Digest, record: StoredRecord) {
        if let Ok(mut guard) = self.records.write() {
            guard.insert(keyd, record);
        }
    }

    /// Install `rr` only if it beats the local copy under `policy`.
    ///
    /// Returns `Generation` when the local copy is strictly better,
    /// `RecordExists` when the versions are indistinguishable, and `Ok`
    /// when the remote record was installed.
    pub fn replace_if_better(&self, rr: &RemoteRecord, policy: ConflictPolicy) -> ResultCode {
        let bins = match record::unpickle(&rr.pickle) {
            Ok(bins) => bins,
            Err(err) => {
                tracing::warn!(keyd = ?rr.digest, error = ?err, "bad pickle in remote record");
                return ResultCode::Unknown;
            }
        };

        let Ok(mut guard) = self.records.write() else {
            return ResultCode::Unknown;
        };

        if let Some(local) = guard.get(&rr.digest) {
            match arbiter::resolve(policy, local.meta, rr.meta) {
                Winner::Left => return ResultCode::Generation,
                Winner::Equal => return ResultCode::RecordExists,
                Winner::Right => {}
            }
        }

        let set_name = rr
            .set_name
            .as_ref()
            .and_then(|b| std::str::from_utf8(b).ok())
            .map(str::to_string);
        guard.insert(
            rr.digest,
            StoredRecord {
                meta: rr.meta,
                void_time: rr.void_time,
                set_name,
                key: rr.key.as_ref().map(|b| b.to_vec()),
                tombstone: rr.tombstone,
                bins,
            },
        );
        ResultCode::Ok
    }

    /// Make the next `open_read` calls fail with `code`. `None` clears.
    pub fn inject_read_fault(&self, code: Option<ResultCode>) {
        if let Ok(mut fault) = self.read_fault.lock() {
            *fault = code;
        }
    }
}

/// All partition trees for the node's namespaces, plus the rebalance-time
/// duplicate lists.
#[derive(Debug)]
pub struct Partitions {
    n_partitions: u32,
    trees: HashMap<u32, Vec<Arc<PartitionTree>>>,
    duplicates: RwLock<HashMap<(u32, u32), Vec<NodeId>>>,
    active: AtomicUsize,
}

impl Partitions {
    pub fn new(namespaces: &NamespaceRegistry, n_partitions: u32) -> Arc<Partitions> {
        let n_partitions = n_partitions.max(1);
        let mut trees = HashMap::new();
        for ns in namespaces.iter() {
            let mut per_ns = Vec::with_capacity(n_partitions as usize);
            for _ in 0..n_partitions {
                per_ns.push(Arc::new(PartitionTree::default()));
            }
            trees.insert(ns.id, per_ns);
        }
        Arc::new(Partitions {
            n_partitions,
            trees,
            duplicates: RwLock::new(HashMap::new()),
            active: AtomicUsize::new(0),
        })
    }

    pub fn n_partitions(&self) -> u32 {
        self.n_partitions
    }

    pub fn tree(&self, ns_id: u32, pid: u32) -> Option<Arc<PartitionTree>> {
        self.trees.get(&ns_id)?.get(pid as usize).cloned()
    }

    /// Record which peers hold candidate versions for a partition. Set by
    /// the cluster-state layer after a reconfiguration.
    pub fn set_duplicates(&self, ns: &Namespace, pid: u32, nodes: Vec<NodeId>) {
        if let Ok(mut guard) = self.duplicates.write() {
            guard.insert((ns.id, pid), nodes);
        }
    }

    /// Take a lease on a partition. The reservation pins the tree and
    /// snapshots the duplicate list; it is released on drop.
    pub fn reserve(
        self: &Arc<Self>,
        ns: &Arc<Namespace>,
        pid: u32,
    ) -> Option<PartitionReservation> {
        let tree = self.tree(ns.id, pid)?;
        let dupl_nodes = self
            .duplicates
            .read()
            .ok()
            .and_then(|guard| guard.get(&(ns.id, pid)).cloned())
            .unwrap_or_default();
        self.active.fetch_add(1, Ordering::Relaxed);
        Some(PartitionReservation {
            ns: ns.clone(),
            pid,
            tree,
            dupl_nodes,
            owner: self.clone(),
        })
    }

    /// Number of reservations currently held.
    pub fn active_reservations(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

/// Scoped lease on one partition.
#[derive(Debug)]
pub struct PartitionReservation {
    pub ns: Arc<Namespace>,
    pub pid: u32,
    pub tree: Arc<PartitionTree>,
    pub dupl_nodes: Vec<NodeId>,
    owner: Arc<Partitions>,
}

impl Drop for PartitionReservation {
    fn drop(&mut self) {
        self.owner.active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::ConflictPolicy;
    use bytes::Bytes;
    use smallvec::smallvec;

    fn digest(tag: u8) -> Digest {
        Digest([tag; crate::types::DIGEST_LEN])
    }

    fn remote(meta: RecordMeta) -> RemoteRecord {
        let bins: record::Bins = smallvec![record::Bin {
            name: "v".into(),
            value: vec![meta.generation as u8],
        }];
        RemoteRecord {
            digest: digest(1),
            meta,
            pickle: Bytes::from(record::pickle(&bins)),
            void_time: 0,
            set_name: None,
            key: None,
            tombstone: false,
        }
    }

    #[test]
    fn replace_if_better_installs_only_winners() {
        let tree = PartitionTree::default();
        let policy = ConflictPolicy::Generation;
        tree.put(
            digest(1),
            StoredRecord {
                meta: RecordMeta {
                    generation: 4,
                    last_update_time: 100,
                },
                ..StoredRecord::default()
            },
        );

        // Strictly worse: rejected.
        let worse = remote(RecordMeta {
            generation: 3,
            last_update_time: 500,
        });
        assert_eq!(tree.replace_if_better(&worse, policy), ResultCode::Generation);

        // Indistinguishable: rejected as already present.
        let equal = remote(RecordMeta {
            generation: 4,
            last_update_time: 100,
        });
        assert_eq!(tree.replace_if_better(&equal, policy), ResultCode::RecordExists);

        // Strictly better: installed.
        let better = remote(RecordMeta {
            generation: 5,
            last_update_time: 90,
        });
        assert_eq!(tree.replace_if_better(&better, policy), ResultCode::Ok);
        assert_eq!(
            tree.get_meta(&digest(1)),
            Some(RecordMeta {
                generation: 5,
                last_update_time: 90,
            })
        );
    }

    #[test]
    fn replace_if_better_installs_when_no_local_copy() {
        let tree = PartitionTree::default();
        let rr = remote(RecordMeta {
            generation: 1,
            last_update_time: 1,
        });
        assert_eq!(
            tree.replace_if_better(&rr, ConflictPolicy::LastUpdateTime),
            ResultCode::Ok
        );
    }

    #[test]
    fn read_fault_is_forwarded() {
        let tree = PartitionTree::default();
        tree.put(digest(2), StoredRecord::default());
        tree.inject_read_fault(Some(ResultCode::DeviceRead));
        let err = tree.open_read(&digest(2)).expect_err("injected fault");
        assert_eq!(err.code, ResultCode::DeviceRead);
        tree.inject_read_fault(None);
        assert!(tree.open_read(&digest(2)).expect("read").is_some());
    }

    #[test]
    fn reservations_balance_on_drop() {
        let registry = NamespaceRegistry::new(vec![Namespace::new(
            "test",
            1,
            ConflictPolicy::Generation,
        )]);
        let partitions = Partitions::new(&registry, 8);
        let ns = registry.get_by_id(1).expect("namespace");

        assert_eq!(partitions.active_reservations(), 0);
        let rsv_a = partitions.reserve(&ns, 0).expect("reserve");
        let rsv_b = partitions.reserve(&ns, 3).expect("reserve");
        assert_eq!(partitions.active_reservations(), 2);
        drop(rsv_a);
        assert_eq!(partitions.active_reservations(), 1);
        drop(rsv_b);
        assert_eq!(partitions.active_reservations(), 0);
    }

    #[test]
    fn reservation_snapshots_duplicate_list() {
        let registry = NamespaceRegistry::new(vec![Namespace::new(
            "test",
            1,
            ConflictPolicy::Generation,
        )]);
        let partitions = Partitions::new(&registry, 8);
        let ns = registry.get_by_id(1).expect("namespace");
        partitions.set_duplicates(&ns, 5, vec![20, 30]);

        let rsv = partitions.reserve(&ns, 5).expect("reserve");
        assert_eq!(rsv.dupl_nodes, vec![20, 30]);
        let clean = partitions.reserve(&ns, 6).expect("reserve");
        assert!(clean.dupl_nodes.is_empty());
    }
}
