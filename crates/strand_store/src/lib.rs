//! Duplicate-resolution pipeline for the Strand store node.
//!
//! After a cluster reconfiguration (membership change, partition
//! rebalancing) some partitions carry *duplicates*: peers holding candidate
//! versions of a record whose authoritative copy is not yet known. Before a
//! client-visible transaction on such a key proceeds, the coordinator asks
//! every candidate peer for its version, keeps the best one under the
//! namespace's conflict policy, installs it locally if it beats the local
//! copy, and hands the transaction back to the pipeline.
//!
//! `dup_res` holds the coordinator state machine and the request-side
//! responder, `rw_request` the in-flight entry table, `retransmit` the
//! sweep that re-sends and expires entries. The remaining modules are the
//! seams those three need: message codec, arbiter, namespaces, partitions,
//! records, fabric, and the transaction pipeline hooks.

pub mod arbiter;
pub mod config;
pub mod dup_res;
pub mod fabric;
pub mod msg;
pub mod namespace;
pub mod partition;
pub mod record;
pub mod retransmit;
pub mod rw_request;
pub mod transaction;
pub mod types;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use arbiter::{ConflictPolicy, RecordMeta, Winner};
pub use config::Config;
pub use fabric::{Fabric, LoopbackFabric};
pub use msg::{RwField, RwMsg, OP_DUP_ACK, OP_DUP_REQ};
pub use namespace::{Namespace, NamespaceRegistry};
pub use partition::{PartitionReservation, Partitions};
pub use rw_request::{RwKey, RwRequest, RwTable};
pub use transaction::{ClientOrigin, Pipeline, Transaction};
pub use types::{Digest, NodeId, ResultCode};

/// Node-wide collaborators handed to the duplicate-resolution entry points.
///
/// Everything the core touches is an explicit member here; there is no
/// process-global state.
pub struct NodeState {
    pub node_id: NodeId,
    pub namespaces: NamespaceRegistry,
    pub partitions: Arc<Partitions>,
    pub rw_table: RwTable,
    pub fabric: Arc<dyn Fabric>,
    pub pipeline: Arc<dyn Pipeline>,
    pub config: Config,
    /// Current cluster epoch key, advertised in requests for peers that
    /// still validate it.
    cluster_key: AtomicU64,
}

impl NodeState {
    pub fn new(
        node_id: NodeId,
        namespaces: NamespaceRegistry,
        fabric: Arc<dyn Fabric>,
        pipeline: Arc<dyn Pipeline>,
        config: Config,
    ) -> Arc<NodeState> {
        let partitions = Partitions::new(&namespaces, config.n_partitions);
        Arc::new(NodeState {
            node_id,
            namespaces,
            partitions,
            rw_table: RwTable::new(),
            fabric,
            pipeline,
            config,
            cluster_key: AtomicU64::new(0),
        })
    }

    pub fn cluster_key(&self) -> u64 {
        self.cluster_key.load(Ordering::Relaxed)
    }

    /// Advance the advertised cluster key after a reconfiguration.
    pub fn set_cluster_key(&self, key: u64) {
        self.cluster_key.store(key, Ordering::Relaxed);
    }
}
