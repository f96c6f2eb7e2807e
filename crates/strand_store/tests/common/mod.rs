//! Shared harness for duplicate-resolution scenarios: a small in-process
//! cluster whose nodes talk over loopback fabrics, with the test body
//! pumping message delivery so interleavings stay deterministic.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use smallvec::smallvec;
use tokio::sync::oneshot;

use strand_store::arbiter::ConflictPolicy;
use strand_store::dup_res;
use strand_store::record::{Bin, Bins, StoredRecord};
use strand_store::rw_request::RwRequest;
use strand_store::transaction::{ClientOrigin, Pipeline, Transaction};
use strand_store::{
    Config, Digest, LoopbackFabric, NodeId, NodeState, RecordMeta, ResultCode, RwField, RwMsg,
    OP_DUP_ACK, OP_DUP_REQ,
};

/// Pipeline stub that records every enqueued transaction.
#[derive(Default)]
pub struct TestPipeline {
    pub enqueued: Mutex<Vec<Transaction>>,
}

impl Pipeline for TestPipeline {
    fn enqueue(&self, tx: Transaction) {
        if let Ok(mut guard) = self.enqueued.lock() {
            guard.push(tx);
        }
    }
}

pub struct TestNode {
    pub state: Arc<NodeState>,
    pub fabric: Arc<LoopbackFabric>,
    pub pipeline: Arc<TestPipeline>,
}

pub struct Cluster {
    nodes: Vec<TestNode>,
}

impl Cluster {
    pub fn new(node_ids: &[NodeId], policy: ConflictPolicy) -> Cluster {
        let nodes = node_ids
            .iter()
            .map(|id| {
                let fabric = Arc::new(LoopbackFabric::new());
                let pipeline = Arc::new(TestPipeline::default());
                let namespaces = strand_store::NamespaceRegistry::new(vec![
                    strand_store::Namespace::new("test", 1, policy),
                ]);
                let state = NodeState::new(
                    *id,
                    namespaces,
                    fabric.clone(),
                    pipeline.clone(),
                    Config::default(),
                );
                TestNode {
                    state,
                    fabric,
                    pipeline,
                }
            })
            .collect();
        Cluster { nodes }
    }

    pub fn node(&self, id: NodeId) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.state.node_id == id)
            .expect("unknown node id")
    }

    /// Hand one message to its destination's entry point.
    pub fn dispatch(&self, from: NodeId, to: NodeId, msg: RwMsg) {
        let target = self.node(to);
        match msg.get_u32(RwField::Op) {
            Some(OP_DUP_REQ) => dup_res::handle_request(&target.state, from, msg),
            Some(OP_DUP_ACK) => dup_res::handle_ack(&target.state, from, msg),
            other => panic!("unexpected op {other:?}"),
        }
    }

    /// Deliver queued messages until every fabric is quiet.
    pub fn pump(&self) {
        loop {
            let mut delivered = false;
            for node in &self.nodes {
                let from = node.state.node_id;
                for (to, msg) in node.fabric.take_sent() {
                    delivered = true;
                    self.dispatch(from, to, msg);
                }
            }
            if !delivered {
                break;
            }
        }
    }
}

pub fn digest(tag: u8) -> Digest {
    Digest([tag; strand_store::types::DIGEST_LEN])
}

/// Store a one-bin record on a node.
pub fn seed_record(node: &TestNode, keyd: Digest, generation: u16, lut: u64, value: &[u8]) {
    let pid = keyd.partition_id(node.state.partitions.n_partitions());
    let tree = node.state.partitions.tree(1, pid).expect("tree");
    let bins: Bins = smallvec![Bin {
        name: "v".into(),
        value: value.to_vec(),
    }];
    tree.put(
        keyd,
        StoredRecord {
            meta: RecordMeta {
                generation,
                last_update_time: lut,
            },
            bins,
            ..StoredRecord::default()
        },
    );
}

/// Read back the "v" bin of a record, if the record exists.
pub fn record_bin(node: &TestNode, keyd: Digest) -> Option<Vec<u8>> {
    let pid = keyd.partition_id(node.state.partitions.n_partitions());
    let tree = node.state.partitions.tree(1, pid).expect("tree");
    let stored = tree.open_read(&keyd).expect("read")?;
    stored
        .bins
        .iter()
        .find(|b| b.name == "v")
        .map(|b| b.value.clone())
}

pub fn record_meta(node: &TestNode, keyd: Digest) -> Option<RecordMeta> {
    let pid = keyd.partition_id(node.state.partitions.n_partitions());
    let tree = node.state.partitions.tree(1, pid).expect("tree");
    tree.get_meta(&keyd)
}

/// A started duplicate resolution with its observable outcomes.
pub struct Started {
    pub rw: Arc<RwRequest>,
    /// Every completion-callback invocation, in order.
    pub done: Arc<Mutex<Vec<ResultCode>>>,
    /// Every timeout-callback invocation, in order.
    pub timed_out: Arc<Mutex<Vec<ResultCode>>>,
    pub client_rx: oneshot::Receiver<ResultCode>,
}

impl Started {
    pub fn done_codes(&self) -> Vec<ResultCode> {
        self.done.lock().expect("done lock").clone()
    }

    pub fn timeout_codes(&self) -> Vec<ResultCode> {
        self.timed_out.lock().expect("timeout lock").clone()
    }
}

/// Begin duplicate resolution on `coord` for `keyd` against `dupl` peers,
/// including the initial request broadcast.
pub fn start_dup_res(coord: &TestNode, keyd: Digest, dupl: Vec<NodeId>) -> Started {
    let ns = coord.state.namespaces.get_by_id(1).expect("namespace");
    let pid = keyd.partition_id(coord.state.partitions.n_partitions());
    coord.state.partitions.set_duplicates(&ns, pid, dupl);

    let (origin, client_rx) = ClientOrigin::channel();
    let mut tx = Transaction {
        ns: ns.clone(),
        keyd,
        msgp: Some(Bytes::from_static(b"client-request")),
        origin: Some(origin),
        rsv: coord.state.partitions.reserve(&ns, pid),
        deadline: Instant::now() + coord.state.config.transaction_max,
        restart: false,
    };

    let rw = RwRequest::new(ns, keyd, coord.state.rw_table.next_tid(), Instant::now());
    assert!(coord.state.rw_table.insert(rw.clone()));
    assert!(dup_res::make_message(&coord.state, &rw, &tx));

    let done = Arc::new(Mutex::new(Vec::new()));
    let timed_out = Arc::new(Mutex::new(Vec::new()));
    let done_sink = done.clone();
    let timeout_sink = timed_out.clone();

    dup_res::setup_rw(
        &coord.state,
        &rw,
        &mut tx,
        Box::new(move |core| {
            if let Ok(mut guard) = done_sink.lock() {
                guard.push(core.result_code);
            }
            if let Some(origin) = core.origin.take() {
                origin.respond(core.result_code);
            }
            true
        }),
        Box::new(move |_core, origin| {
            if let Ok(mut guard) = timeout_sink.lock() {
                guard.push(ResultCode::Timeout);
            }
            origin.respond(ResultCode::Timeout);
        }),
    );

    dup_res::start(&coord.state, &rw);

    Started {
        rw,
        done,
        timed_out,
        client_rx,
    }
}

/// Craft an ack for `rw`'s transaction by hand, for codes the stock
/// responder never produces.
pub fn craft_ack(rw: &RwRequest, result: ResultCode, meta: Option<RecordMeta>) -> RwMsg {
    let mut m = RwMsg::new();
    m.set_u32(RwField::Op, OP_DUP_ACK);
    m.set_u32(RwField::NsId, rw.ns.id);
    m.set_copy(RwField::Digest, &rw.keyd.0);
    m.set_u32(RwField::Tid, rw.tid);
    m.set_u32(RwField::Result, result.as_u32());
    if let Some(meta) = meta {
        m.set_u32(RwField::Generation, u32::from(meta.generation));
        m.set_u64(RwField::LastUpdateTime, meta.last_update_time);
    }
    m
}

/// Convenience for the expected wall-clock-independent deadline pass.
pub fn past_deadline(rw: &RwRequest) -> Instant {
    rw.lock().end_time + Duration::from_millis(1)
}
