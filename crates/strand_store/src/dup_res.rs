//! Duplicate resolution: coordinator state machine and request responder.
//!
//! The coordinator broadcasts a `DUP_REQ` to every peer holding a candidate
//! version of a key, accumulates their acks, keeps the best version under
//! the namespace's conflict policy, and on completion installs the winner
//! locally before invoking the completion callback. The responder side is
//! stateless: it reserves the partition, reads the local record, pickles it
//! and replies with a `DUP_ACK`.
//!
//! Per-entry state lives in `RwRequest`; each event (ack arrival,
//! retransmit, timeout) holds the entry lock for its whole transition so
//! the candidate bookkeeping and the completion check stay consistent.

use std::time::Instant;

use crate::arbiter::{self, RecordMeta, Winner};
use crate::msg::{RwField, RwMsg, OP_DUP_ACK, OP_DUP_REQ};
use crate::record::{self, RemoteRecord};
use crate::rw_request::{DupResCb, RwCore, RwKey, RwRequest, TimeoutCb};
use crate::transaction::Transaction;
use crate::types::{NodeId, ResultCode};
use crate::NodeState;

/// Compose the outbound duplicate-resolution request for `rw` and park it
/// on the entry for (re-)transmission. Returns false when the transaction
/// descriptor no longer holds a reservation to read from.
pub fn make_message(state: &NodeState, rw: &RwRequest, tx: &Transaction) -> bool {
    let Some(rsv) = tx.rsv.as_ref() else {
        return false;
    };

    let mut m = RwMsg::new();
    m.set_u32(RwField::Op, OP_DUP_REQ);
    m.set_copy(RwField::Namespace, tx.ns.name.as_bytes());
    m.set_u32(RwField::NsId, tx.ns.id);
    m.set_copy(RwField::Digest, &tx.keyd.0);
    m.set_u32(RwField::Tid, rw.tid);

    // TODO - stop sending once no supported peer version validates this.
    m.set_u64(RwField::ClusterKey, state.cluster_key());

    if let Some(meta) = rsv.tree.get_meta(&tx.keyd) {
        m.set_u32(RwField::Generation, u32::from(meta.generation));
        m.set_u64(RwField::LastUpdateTime, meta.last_update_time);
    }

    rw.lock().dest_msg = Some(m);
    true
}

/// Move the transaction's resources into the entry and arm it: destination
/// peers from the reservation's duplicate list, retransmit schedule, and
/// the two callbacks. After this the descriptor owns nothing transferable.
pub fn setup_rw(
    state: &NodeState,
    rw: &RwRequest,
    tx: &mut Transaction,
    on_done: DupResCb,
    on_timeout: TimeoutCb,
) {
    rw.set_callbacks(on_done, on_timeout);

    let now = Instant::now();
    let mut core = rw.lock();

    core.msgp = tx.msgp.take();
    core.origin = tx.origin.take();
    core.rsv = tx.rsv.take();
    // The entry now owns the reservation; it is released when the entry
    // is destroyed.

    core.end_time = tx.deadline;
    core.retry_interval = state.config.transaction_retry_interval;
    core.xmit_at = now + core.retry_interval;

    let dupl = core
        .rsv
        .as_ref()
        .map(|rsv| rsv.dupl_nodes.clone())
        .unwrap_or_default();
    core.dest_complete = vec![false; dupl.len()];
    core.dest_nodes = dupl;

    // Published last: the retransmit sweep may act on the entry as soon as
    // we unlock.
    core.is_set_up = true;
}

/// Kick off resolution with the initial broadcast to all duplicates.
pub fn start(state: &NodeState, rw: &RwRequest) {
    let mut core = rw.lock();
    send_to_incomplete(state, &mut core);
}

/// Send the composed request to every peer that has not answered yet.
/// Shared between the initial broadcast and the retransmit sweep.
pub(crate) fn send_to_incomplete(state: &NodeState, core: &mut RwCore) {
    let Some(dest_msg) = core.dest_msg.as_ref() else {
        return;
    };
    for (i, node) in core.dest_nodes.iter().enumerate() {
        if core.dest_complete[i] {
            continue;
        }
        if let Err(err) = state.fabric.send(*node, dest_msg.clone()) {
            tracing::warn!(node = *node, error = ?err, "dup-res request send failed");
        }
    }
}

/// Responder entry point: answer a peer's duplicate-resolution request for
/// a key we may hold a candidate version of.
pub fn handle_request(state: &NodeState, from: NodeId, mut msg: RwMsg) {
    let Some(keyd) = msg.get_digest(RwField::Digest) else {
        tracing::warn!(from, "dup-res request without digest");
        send_ack_for_bad_request(state, from, msg);
        return;
    };

    let Some(ns_name) = msg.get_bytes(RwField::Namespace) else {
        tracing::warn!(from, "dup-res request without namespace");
        send_ack_for_bad_request(state, from, msg);
        return;
    };

    let Some(ns) = state.namespaces.get_by_name_bytes(&ns_name) else {
        tracing::warn!(from, "dup-res request for unknown namespace");
        send_ack_for_bad_request(state, from, msg);
        return;
    };

    // Both fields present means the coordinator has a local copy and we can
    // skip shipping anything it could not use.
    let coord_meta = parse_coord_meta(&msg);

    // Done reading request fields; the ack reuses the identity fields.
    msg.preserve_fields(&[RwField::NsId, RwField::Digest, RwField::Tid]);

    let pid = keyd.partition_id(state.partitions.n_partitions());
    let Some(rsv) = state.partitions.reserve(&ns, pid) else {
        tracing::warn!(from, ns = %ns.name, pid, "dup-res request for unknown partition");
        send_ack_for_bad_request(state, from, msg);
        return;
    };

    let Some(local_meta) = rsv.tree.get_meta(&keyd) else {
        drop(rsv);
        send_ack(state, from, msg, ResultCode::NotFound);
        return;
    };

    if let Some(coord) = coord_meta {
        match arbiter::resolve(ns.policy, local_meta, coord) {
            Winner::Equal => {
                drop(rsv);
                send_ack(state, from, msg, ResultCode::RecordExists);
                return;
            }
            Winner::Right => {
                drop(rsv);
                send_ack(state, from, msg, ResultCode::Generation);
                return;
            }
            Winner::Left => {}
        }
    }

    let stored = match rsv.tree.open_read(&keyd) {
        Ok(Some(stored)) => stored,
        Ok(None) => {
            drop(rsv);
            send_ack(state, from, msg, ResultCode::NotFound);
            return;
        }
        Err(err) => {
            drop(rsv);
            send_ack(state, from, msg, err.code);
            return;
        }
    };

    msg.set_handoff(RwField::Record, record::pickle(&stored.bins));

    if let Some(set_name) = stored.set_name.as_deref() {
        msg.set_copy(RwField::SetName, set_name.as_bytes());
    }

    if let Some(user_key) = stored.key.as_deref() {
        msg.set_copy(RwField::Key, user_key);
    }

    msg.set_u32(RwField::Generation, u32::from(stored.meta.generation));
    msg.set_u64(RwField::LastUpdateTime, stored.meta.last_update_time);

    if stored.void_time != 0 {
        msg.set_u32(RwField::VoidTime, stored.void_time);
    }

    let info = record::pack_info(&stored);
    if info != 0 {
        msg.set_u32(RwField::Info, info);
    }

    drop(rsv);
    send_ack(state, from, msg, ResultCode::Ok);
}

/// Coordinator entry point: fold one peer's ack into the in-flight entry,
/// and finish the resolution when the last duplicate has answered.
pub fn handle_ack(state: &NodeState, from: NodeId, msg: RwMsg) {
    let Some(ns_id) = msg.get_u32(RwField::NsId) else {
        tracing::warn!(from, "dup-res ack without ns-id");
        return;
    };

    let Some(digest) = msg.get_digest(RwField::Digest) else {
        tracing::warn!(from, "dup-res ack without digest");
        return;
    };

    let Some(tid) = msg.get_u32(RwField::Tid) else {
        tracing::warn!(from, "dup-res ack without tid");
        return;
    };

    let key = RwKey { ns_id, digest };
    let Some(rw) = state.rw_table.get(&key) else {
        // Extra ack, after the entry is already gone.
        return;
    };

    let mut core = rw.lock();

    if rw.tid != tid || core.dup_res_complete {
        // The entry belongs to a newer transaction on the same key, or the
        // ack arrived after resolution finished.
        return;
    }

    let Some(i) = core.dest_nodes.iter().position(|n| *n == from) else {
        tracing::warn!(from, "dup-res ack from non-duplicate node");
        return;
    };

    if core.dest_complete[i] {
        // Extra ack from this duplicate.
        return;
    }

    core.dest_complete[i] = true;

    let (result_code, meta) = parse_dup_meta(&msg);

    if state.pipeline.should_retry(result_code) {
        if core.origin.is_none() {
            // Lost the race against the timeout sweep.
            return;
        }

        // The fresh transaction takes the client payload and origin; this
        // entry keeps (and releases) the reservation.
        let tx = Transaction::restart(
            rw.ns.clone(),
            rw.keyd,
            core.msgp.take(),
            core.origin.take(),
            core.end_time,
        );
        state.pipeline.enqueue(tx);

        core.dup_res_complete = true;
        drop(core);
        state.rw_table.remove(&key, &rw);
        return;
    }

    let keep_previous_best = core.best_dup_msg.is_some()
        && arbiter::resolve(rw.ns.policy, core.best_dup_meta, meta) != Winner::Right;

    if !keep_previous_best {
        // No previous best, or this candidate wins: retain the whole ack so
        // its field views stay valid until winner application.
        core.best_dup_msg = Some(msg);
        core.best_dup_meta = meta;
        core.best_dup_result = result_code;
    }
    // Either way the ack now belongs to the entry or has been dropped.

    if core.dest_complete.iter().any(|done| !done) {
        // Still waiting on other duplicates.
        return;
    }

    if core.best_dup_result == ResultCode::Ok {
        apply_winner(rw.as_ref(), &mut core);
    } else {
        core.result_code = core.best_dup_result;
    }

    // Check the timeout race *after* applying: even when the client is
    // already gone, installing the winner saves a future transaction from
    // re-fetching the duplicates.
    if core.origin.is_none() {
        return;
    }

    core.result_code = translate_result_code(core.result_code);

    let delete_from_table = match rw.dup_res_cb() {
        Some(cb) => cb(&mut core),
        None => true,
    };

    core.dup_res_complete = true;
    drop(core);

    if delete_from_table {
        state.rw_table.remove(&key, &rw);
    }
}

/// Install the best ack's record if it beats the local copy.
fn apply_winner(rw: &RwRequest, core: &mut RwCore) {
    let Some(best) = core.best_dup_msg.as_ref() else {
        core.result_code = ResultCode::Unknown;
        return;
    };

    let pickle = best.get_bytes(RwField::Record);
    let info = best.get_u32(RwField::Info).unwrap_or(0);
    let void_time = best.get_u32(RwField::VoidTime).unwrap_or(0);
    let set_name = best.get_bytes(RwField::SetName);
    let user_key = best.get_bytes(RwField::Key);

    let Some(pickle) = pickle.filter(|p| p.len() >= record::PICKLE_MIN_LEN) else {
        tracing::warn!(keyd = ?rw.keyd, "dup-res ack without record");
        core.result_code = ResultCode::Unknown;
        return;
    };

    if record::ignore_pickle(&pickle, info) {
        tracing::warn!(keyd = ?rw.keyd, "dup-res ack with binless pickle");
        core.result_code = ResultCode::Unknown;
        return;
    }

    let rr = RemoteRecord {
        digest: rw.keyd,
        meta: core.best_dup_meta,
        pickle,
        void_time,
        set_name,
        key: user_key,
        tombstone: info & record::INFO_TOMBSTONE != 0,
    };

    let Some(rsv) = core.rsv.as_ref() else {
        core.result_code = ResultCode::Unknown;
        return;
    };

    let code = rsv.tree.replace_if_better(&rr, rw.ns.policy);

    // A local copy at least as good as the winner is a successful no-op.
    core.result_code = match code {
        ResultCode::RecordExists | ResultCode::Generation => ResultCode::Ok,
        other => other,
    };
}

/// Tag the (possibly reused) message as an ack and send it back.
fn send_ack(state: &NodeState, node: NodeId, mut msg: RwMsg, result: ResultCode) {
    msg.set_u32(RwField::Op, OP_DUP_ACK);
    msg.set_u32(RwField::Result, result.as_u32());

    if let Err(err) = state.fabric.send(node, msg) {
        tracing::warn!(node, error = ?err, "dup-res ack send failed");
    }
}

/// Ack a request we could not parse, echoing whatever identity fields it
/// carried so the coordinator can drop the right entry's state.
fn send_ack_for_bad_request(state: &NodeState, node: NodeId, mut msg: RwMsg) {
    msg.preserve_fields(&[RwField::NsId, RwField::Digest, RwField::Tid]);

    // Best-effort code; nothing more specific fits a request we could not
    // parse.
    send_ack(state, node, msg, ResultCode::Unknown);
}

/// The coordinator's local version advertised in a request; present only
/// when both fields parse.
fn parse_coord_meta(msg: &RwMsg) -> Option<RecordMeta> {
    let generation = msg.get_u32(RwField::Generation)?;
    let last_update_time = msg.get_u64(RwField::LastUpdateTime)?;
    Some(RecordMeta {
        generation: generation as u16,
        last_update_time,
    })
}

/// Extract a peer outcome from an ack. A missing result code, or an `Ok`
/// ack missing its version metadata, degrades to `Unknown` - the peer still
/// counts as answered so a buggy peer cannot cause infinite retransmits.
fn parse_dup_meta(msg: &RwMsg) -> (ResultCode, RecordMeta) {
    let Some(result) = msg.get_u32(RwField::Result) else {
        tracing::warn!("dup-res ack without result code");
        return (ResultCode::Unknown, RecordMeta::default());
    };

    let result = ResultCode::from_u32(result);
    if result != ResultCode::Ok {
        return (result, RecordMeta::default());
    }

    let generation = match msg.get_u32(RwField::Generation) {
        Some(g) if g != 0 => g as u16,
        _ => {
            tracing::warn!("dup-res ack with no or bad generation");
            return (ResultCode::Unknown, RecordMeta::default());
        }
    };

    let Some(last_update_time) = msg.get_u64(RwField::LastUpdateTime) else {
        tracing::warn!("dup-res ack without last-update-time");
        return (ResultCode::Unknown, RecordMeta::default());
    };

    (
        ResultCode::Ok,
        RecordMeta {
            generation,
            last_update_time,
        },
    )
}

/// Map the terminal code to the client-visible outcome: codes that mean
/// "no peer had a better copy" are successes for duplicate resolution.
fn translate_result_code(code: ResultCode) -> ResultCode {
    match code {
        ResultCode::NotFound | ResultCode::RecordExists | ResultCode::Generation => ResultCode::Ok,
        other => other,
    }
}
