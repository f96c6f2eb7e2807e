//! Retransmit and timeout sweep over the in-flight table.
//!
//! A background task periodically scans every in-flight entry: requests
//! whose retransmit deadline passed are re-sent to the peers that have not
//! answered, and entries past their transaction deadline are expired. On
//! expiry the sweep takes the client origin first - a concurrently arriving
//! ack observes the missing origin and cedes completion - then fires the
//! timeout callback and drops the entry from the table.

use std::sync::Arc;
use std::time::Instant;

use crate::dup_res;
use crate::NodeState;

/// One pass over the table at time `now`.
pub fn sweep(state: &NodeState, now: Instant) {
    for rw in state.rw_table.snapshot() {
        let key = rw.table_key();
        let mut core = rw.lock();

        if !core.is_set_up {
            continue;
        }

        if now > core.end_time {
            if let Some(origin) = core.origin.take() {
                if let Some(cb) = rw.timeout_cb() {
                    cb(&mut core, origin);
                }
            }
            drop(core);
            state.rw_table.remove(&key, &rw);
            continue;
        }

        if core.dup_res_complete {
            continue;
        }

        if now >= core.xmit_at {
            dup_res::send_to_incomplete(state, &mut core);
            let retry_interval = core.retry_interval;
            core.xmit_at += retry_interval;
        }
    }
}

/// Spawn the periodic sweep for `state`.
pub fn spawn(state: Arc<NodeState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.config.retransmit_scan_interval);
        loop {
            ticker.tick().await;
            sweep(&state, Instant::now());
        }
    })
}
