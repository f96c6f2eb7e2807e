//! Inter-node message fabric seam.
//!
//! The real fabric (connection management, flow control, channel selection)
//! lives outside this crate; the duplicate-resolution path only needs a
//! fire-and-forget send. `send` consumes the message: on success the fabric
//! owns the buffers, on failure they drop with the returned error.

use std::collections::VecDeque;
use std::sync::Mutex;

use bytes::Bytes;

use crate::msg::RwMsg;
use crate::types::NodeId;

pub trait Fabric: Send + Sync + 'static {
    /// Queue `msg` for delivery to `node`.
    fn send(&self, node: NodeId, msg: RwMsg) -> anyhow::Result<()>;
}

/// In-memory fabric that serializes every send through the wire codec and
/// parks it for a test harness (or an embedded single-process cluster) to
/// dispatch.
#[derive(Debug, Default)]
pub struct LoopbackFabric {
    sent: Mutex<VecDeque<(NodeId, Bytes)>>,
}

impl LoopbackFabric {
    pub fn new() -> LoopbackFabric {
        LoopbackFabric::default()
    }

    /// Drain queued sends, decoding each back into a message. The encode +
    /// decode round trip means loopback traffic exercises the same wire
    /// format as real peers.
    pub fn take_sent(&self) -> Vec<(NodeId, RwMsg)> {
        let drained: Vec<(NodeId, Bytes)> = match self.sent.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(_) => Vec::new(),
        };

        let mut out = Vec::with_capacity(drained.len());
        for (node, wire) in drained {
            match RwMsg::decode(wire) {
                Ok(msg) => out.push((node, msg)),
                Err(err) => {
                    tracing::warn!(node, error = ?err, "dropping undecodable loopback message");
                }
            }
        }
        out
    }

    pub fn pending(&self) -> usize {
        self.sent.lock().map(|guard| guard.len()).unwrap_or(0)
    }
}

impl Fabric for LoopbackFabric {
    fn send(&self, node: NodeId, msg: RwMsg) -> anyhow::Result<()> {
        let wire = msg.encode();
        let mut guard = self
            .sent
            .lock()
            .map_err(|_| anyhow::anyhow!("loopback fabric poisoned"))?;
        guard.push_back((node, wire));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{RwField, OP_DUP_REQ};

    #[test]
    fn loopback_round_trips_messages() {
        let fabric = LoopbackFabric::new();
        let mut msg = RwMsg::new();
        msg.set_u32(RwField::Op, OP_DUP_REQ);
        msg.set_u32(RwField::Tid, 7);
        fabric.send(3, msg).expect("send");

        assert_eq!(fabric.pending(), 1);
        let sent = fabric.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 3);
        assert_eq!(sent[0].1.get_u32(RwField::Tid), Some(7));
        assert_eq!(fabric.pending(), 0);
    }
}
