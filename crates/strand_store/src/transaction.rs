//! Transaction descriptors and the pipeline seam.
//!
//! A `Transaction` is the unit the surrounding read/write pipeline hands to
//! duplicate resolution and receives back on a restart. Its movable
//! resources (client origin, request payload, partition reservation) are
//! transferred into the in-flight entry during setup; after that the
//! descriptor owns nothing.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::namespace::Namespace;
use crate::partition::PartitionReservation;
use crate::types::{Digest, ResultCode};

/// Handle identifying where the transaction's final result is delivered.
#[derive(Debug)]
pub struct ClientOrigin {
    reply: oneshot::Sender<ResultCode>,
}

impl ClientOrigin {
    /// Create an origin and the receiving half the client side waits on.
    pub fn channel() -> (ClientOrigin, oneshot::Receiver<ResultCode>) {
        let (reply, rx) = oneshot::channel();
        (ClientOrigin { reply }, rx)
    }

    /// Deliver the terminal result. A vanished client is not an error.
    pub fn respond(self, code: ResultCode) {
        let _ = self.reply.send(code);
    }
}

/// A read/write transaction as seen by duplicate resolution.
#[derive(Debug)]
pub struct Transaction {
    pub ns: Arc<Namespace>,
    pub keyd: Digest,
    /// Original client request payload; carried so a restart can re-enter
    /// the pipeline from the top.
    pub msgp: Option<Bytes>,
    pub origin: Option<ClientOrigin>,
    pub rsv: Option<PartitionReservation>,
    pub deadline: Instant,
    /// Set when this descriptor was re-queued by duplicate resolution and
    /// must restart from the top of the pipeline.
    pub restart: bool,
}

impl Transaction {
    /// Rebuild a descriptor from an in-flight entry's resources for a
    /// restart. The new transaction acquires its own reservation when the
    /// pipeline picks it up.
    pub fn restart(
        ns: Arc<Namespace>,
        keyd: Digest,
        msgp: Option<Bytes>,
        origin: Option<ClientOrigin>,
        deadline: Instant,
    ) -> Transaction {
        Transaction {
            ns,
            keyd,
            msgp,
            origin,
            rsv: None,
            deadline,
            restart: true,
        }
    }
}

/// Seam back into the surrounding transaction pipeline.
pub trait Pipeline: Send + Sync + 'static {
    /// Queue a transaction for (re-)processing from the top.
    fn enqueue(&self, tx: Transaction);

    /// Whether a peer result code invalidates the whole attempt and the
    /// transaction should restart rather than continue resolving.
    fn should_retry(&self, code: ResultCode) -> bool {
        matches!(code, ResultCode::ClusterKeyMismatch)
    }
}
