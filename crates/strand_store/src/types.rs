//! Shared identifiers and wire result codes.
//!
//! These types are kept in a small, dependency-light module because they are
//! used on both sides of the fabric boundary: the coordinator, the responder,
//! and the storage layer all speak in digests, node ids, and result codes.

use std::fmt;

/// Logical node identifier within the cluster.
pub type NodeId = u64;

/// Length of a record digest in bytes.
pub const DIGEST_LEN: usize = 20;

/// Content hash identifying a key. Fixed 20 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
    /// Parse a digest from a wire buffer; anything but exactly 20 bytes is
    /// rejected.
    pub fn from_slice(bytes: &[u8]) -> Option<Digest> {
        let arr: [u8; DIGEST_LEN] = bytes.try_into().ok()?;
        Some(Digest(arr))
    }

    /// Partition owning this digest: the leading two bytes, modulo the
    /// configured partition count.
    pub fn partition_id(&self, n_partitions: u32) -> u32 {
        let lead = u16::from_be_bytes([self.0[0], self.0[1]]);
        u32::from(lead) % n_partitions.max(1)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Result code carried in the `RESULT` field of an ack and delivered to the
/// transaction pipeline as the terminal outcome.
///
/// Codes not named here (peer storage errors) are carried through opaquely
/// as `Other`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    Unknown,
    NotFound,
    Generation,
    RecordExists,
    Timeout,
    ClusterKeyMismatch,
    DeviceRead,
    Other(u32),
}

impl ResultCode {
    pub fn as_u32(self) -> u32 {
        match self {
            ResultCode::Ok => 0,
            ResultCode::Unknown => 1,
            ResultCode::NotFound => 2,
            ResultCode::Generation => 3,
            ResultCode::RecordExists => 5,
            ResultCode::Timeout => 9,
            ResultCode::ClusterKeyMismatch => 11,
            ResultCode::DeviceRead => 18,
            ResultCode::Other(v) => v,
        }
    }

    pub fn from_u32(v: u32) -> ResultCode {
        match v {
            0 => ResultCode::Ok,
            1 => ResultCode::Unknown,
            2 => ResultCode::NotFound,
            3 => ResultCode::Generation,
            5 => ResultCode::RecordExists,
            9 => ResultCode::Timeout,
            11 => ResultCode::ClusterKeyMismatch,
            18 => ResultCode::DeviceRead,
            other => ResultCode::Other(other),
        }
    }
}
