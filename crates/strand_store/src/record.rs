//! Record representation, bin pickling, and remote-record descriptors.
//!
//! A pickle is the opaque serialized form of a record's bins shipped in
//! `DUP_ACK` messages: `n_bins: u16 BE`, then per bin `name_len: u8`, name
//! bytes, `value_len: u32 BE`, value bytes. A pickle with zero bins is
//! *binless* and only legal for tombstones.

use bytes::Bytes;
use smallvec::SmallVec;

use crate::arbiter::RecordMeta;
use crate::types::Digest;

/// Info bitfield flag marking a tombstone record.
pub const INFO_TOMBSTONE: u32 = 0x1;

/// Minimum legal pickle length (the bin-count header).
pub const PICKLE_MIN_LEN: usize = 2;

/// Inline bin capacity. Records with more bins spill to the heap rather
/// than trusting a peer-supplied count for a stack allocation.
const INLINE_BINS: usize = 8;

/// One named field of a record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bin {
    pub name: String,
    pub value: Vec<u8>,
}

pub type Bins = SmallVec<[Bin; INLINE_BINS]>;

/// A record as held in a partition tree.
#[derive(Clone, Debug, Default)]
pub struct StoredRecord {
    pub meta: RecordMeta,
    /// Absolute expiry time; 0 means no expiry.
    pub void_time: u32,
    pub set_name: Option<String>,
    pub key: Option<Vec<u8>>,
    pub tombstone: bool,
    pub bins: Bins,
}

/// Serialize bins into a fresh heap buffer, suitable for handing off to an
/// outbound message.
pub fn pickle(bins: &Bins) -> Vec<u8> {
    let mut size = PICKLE_MIN_LEN;
    for bin in bins {
        size += 1 + bin.name.len() + 4 + bin.value.len();
    }

    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(&(bins.len() as u16).to_be_bytes());
    for bin in bins {
        out.push(bin.name.len() as u8);
        out.extend_from_slice(bin.name.as_bytes());
        out.extend_from_slice(&(bin.value.len() as u32).to_be_bytes());
        out.extend_from_slice(&bin.value);
    }
    out
}

/// Parse a pickle back into bins.
pub fn unpickle(buf: &[u8]) -> anyhow::Result<Bins> {
    anyhow::ensure!(buf.len() >= PICKLE_MIN_LEN, "short pickle");
    let n_bins = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let mut offset = PICKLE_MIN_LEN;

    let mut bins = Bins::new();
    for _ in 0..n_bins {
        anyhow::ensure!(offset + 1 <= buf.len(), "short bin name length");
        let name_len = buf[offset] as usize;
        offset += 1;
        anyhow::ensure!(offset + name_len <= buf.len(), "short bin name");
        let name = std::str::from_utf8(&buf[offset..offset + name_len])
            .map_err(|_| anyhow::anyhow!("bin name is not utf-8"))?
            .to_string();
        offset += name_len;

        anyhow::ensure!(offset + 4 <= buf.len(), "short bin value length");
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&buf[offset..offset + 4]);
        let value_len = u32::from_be_bytes(len_bytes) as usize;
        offset += 4;
        anyhow::ensure!(offset + value_len <= buf.len(), "short bin value");
        let value = buf[offset..offset + value_len].to_vec();
        offset += value_len;

        bins.push(Bin { name, value });
    }
    anyhow::ensure!(offset == buf.len(), "trailing bytes after last bin");

    Ok(bins)
}

/// Whether a pickle carries no bins.
pub fn pickle_is_binless(buf: &[u8]) -> bool {
    buf.len() >= PICKLE_MIN_LEN && u16::from_be_bytes([buf[0], buf[1]]) == 0
}

/// Build the info bitfield advertised with a record.
pub fn pack_info(record: &StoredRecord) -> u32 {
    if record.tombstone {
        INFO_TOMBSTONE
    } else {
        0
    }
}

/// Whether a received pickle must be discarded: binless pickles are only
/// legal when flagged as tombstones.
pub fn ignore_pickle(buf: &[u8], info: u32) -> bool {
    pickle_is_binless(buf) && (info & INFO_TOMBSTONE) == 0
}

/// A winning remote version assembled from an ack, ready for the
/// replace-if-better installer. Field views are owned (`Bytes`), so the
/// descriptor stays valid independent of the originating message.
#[derive(Clone, Debug)]
pub struct RemoteRecord {
    pub digest: Digest,
    pub meta: RecordMeta,
    pub pickle: Bytes,
    pub void_time: u32,
    pub set_name: Option<Bytes>,
    pub key: Option<Bytes>,
    pub tombstone: bool,
}
