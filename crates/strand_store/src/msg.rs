//! Typed field codec for RW fabric messages.
//!
//! A message owns the storage behind every field: getters hand out `Bytes`
//! views (or copies of fixed-width integers) that stay valid for as long as
//! the message, or a retained view, is alive. Setters come in two flavors
//! with different ownership: `set_copy` copies the caller's slice, while
//! `set_handoff` takes over an existing heap buffer without copying.
//! A received message decodes zero-copy; each field is a slice of the
//! receive buffer.

use bytes::{BufMut, Bytes, BytesMut};

/// `OP` value for a duplicate-resolution request.
pub const OP_DUP_REQ: u32 = 1;
/// `OP` value for a duplicate-resolution ack.
pub const OP_DUP_ACK: u32 = 2;

/// Field tags of the RW message type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RwField {
    Op = 0,
    Result = 1,
    Namespace = 2,
    NsId = 3,
    Digest = 4,
    Tid = 5,
    ClusterKey = 6,
    Generation = 7,
    LastUpdateTime = 8,
    VoidTime = 9,
    Record = 10,
    SetName = 11,
    Key = 12,
    Info = 13,
}

const FIELD_COUNT: usize = 14;

impl RwField {
    fn from_tag(tag: u8) -> Option<RwField> {
        match tag {
            0 => Some(RwField::Op),
            1 => Some(RwField::Result),
            2 => Some(RwField::Namespace),
            3 => Some(RwField::NsId),
            4 => Some(RwField::Digest),
            5 => Some(RwField::Tid),
            6 => Some(RwField::ClusterKey),
            7 => Some(RwField::Generation),
            8 => Some(RwField::LastUpdateTime),
            9 => Some(RwField::VoidTime),
            10 => Some(RwField::Record),
            11 => Some(RwField::SetName),
            12 => Some(RwField::Key),
            13 => Some(RwField::Info),
            _ => None,
        }
    }
}

/// An RW message: a sparse set of tagged fields.
///
/// Cloning is cheap; field buffers are reference-counted, not copied.
#[derive(Clone, Debug, Default)]
pub struct RwMsg {
    fields: [Option<Bytes>; FIELD_COUNT],
}

impl RwMsg {
    pub fn new() -> RwMsg {
        RwMsg::default()
    }

    /// Store a u32 field (big-endian on the wire).
    pub fn set_u32(&mut self, field: RwField, value: u32) {
        self.fields[field as usize] = Some(Bytes::copy_from_slice(&value.to_be_bytes()));
    }

    /// Store a u64 field (big-endian on the wire).
    pub fn set_u64(&mut self, field: RwField, value: u64) {
        self.fields[field as usize] = Some(Bytes::copy_from_slice(&value.to_be_bytes()));
    }

    /// Store a byte field by copying the caller's slice.
    pub fn set_copy(&mut self, field: RwField, value: &[u8]) {
        self.fields[field as usize] = Some(Bytes::copy_from_slice(value));
    }

    /// Store a byte field by taking ownership of `value`. No copy is made;
    /// the buffer is freed when the message (and any retained views) drop.
    pub fn set_handoff(&mut self, field: RwField, value: Vec<u8>) {
        self.fields[field as usize] = Some(Bytes::from(value));
    }

    pub fn get_u32(&self, field: RwField) -> Option<u32> {
        let bytes = self.fields[field as usize].as_ref()?;
        let arr: [u8; 4] = bytes.as_ref().try_into().ok()?;
        Some(u32::from_be_bytes(arr))
    }

    pub fn get_u64(&self, field: RwField) -> Option<u64> {
        let bytes = self.fields[field as usize].as_ref()?;
        let arr: [u8; 8] = bytes.as_ref().try_into().ok()?;
        Some(u64::from_be_bytes(arr))
    }

    /// Borrow a byte field.
    pub fn get_buf(&self, field: RwField) -> Option<&[u8]> {
        self.fields[field as usize].as_deref()
    }

    /// Retain a byte field as an owned view. The view keeps the backing
    /// buffer alive independently of this message.
    pub fn get_bytes(&self, field: RwField) -> Option<Bytes> {
        self.fields[field as usize].clone()
    }

    pub fn get_digest(&self, field: RwField) -> Option<crate::types::Digest> {
        crate::types::Digest::from_slice(self.get_buf(field)?)
    }

    /// Drop every field not listed in `keep`. Used when a request message is
    /// reused for its ack: identity fields survive, the rest are cleared so
    /// the ack starts clean.
    pub fn preserve_fields(&mut self, keep: &[RwField]) {
        for idx in 0..FIELD_COUNT {
            if !keep.iter().any(|f| *f as usize == idx) {
                self.fields[idx] = None;
            }
        }
    }

    /// Serialize to the wire format: per present field, `tag: u8`,
    /// `len: u32 BE`, payload.
    pub fn encode(&self) -> Bytes {
        let mut size = 0usize;
        for value in self.fields.iter().flatten() {
            size += 1 + 4 + value.len();
        }

        let mut out = BytesMut::with_capacity(size);
        for (idx, value) in self.fields.iter().enumerate() {
            let Some(value) = value else {
                continue;
            };
            out.put_u8(idx as u8);
            out.put_u32(value.len() as u32);
            out.put_slice(value);
        }
        out.freeze()
    }

    /// Parse the wire format. Field payloads are zero-copy slices of `buf`.
    pub fn decode(buf: Bytes) -> anyhow::Result<RwMsg> {
        let mut msg = RwMsg::new();
        let mut offset = 0usize;

        while offset < buf.len() {
            anyhow::ensure!(offset + 1 + 4 <= buf.len(), "short field header");
            let tag = buf[offset];
            offset += 1;
            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(&buf[offset..offset + 4]);
            let len = u32::from_be_bytes(len_bytes) as usize;
            offset += 4;
            anyhow::ensure!(offset + len <= buf.len(), "short field payload");

            let field = RwField::from_tag(tag)
                .ok_or_else(|| anyhow::anyhow!("unknown field tag {tag}"))?;
            anyhow::ensure!(
                msg.fields[field as usize].is_none(),
                "duplicate field tag {tag}"
            );
            msg.fields[field as usize] = Some(buf.slice(offset..offset + len));
            offset += len;
        }

        Ok(msg)
    }
}
