//! Conflict arbitration between two record versions.
//!
//! The arbiter is a pure function of the namespace policy and two
//! `(generation, last-update-time)` pairs. It performs no I/O and never
//! allocates; the responder's pre-check, the coordinator's best-candidate
//! tracking, and the replace-if-better installer all defer to it for
//! version ordering.

use std::cmp::Ordering;

/// Conflict-resolution policy configured per namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Higher generation wins; ties broken by higher last-update-time.
    Generation,
    /// Higher last-update-time wins; ties broken by higher generation.
    LastUpdateTime,
}

/// Version metadata carried by every record copy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecordMeta {
    pub generation: u16,
    pub last_update_time: u64,
}

/// Outcome of comparing two record versions under a policy.
///
/// `Equal` means the two versions are indistinguishable under the policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Winner {
    Left,
    Right,
    Equal,
}

/// Compare two versions under `policy`.
pub fn resolve(policy: ConflictPolicy, left: RecordMeta, right: RecordMeta) -> Winner {
    let ordering = match policy {
        ConflictPolicy::Generation => (left.generation, left.last_update_time)
            .cmp(&(right.generation, right.last_update_time)),
        ConflictPolicy::LastUpdateTime => (left.last_update_time, left.generation)
            .cmp(&(right.last_update_time, right.generation)),
    };

    match ordering {
        Ordering::Greater => Winner::Left,
        Ordering::Less => Winner::Right,
        Ordering::Equal => Winner::Equal,
    }
}
