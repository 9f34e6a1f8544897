#![deny(
    unsafe_code,
    missing_docs,
    dead_code,
    unused_results,
    non_snake_case,
    unreachable_pub
)]

//! Pure system that decides which instance leases have run out.

use std::time::Duration;

use atlas_core::{InstanceView, MapId};

/// Lease limit that ended an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExpiryReason {
    /// The instance outlived its hard lifetime.
    KeepLimit,
    /// The instance stayed empty for longer than permitted.
    IdleLimit,
}

/// Instance that should be destroyed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Expiry {
    /// Map slot of the expired instance.
    pub map: MapId,
    /// Limit that was reached.
    pub reason: ExpiryReason,
}

/// Stateless lease checker.
#[derive(Debug, Default)]
pub struct InstanceExpiry;

impl InstanceExpiry {
    /// Creates the system.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Collects every instance whose lease has run out at `now`.
    ///
    /// The output buffer is cleared first. The hard lifetime is checked before
    /// the idle limit, so an instance past both reports [`ExpiryReason::KeepLimit`].
    /// The idle limit only applies while nobody is inside.
    pub fn handle(&self, now: Duration, views: &[InstanceView], out: &mut Vec<Expiry>) {
        out.clear();
        for view in views {
            if let Some(reason) = expiry_reason(now, view) {
                out.push(Expiry {
                    map: view.map,
                    reason,
                });
            }
        }
    }
}

fn expiry_reason(now: Duration, view: &InstanceView) -> Option<ExpiryReason> {
    let reached = |since: Duration, limit: Duration| {
        since
            .checked_add(limit)
            .is_some_and(|deadline| now >= deadline)
    };

    if view
        .keep_limit
        .is_some_and(|limit| reached(view.created_at, limit))
    {
        return Some(ExpiryReason::KeepLimit);
    }
    if view.users > 0 {
        return None;
    }
    match (view.idle_since, view.idle_limit) {
        (Some(since), Some(limit)) if reached(since, limit) => Some(ExpiryReason::IdleLimit),
        _ => None,
    }
}
