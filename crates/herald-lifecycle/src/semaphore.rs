//! Derived display state.
//!
//! The semaphore is recomputed from the notice's timestamps and the current
//! time on every read. It is never stored, so it can never drift from the
//! facts it summarizes.

use serde::{Deserialize, Serialize};
use std::fmt;

use herald_core::{
    LifecycleState, Notice, PhysicalTrack, Timestamp, SECONDS_PER_DAY, SECONDS_PER_HOUR,
};
use herald_delivery::SUBSIDIARITY_GRACE_SECS;

/// Silence after dispatch or identity validation that turns the light red.
pub const ALERT_AFTER_SECS: u64 = 72 * SECONDS_PER_HOUR;

/// Remaining time before expiration that renders as expiring soon.
pub const EXPIRING_SOON_SECS: u64 = 5 * SECONDS_PER_DAY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Semaphore {
    Pending,
    Dispatched,
    Alert,
    Validated,
    Read,
    ExpiringSoon,
    Firm,
    PhysicalRequired,
    PhysicalDispatched,
}

impl Semaphore {
    pub fn as_str(&self) -> &'static str {
        match self {
            Semaphore::Pending => "pending",
            Semaphore::Dispatched => "dispatched",
            Semaphore::Alert => "alert",
            Semaphore::Validated => "validated",
            Semaphore::Read => "read",
            Semaphore::ExpiringSoon => "expiring-soon",
            Semaphore::Firm => "firm",
            Semaphore::PhysicalRequired => "physical-required",
            Semaphore::PhysicalDispatched => "physical-dispatched",
        }
    }
}

impl fmt::Display for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pure function of the notice and `now`.
///
/// Precedence: terminal canonical state, then the physical track, then the
/// digital milestones from the most advanced backwards. Firm and impugned
/// render the same; only the canonical state tells them apart.
pub fn derive_semaphore(notice: &Notice, now: Timestamp) -> Semaphore {
    if matches!(notice.state, LifecycleState::Firm | LifecycleState::Impugned) {
        return Semaphore::Firm;
    }

    match notice.physical_track {
        PhysicalTrack::Dispatched => return Semaphore::PhysicalDispatched,
        PhysicalTrack::Required => return Semaphore::PhysicalRequired,
        PhysicalTrack::NotRequired => {}
    }

    let Some(dispatched_at) = notice.first_dispatched_at() else {
        return Semaphore::Pending;
    };

    if notice.read_confirmed_at.is_some() {
        return match notice.expires_at {
            Some(expires_at) if expires_at <= now.plus_seconds(EXPIRING_SOON_SECS) => {
                Semaphore::ExpiringSoon
            }
            _ => Semaphore::Read,
        };
    }

    if let Some(validated_at) = notice.identity_validated_at {
        return if now.seconds_since(&validated_at) < ALERT_AFTER_SECS {
            Semaphore::Validated
        } else {
            Semaphore::Alert
        };
    }

    let silent_for = now.seconds_since(&dispatched_at);
    let failed = notice.physical_fallback_required || notice.any_channel_failed();
    let unopened_past_grace = !notice.has_open() && silent_for >= SUBSIDIARITY_GRACE_SECS;
    if failed || unopened_past_grace || silent_for >= ALERT_AFTER_SECS {
        Semaphore::Alert
    } else {
        Semaphore::Dispatched
    }
}
