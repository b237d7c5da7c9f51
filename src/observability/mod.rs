//! Process-wide counters for the role servers and the client.
//!
//! Counters carry no identities, addresses, or key material; a build-time
//! guard rejects such tokens in this module.

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservabilityLevel {
    OBS_NONE,
    OBS_SAFE,
    OBS_DEV,
}

#[cfg(feature = "obs_none")]
pub const OBS_LEVEL: ObservabilityLevel = ObservabilityLevel::OBS_NONE;

#[cfg(all(feature = "obs_dev", not(feature = "obs_none")))]
pub const OBS_LEVEL: ObservabilityLevel = ObservabilityLevel::OBS_DEV;

#[cfg(all(not(feature = "obs_none"), not(feature = "obs_dev")))]
pub const OBS_LEVEL: ObservabilityLevel = ObservabilityLevel::OBS_SAFE;

pub const OBS_NONE: bool = matches!(OBS_LEVEL, ObservabilityLevel::OBS_NONE);
pub const OBS_DEV: bool = matches!(OBS_LEVEL, ObservabilityLevel::OBS_DEV);

use std::sync::atomic::{AtomicU64, Ordering};

/// Why a request ended without an issued envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Answered with a negative acknowledgement.
    Rejected,
    /// Connection closed without a reply.
    Aborted,
}

static CONNECTIONS_ACCEPTED: AtomicU64 = AtomicU64::new(0);
static CONNECTIONS_CLOSED: AtomicU64 = AtomicU64::new(0);
static ENVELOPES_ISSUED: AtomicU64 = AtomicU64::new(0);
static REQUESTS_REJECTED: AtomicU64 = AtomicU64::new(0);
static REQUESTS_ABORTED: AtomicU64 = AtomicU64::new(0);
static BOOTSTRAP_EXCHANGES: AtomicU64 = AtomicU64::new(0);
static FRAMES_SENT: AtomicU64 = AtomicU64::new(0);
static FRAMES_RECEIVED: AtomicU64 = AtomicU64::new(0);

// Dev builds only.
static REJECTED_EXPIRED: AtomicU64 = AtomicU64::new(0);
static REJECTED_MISMATCH: AtomicU64 = AtomicU64::new(0);
static REJECTED_REPLAY: AtomicU64 = AtomicU64::new(0);
static REJECTED_UNREADABLE: AtomicU64 = AtomicU64::new(0);
static REJECTED_OTHER: AtomicU64 = AtomicU64::new(0);

#[inline]
fn bump(counter: &AtomicU64) {
    if !OBS_NONE {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[inline]
pub fn record_connection_accepted() {
    bump(&CONNECTIONS_ACCEPTED);
}

#[inline]
pub fn record_connection_closed() {
    bump(&CONNECTIONS_CLOSED);
}

#[inline]
pub fn record_envelope_issued() {
    bump(&ENVELOPES_ISSUED);
}

#[inline]
pub fn record_failure(outcome: Outcome) {
    match outcome {
        Outcome::Rejected => bump(&REQUESTS_REJECTED),
        Outcome::Aborted => bump(&REQUESTS_ABORTED),
    }
}

/// Per-class breakdown of rejections, kept only under `obs_dev`.
///
/// `class` is the stable reason string sent back to the peer.
#[inline]
pub fn record_rejection_class(class: &str) {
    if !OBS_DEV {
        return;
    }
    let counter = match class {
        "expired_ticket" => &REJECTED_EXPIRED,
        "identity_mismatch" => &REJECTED_MISMATCH,
        "replay" => &REJECTED_REPLAY,
        "decryption_failure" => &REJECTED_UNREADABLE,
        _ => &REJECTED_OTHER,
    };
    counter.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_bootstrap_exchange() {
    bump(&BOOTSTRAP_EXCHANGES);
}

#[inline]
pub fn record_frame_sent() {
    bump(&FRAMES_SENT);
}

#[inline]
pub fn record_frame_received() {
    bump(&FRAMES_RECEIVED);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObservabilitySnapshot {
    pub connections_accepted: u64,
    pub connections_closed: u64,
    pub envelopes_issued: u64,
    pub requests_rejected: u64,
    pub requests_aborted: u64,
    pub bootstrap_exchanges: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    /// Zero unless built with `obs_dev`.
    pub rejections: RejectionBreakdown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RejectionBreakdown {
    pub expired: u64,
    pub mismatch: u64,
    pub replay: u64,
    pub unreadable: u64,
    pub other: u64,
}

pub fn snapshot() -> ObservabilitySnapshot {
    ObservabilitySnapshot {
        connections_accepted: CONNECTIONS_ACCEPTED.load(Ordering::Relaxed),
        connections_closed: CONNECTIONS_CLOSED.load(Ordering::Relaxed),
        envelopes_issued: ENVELOPES_ISSUED.load(Ordering::Relaxed),
        requests_rejected: REQUESTS_REJECTED.load(Ordering::Relaxed),
        requests_aborted: REQUESTS_ABORTED.load(Ordering::Relaxed),
        bootstrap_exchanges: BOOTSTRAP_EXCHANGES.load(Ordering::Relaxed),
        frames_sent: FRAMES_SENT.load(Ordering::Relaxed),
        frames_received: FRAMES_RECEIVED.load(Ordering::Relaxed),
        rejections: RejectionBreakdown {
            expired: REJECTED_EXPIRED.load(Ordering::Relaxed),
            mismatch: REJECTED_MISMATCH.load(Ordering::Relaxed),
            replay: REJECTED_REPLAY.load(Ordering::Relaxed),
            unreadable: REJECTED_UNREADABLE.load(Ordering::Relaxed),
            other: REJECTED_OTHER.load(Ordering::Relaxed),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Counters are global and other tests run in parallel, so only
    // monotonic growth is checked.
    #[test]
    fn counters_only_grow() {
        let before = snapshot();
        record_connection_accepted();
        record_failure(Outcome::Rejected);
        record_failure(Outcome::Aborted);
        let after = snapshot();
        if OBS_NONE {
            assert_eq!(after.connections_accepted, before.connections_accepted);
        } else {
            assert!(after.connections_accepted > before.connections_accepted);
            assert!(after.requests_rejected > before.requests_rejected);
            assert!(after.requests_aborted > before.requests_aborted);
        }
    }

    #[test]
    fn rejection_breakdown_follows_build_level() {
        let before = snapshot().rejections;
        record_rejection_class("replay");
        record_rejection_class("expired_ticket");
        record_rejection_class("missing_ticket");
        let after = snapshot().rejections;
        if OBS_DEV {
            assert!(after.replay > before.replay);
            assert!(after.expired > before.expired);
            assert!(after.other > before.other);
        } else {
            assert_eq!(after, RejectionBreakdown::default());
        }
    }
}
