//! Time handling: the clock abstraction, ticket freshness, and the
//! authenticator replay cache.
//!
//! Role handlers never read the system clock directly. They take a [`Clock`]
//! so that expiry can be exercised in tests by moving a [`ManualClock`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, SecondsFormat, Utc};

/// Wire format for every timestamp field: RFC 3339, UTC, millisecond precision.
pub fn format(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse(text: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(text).map(|t| t.with_timezone(&Utc))
}

/// Source of the current time.
///
/// Implementations must be monotonic within one process run.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Arc::new(Mutex::new(start)) }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = to;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// A ticket is accepted iff `now <= lifetime_end`.
pub fn is_fresh(lifetime_end: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now <= lifetime_end
}

/// `now + window`, saturating at the latest representable time.
pub fn after(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    now.checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Lifetime actually granted: the requested end, capped at `now + window`.
///
/// A missing or already elapsed request gets the full window.
pub fn clamp(requested: Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let ceiling = after(now, window);
    match requested {
        Some(end) if end > now => end.min(ceiling),
        _ => ceiling,
    }
}

/// Whether an authenticator timestamp lies within `skew` of `now`.
pub fn within_skew(issued_at: DateTime<Utc>, now: DateTime<Utc>, skew: Duration) -> bool {
    (now - issued_at).abs() <= skew
}

struct SeenEntry {
    expires: DateTime<Utc>,
}

/// Remembers authenticators seen while their ticket is still valid.
///
/// Keyed by `(subjectId, issuedAt)`. Entries are dropped once the ticket
/// they rode on has expired, since such a ticket is rejected anyway.
#[derive(Clone, Default)]
pub struct ReplayCache {
    seen: Arc<Mutex<HashMap<(String, String), SeenEntry>>>,
}

impl ReplayCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an authenticator; returns false if it was already recorded.
    pub fn check_and_insert(
        &self,
        subject: &str,
        issued_at: &str,
        expires: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        let mut seen = match self.seen.lock() {
            Ok(seen) => seen,
            Err(poisoned) => poisoned.into_inner(),
        };
        seen.retain(|_, entry| entry.expires >= now);

        let key = (subject.to_string(), issued_at.to_string());
        if seen.contains_key(&key) {
            return false;
        }
        seen.insert(key, SeenEntry { expires });
        true
    }

    pub fn len(&self) -> usize {
        match self.seen.lock() {
            Ok(seen) => seen.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
    }

    #[test]
    fn format_round_trips_to_the_millisecond() {
        let t = base() + Duration::milliseconds(1234);
        assert_eq!(format(t), "2026-10-19T12:00:01.234Z");
        assert_eq!(parse(&format(t)).unwrap(), t);
    }

    #[test]
    fn manual_clock_moves_only_when_advanced() {
        let clock = ManualClock::new(base());
        assert_eq!(clock.now(), base());
        clock.advance(Duration::minutes(6));
        assert_eq!(clock.now(), base() + Duration::minutes(6));
    }

    #[test]
    fn clamp_caps_at_window() {
        let now = base();
        let window = Duration::minutes(5);
        assert_eq!(clamp(Some(now + Duration::minutes(2)), now, window), now + Duration::minutes(2));
        assert_eq!(clamp(Some(now + Duration::hours(8)), now, window), now + window);
        assert_eq!(clamp(Some(now - Duration::minutes(1)), now, window), now + window);
        assert_eq!(clamp(None, now, window), now + window);
    }

    #[test]
    fn oversized_window_saturates_instead_of_overflowing() {
        let huge = Duration::seconds(1_000_000_000_000_000);
        assert_eq!(after(base(), huge), DateTime::<Utc>::MAX_UTC);
        assert_eq!(clamp(None, base(), huge), DateTime::<Utc>::MAX_UTC);
        let requested = base() + Duration::minutes(3);
        assert_eq!(clamp(Some(requested), base(), huge), requested);
    }

    #[test]
    fn replay_cache_len_survives_a_poisoned_lock() {
        let cache = ReplayCache::new();
        assert!(cache.check_and_insert("C1", "t0", base() + Duration::minutes(5), base()));
        let poisoner = cache.clone();
        let _ = std::thread::spawn(move || {
            let _held = poisoner.seen.lock().unwrap();
            panic!("poison the replay cache");
        })
        .join();
        assert!(cache.seen.is_poisoned());
        assert_eq!(cache.len(), 1);
        assert!(!cache.check_and_insert("C1", "t0", base() + Duration::minutes(5), base()));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn skew_window_is_symmetric() {
        let skew = Duration::minutes(5);
        assert!(within_skew(base(), base() + Duration::minutes(5), skew));
        assert!(within_skew(base() + Duration::minutes(4), base(), skew));
        assert!(!within_skew(base(), base() + Duration::minutes(6), skew));
    }

    #[test]
    fn replay_cache_rejects_second_presentation() {
        let cache = ReplayCache::new();
        let expires = base() + Duration::minutes(5);
        assert!(cache.check_and_insert("C1", "t0", expires, base()));
        assert!(!cache.check_and_insert("C1", "t0", expires, base()));
        assert!(cache.check_and_insert("C1", "t1", expires, base()));
        assert!(cache.check_and_insert("C2", "t0", expires, base()));
    }

    #[test]
    fn replay_cache_forgets_expired_entries() {
        let cache = ReplayCache::new();
        let expires = base() + Duration::minutes(5);
        assert!(cache.check_and_insert("C1", "t0", expires, base()));
        assert_eq!(cache.len(), 1);
        assert!(cache.check_and_insert("C9", "t9", expires + Duration::minutes(5), expires + Duration::seconds(1)));
        assert_eq!(cache.len(), 1);
    }

    proptest! {
        #[test]
        fn fresh_iff_now_not_after_end(end_offset in -100_000i64..100_000, now_offset in -100_000i64..100_000) {
            let end = base() + Duration::seconds(end_offset);
            let now = base() + Duration::seconds(now_offset);
            prop_assert_eq!(is_fresh(end, now), now_offset <= end_offset);
        }
    }
}
