use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

/// How long the seen-set remembers an identity.
///
/// The default keeps every identity for the lifetime of the process, which
/// gives the strict at-most-once guarantee but grows without bound. Setting
/// `max_identities` evicts the least recently seen identity once the set is
/// full, and `max_age` forgets an identity once it has been retained for
/// longer than the window. An identity that has been forgotten is treated as
/// new the next time it is delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_identities: Option<NonZeroUsize>,
    pub max_age: Option<Duration>,
}

impl RetentionPolicy {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_max_identities(mut self, max_identities: NonZeroUsize) -> Self {
        self.max_identities = Some(max_identities);
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_identities.is_none() && self.max_age.is_none()
    }
}

/// Identities already forwarded to the sink.
///
/// All reads and writes go through a single lock that is only held for the
/// duration of one call. With a `max_age`, entries are kept in recording
/// order and expired ones are dropped from the old end on every access, so
/// the set never holds more than one window of identities.
pub struct SeenSet {
    entries: Mutex<LruCache<String, Instant>>,
    max_age: Option<Duration>,
}

impl SeenSet {
    pub fn new(policy: RetentionPolicy) -> Self {
        let entries = match policy.max_identities {
            Some(capacity) => LruCache::new(capacity),
            None => LruCache::unbounded(),
        };

        Self {
            entries: Mutex::new(entries),
            max_age: policy.max_age,
        }
    }

    /// Records `identity` and returns true if it was not already present.
    ///
    /// The lookup and the insert happen under the same lock acquisition, so of
    /// any number of concurrent callers with the same identity exactly one
    /// gets `true`.
    pub fn check_and_insert(&self, identity: &str) -> bool {
        let mut entries = self.entries.lock();
        let now = Instant::now();

        match self.max_age {
            Some(max_age) => {
                evict_expired(&mut entries, now, max_age);
                // peek so a duplicate does not refresh its position
                if entries.peek(identity).is_some() {
                    return false;
                }
            }
            None => {
                if entries.get(identity).is_some() {
                    return false;
                }
            }
        }

        entries.put(identity.to_owned(), now);
        true
    }

    pub fn contains(&self, identity: &str) -> bool {
        let entries = self.entries.lock();
        let now = Instant::now();

        entries.peek(identity).is_some_and(|recorded_at| {
            self.max_age
                .map_or(true, |max_age| now.duration_since(*recorded_at) < max_age)
        })
    }

    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock();
        if let Some(max_age) = self.max_age {
            evict_expired(&mut entries, Instant::now(), max_age);
        }
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Entries are in recording order, so the first live entry ends the scan.
fn evict_expired(entries: &mut LruCache<String, Instant>, now: Instant, max_age: Duration) {
    loop {
        let expired = entries
            .peek_lru()
            .is_some_and(|(_, recorded_at)| now.duration_since(*recorded_at) >= max_age);
        if !expired {
            break;
        }
        entries.pop_lru();
    }
}

impl Default for SeenSet {
    fn default() -> Self {
        Self::new(RetentionPolicy::unbounded())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_first_insert_wins() {
        let seen = SeenSet::default();

        assert!(seen.check_and_insert("42"));
        assert!(!seen.check_and_insert("42"));
        assert!(!seen.check_and_insert("42"));
        assert!(seen.check_and_insert("43"));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_unbounded_policy_never_forgets() {
        let seen = SeenSet::new(RetentionPolicy::unbounded());

        for i in 0..10_000 {
            assert!(seen.check_and_insert(&i.to_string()));
        }

        assert_eq!(seen.len(), 10_000);
        assert!(!seen.check_and_insert("0"));
    }

    #[test]
    fn test_max_identities_evicts_least_recently_seen() {
        let policy =
            RetentionPolicy::unbounded().with_max_identities(NonZeroUsize::new(2).unwrap());
        let seen = SeenSet::new(policy);

        assert!(seen.check_and_insert("a"));
        assert!(seen.check_and_insert("b"));
        // touching "a" makes "b" the eviction candidate
        assert!(!seen.check_and_insert("a"));
        assert!(seen.check_and_insert("c"));

        assert_eq!(seen.len(), 2);
        assert!(seen.contains("a"));
        assert!(!seen.contains("b"));
        assert!(seen.check_and_insert("b"));
    }

    #[test]
    fn test_expired_identity_is_accepted_again() {
        let seen = SeenSet::new(RetentionPolicy::unbounded().with_max_age(Duration::ZERO));

        assert!(seen.check_and_insert("42"));
        assert!(seen.check_and_insert("42"));
    }

    #[test]
    fn test_expired_identities_are_dropped() {
        let seen =
            SeenSet::new(RetentionPolicy::unbounded().with_max_age(Duration::from_millis(10)));

        for i in 0..10_000 {
            assert!(seen.check_and_insert(&i.to_string()));
        }

        std::thread::sleep(Duration::from_millis(50));

        assert!(!seen.contains("0"));
        assert!(seen.check_and_insert("fresh"));
        assert_eq!(seen.len(), 1);
        assert!(seen.contains("fresh"));
    }

    #[test]
    fn test_duplicate_does_not_extend_window() {
        let seen =
            SeenSet::new(RetentionPolicy::unbounded().with_max_age(Duration::from_millis(200)));

        assert!(seen.check_and_insert("a"));
        std::thread::sleep(Duration::from_millis(120));
        assert!(!seen.check_and_insert("a"));
        assert!(seen.check_and_insert("b"));
        std::thread::sleep(Duration::from_millis(120));

        // "a" is past its window even though it was seen again, "b" is not
        assert!(!seen.contains("a"));
        assert!(seen.contains("b"));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_identity_within_window_is_rejected() {
        let seen =
            SeenSet::new(RetentionPolicy::unbounded().with_max_age(Duration::from_secs(3600)));

        assert!(seen.check_and_insert("42"));
        assert!(!seen.check_and_insert("42"));
    }

    #[test]
    fn test_concurrent_inserts_have_one_winner() {
        let seen = Arc::new(SeenSet::default());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let seen = seen.clone();
                std::thread::spawn(move || seen.check_and_insert("racing"))
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
    }

    #[test]
    fn test_policy_builders() {
        assert!(RetentionPolicy::unbounded().is_unbounded());
        assert!(!RetentionPolicy::unbounded()
            .with_max_age(Duration::from_secs(1))
            .is_unbounded());
    }
}
