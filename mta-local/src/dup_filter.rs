//! Duplicate filter (spec §4.7 step 1): a bounded fingerprint cache so a
//! second delivery attempt to the same destination within one expansion is
//! suppressed rather than double-delivered.

use std::num::NonZeroUsize;

use lru::LruCache;

/// A delivery fingerprint: either `(uid, path)` for mailbox/maildir/pipe
/// delivery, or `(mailbox, user)` for a named-mailbox delivery reached
/// through more than one alias path.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum DeliveryKey {
    UidPath(u32, String),
    MailboxUser(String, String),
}

/// Default capacity, matching the small-bounded-cache sizing this corpus
/// uses elsewhere for per-process fingerprint caches.
pub const DEFAULT_CAPACITY: usize = 256;

pub struct DuplicateFilter {
    seen: LruCache<DeliveryKey, ()>,
}

impl DuplicateFilter {
    pub fn new(capacity: usize) -> DuplicateFilter {
        DuplicateFilter {
            seen: LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap()),
        }
    }

    /// Returns `true` the first time `key` is seen (the caller should
    /// proceed with delivery), `false` on every subsequent occurrence
    /// (the caller should report success without re-delivering, per spec).
    pub fn check_and_insert(&mut self, key: DeliveryKey) -> bool {
        if self.seen.contains(&key) {
            false
        } else {
            self.seen.put(key, ());
            true
        }
    }
}

impl Default for DuplicateFilter {
    fn default() -> DuplicateFilter {
        DuplicateFilter::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_occurrence_proceeds_second_is_suppressed() {
        let mut filter = DuplicateFilter::new(4);
        let key = DeliveryKey::UidPath(1000, "/var/mail/alice".to_owned());
        assert!(filter.check_and_insert(key.clone()));
        assert!(!filter.check_and_insert(key));
    }

    #[test]
    fn distinct_keys_are_independent() {
        let mut filter = DuplicateFilter::new(4);
        assert!(filter.check_and_insert(DeliveryKey::UidPath(1, "/a".to_owned())));
        assert!(filter.check_and_insert(DeliveryKey::UidPath(2, "/a".to_owned())));
    }

    #[test]
    fn capacity_evicts_oldest_entry() {
        let mut filter = DuplicateFilter::new(1);
        let a = DeliveryKey::UidPath(1, "/a".to_owned());
        let b = DeliveryKey::UidPath(2, "/b".to_owned());
        assert!(filter.check_and_insert(a.clone()));
        assert!(filter.check_and_insert(b));
        // `a` was evicted to make room for `b`, so it reads as unseen again.
        assert!(filter.check_and_insert(a));
    }
}
