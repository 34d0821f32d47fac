//! Name → owner index for resolver bindings.
//!
//! Regular names and wildcard patterns live in two separate maps, each behind
//! its own lock, so traffic on one never waits on the other. A name has at most
//! one owner; the first owner to claim a name keeps it until it removes it.

use parking_lot::Mutex;
use std::collections::HashMap;

const WILDCARD_PREFIX: &str = "*.";

/// Reports whether a name is a wildcard pattern (`*.example.com`).
pub fn is_wildcard(name: &str) -> bool {
    name.starts_with(WILDCARD_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind { Regular, Wildcard }

impl NameKind {
    pub fn of(name: &str) -> Self {
        if is_wildcard(name) { NameKind::Wildcard } else { NameKind::Regular }
    }

    pub fn as_str(&self) -> &'static str {
        match self { NameKind::Regular => "regular", NameKind::Wildcard => "wildcard" }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Applied,
    /// Another owner already holds the name; nothing changed.
    Skipped,
}

#[derive(Debug, Default)]
pub struct NameIndex {
    regular: Mutex<HashMap<String, String>>,
    wildcard: Mutex<HashMap<String, String>>,
}

impl NameIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn map_for(&self, name: &str) -> &Mutex<HashMap<String, String>> {
        match NameKind::of(name) {
            NameKind::Regular => &self.regular,
            NameKind::Wildcard => &self.wildcard,
        }
    }

    pub fn upsert(&self, name: &str, owner: &str) -> UpsertOutcome {
        let mut map = self.map_for(name).lock();
        match map.get(name) {
            Some(existing) if existing != owner => UpsertOutcome::Skipped,
            Some(_) => UpsertOutcome::Applied,
            None => {
                map.insert(name.to_string(), owner.to_string());
                UpsertOutcome::Applied
            }
        }
    }

    /// Removes `name` only while `owner` still holds it. Returns whether an entry went away.
    pub fn remove(&self, name: &str, owner: &str) -> bool {
        let mut map = self.map_for(name).lock();
        if map.get(name).map(String::as_str) == Some(owner) {
            map.remove(name);
            true
        } else {
            false
        }
    }

    /// Moves `owner` from `old_name` to `new_name`. Both steps keep their own
    /// ownership checks. Renaming to the same name touches nothing.
    pub fn reassign(&self, old_name: &str, new_name: &str, owner: &str) -> UpsertOutcome {
        if old_name == new_name {
            return UpsertOutcome::Applied;
        }
        self.remove(old_name, owner);
        self.upsert(new_name, owner)
    }

    pub fn owner_of(&self, name: &str) -> Option<String> {
        self.map_for(name).lock().get(name).cloned()
    }

    pub fn len(&self, kind: NameKind) -> usize {
        match kind {
            NameKind::Regular => self.regular.lock().len(),
            NameKind::Wildcard => self.wildcard.lock().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len(NameKind::Regular) == 0 && self.len(NameKind::Wildcard) == 0
    }

    #[cfg(test)]
    fn contains_in(&self, kind: NameKind, name: &str) -> bool {
        match kind {
            NameKind::Regular => self.regular.lock().contains_key(name),
            NameKind::Wildcard => self.wildcard.lock().contains_key(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn classifies_wildcards() {
        assert!(is_wildcard("*.example.com"));
        assert!(!is_wildcard("www.example.com"));
        assert!(!is_wildcard("a*.example.com"));
        assert!(!is_wildcard("*example.com"));
    }

    #[test]
    fn upsert_lands_in_matching_index_only() {
        let index = NameIndex::new();
        index.upsert("*.example.com", "obj1");
        index.upsert("www.example.com", "obj2");

        assert!(index.contains_in(NameKind::Wildcard, "*.example.com"));
        assert!(!index.contains_in(NameKind::Regular, "*.example.com"));
        assert!(index.contains_in(NameKind::Regular, "www.example.com"));
        assert!(!index.contains_in(NameKind::Wildcard, "www.example.com"));
        assert_eq!(index.len(NameKind::Regular), 1);
        assert_eq!(index.len(NameKind::Wildcard), 1);
    }

    #[test]
    fn first_owner_wins() {
        let index = NameIndex::new();
        assert_eq!(index.upsert("www.example.com", "a"), UpsertOutcome::Applied);
        assert_eq!(index.upsert("www.example.com", "b"), UpsertOutcome::Skipped);
        assert_eq!(index.owner_of("www.example.com").as_deref(), Some("a"));

        assert_eq!(index.upsert("www.example.com", "a"), UpsertOutcome::Applied);
        assert_eq!(index.owner_of("www.example.com").as_deref(), Some("a"));
        assert_eq!(index.len(NameKind::Regular), 1);
    }

    #[test]
    fn remove_requires_matching_owner() {
        let index = NameIndex::new();
        index.upsert("www.example.com", "a");
        index.upsert("www.example.com", "b");

        assert!(!index.remove("www.example.com", "b"));
        assert_eq!(index.owner_of("www.example.com").as_deref(), Some("a"));

        assert!(index.remove("www.example.com", "a"));
        assert!(index.owner_of("www.example.com").is_none());
        assert!(index.is_empty());
    }

    #[test]
    fn remove_of_unknown_name_is_noop() {
        let index = NameIndex::new();
        assert!(!index.remove("nothing.example.com", "a"));
    }

    #[test]
    fn reassign_same_name_does_not_take_the_lock() {
        let index = NameIndex::new();
        index.upsert("www.example.com", "a");

        let _held = index.regular.lock();
        // Would deadlock if the no-op rename reached the regular map.
        assert_eq!(index.reassign("www.example.com", "www.example.com", "a"), UpsertOutcome::Applied);
    }

    #[test]
    fn reassign_moves_between_indexes() {
        let index = NameIndex::new();
        index.upsert("www.example.com", "a");

        assert_eq!(index.reassign("www.example.com", "*.example.com", "a"), UpsertOutcome::Applied);
        assert!(index.owner_of("www.example.com").is_none());
        assert_eq!(index.owner_of("*.example.com").as_deref(), Some("a"));
    }

    #[test]
    fn reassign_onto_claimed_name_is_skipped_but_old_name_released() {
        let index = NameIndex::new();
        index.upsert("old.example.com", "a");
        index.upsert("new.example.com", "b");

        assert_eq!(index.reassign("old.example.com", "new.example.com", "a"), UpsertOutcome::Skipped);
        assert!(index.owner_of("old.example.com").is_none());
        assert_eq!(index.owner_of("new.example.com").as_deref(), Some("b"));
    }

    #[test]
    fn concurrent_upserts_on_distinct_names_are_all_kept() {
        let index = Arc::new(NameIndex::new());
        let workers = 16;
        let per_worker = 250;

        let handles: Vec<_> = (0..workers)
            .map(|w| {
                let index = index.clone();
                std::thread::spawn(move || {
                    for i in 0..per_worker {
                        index.upsert(&format!("host-{}-{}.example.com", w, i), &format!("owner-{}", w));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(index.len(NameKind::Regular), workers * per_worker);
        assert_eq!(index.len(NameKind::Wildcard), 0);
    }
}
