// Which `(branch key, ACM group)` pairs have synced into the query API's
// file DBs since the last update event. Cleared wholesale per key when the
// branch advances; the group drift check on updates drives client resets.

use std::collections::HashSet;

#[derive(Default)]
pub struct SyncSet {
    inner: scc::HashMap<String, HashSet<String>>,
}

impl SyncSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, key: &str, group: &str) {
        match self.inner.entry(key.to_owned()) {
            scc::hash_map::Entry::Occupied(mut entry) => {
                entry.get_mut().insert(group.to_owned());
            }
            scc::hash_map::Entry::Vacant(entry) => {
                entry.insert_entry(HashSet::from([group.to_owned()]));
            }
        }
    }

    pub fn is_synced(&self, key: &str, group: &str) -> bool {
        self.inner
            .read(key, |_, groups| groups.contains(group))
            .unwrap_or(false)
    }

    pub fn clear(&self, key: &str) {
        self.inner.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marks_are_per_key_and_cleared_together() {
        let set = SyncSet::new();
        set.mark("a/r/master", "g1");
        set.mark("a/r/master", "g2");
        set.mark("a/r/dev", "g1");

        assert!(set.is_synced("a/r/master", "g1"));
        assert!(set.is_synced("a/r/master", "g2"));
        assert!(!set.is_synced("a/r/master", "g3"));

        set.clear("a/r/master");
        assert!(!set.is_synced("a/r/master", "g1"));
        assert!(set.is_synced("a/r/dev", "g1"));
    }
}
