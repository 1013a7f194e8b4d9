// System-wide invalidation events. Dispatch is synchronous under the
// subscriber list lock: by the time `emit` returns, every subscriber has
// dropped the state it held for the key, and the next request repopulates
// lazily.

use std::sync::Mutex;

use tracing::debug;

#[derive(Clone, Debug)]
pub struct RepoUpdate {
    pub account: String,
    pub repo: String,
    pub branch: String,
    pub key: String,
}

impl RepoUpdate {
    pub fn new(account: &str, repo: &str, branch: &str) -> Self {
        Self {
            account: account.to_owned(),
            repo: repo.to_owned(),
            branch: branch.to_owned(),
            key: format!("{account}/{repo}/{branch}"),
        }
    }
}

#[derive(Clone, Debug)]
pub enum Event {
    /// A branch advanced; every per-branch cache entry for `key` is stale.
    ContentRepoUpdate(RepoUpdate),
    /// An external build finished for the branch.
    ContentBuild(RepoUpdate),
}

type Subscriber = Box<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
pub struct UpdateBus {
    subscribers: Mutex<Vec<(String, Subscriber)>>,
}

impl UpdateBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, name: &str, f: impl Fn(&Event) + Send + Sync + 'static) {
        self.subscribers
            .lock()
            .unwrap()
            .push((name.to_owned(), Box::new(f)));
    }

    pub fn emit(&self, event: Event) {
        let subscribers = self.subscribers.lock().unwrap();
        debug!(?event, listeners = subscribers.len(), "dispatching event");
        for (_, f) in subscribers.iter() {
            f(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn emit_reaches_every_subscriber_before_returning() {
        let bus = UpdateBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for name in ["file-info", "manifests", "auth"] {
            let hits = Arc::clone(&hits);
            bus.subscribe(name, move |event| {
                if let Event::ContentRepoUpdate(update) = event {
                    assert_eq!(update.key, "a/r/master");
                    hits.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        bus.emit(Event::ContentRepoUpdate(RepoUpdate::new("a", "r", "master")));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
