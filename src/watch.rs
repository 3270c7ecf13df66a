//! Asynchronous notification of state changes on a pending key, to
//! arbitrarily many waiters, without a polling hot-spot. One OS-level watch
//! (via the `notify` crate: inotify on Linux, kqueue/FSEvents elsewhere) is
//! shared by every waiter on the same key; a 600-second condvar timeout is
//! folded into the same wait as a safety net for filesystems whose change
//! events are unreliable.
//!
//! A pending directory can take an arbitrary amount of wall-clock time to
//! fill in, so waiters need to block on a real notification instead of
//! spin-polling the store lock.

use crate::prelude::*;
use crate::store::{self, Inner, Item, State};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Duration;

/// The terminal status of a pending key, delivered to a [`Subscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Completed(Item),
    Failed,
}

/// A one-shot handle that resolves when the key it was issued for leaves
/// the `Pending` state.
pub struct Subscription {
    rx: Receiver<Resolution>,
}

impl Subscription {
    /// Block the calling thread until the key resolves. If the sending side
    /// is torn down without a resolution ever being sent (the store handle
    /// was dropped before the key left `Pending`), this is treated the same
    /// as `Failed`.
    pub fn wait(self) -> Resolution {
        self.rx.recv().unwrap_or(Resolution::Failed)
    }

    /// Non-blocking poll. Returns `None` if the key is still pending.
    pub fn try_recv(&self) -> Option<Resolution> {
        self.rx.try_recv().ok()
    }
}

struct WatchEntry {
    waiters: Arc<Mutex<Vec<Sender<Resolution>>>>,
    dirty: Arc<(Mutex<bool>, Condvar)>,
    // Kept alive so the OS-level watch stays registered for as long as this
    // entry exists; never read directly otherwise.
    _watcher: RecommendedWatcher,
}

/// Owns the map from pending key to shared watch state. Lives inside
/// `store::Inner`.
pub(crate) struct Notifier {
    watches: Mutex<HashMap<ContentHash, WatchEntry>>,
    poll_interval: Duration,
}

impl Notifier {
    pub(crate) fn new(poll_interval: Duration) -> Notifier {
        Notifier {
            watches: Mutex::new(HashMap::new()),
            poll_interval,
        }
    }

    /// Subscribe to `h`, which the caller has already determined is
    /// `Pending` with build directory `dir`, under the store lock. Multiple
    /// calls for the same key share one OS watch and one background thread;
    /// each gets its own one-shot channel.
    pub(crate) fn subscribe(
        &self,
        inner: &Arc<Inner>,
        h: ContentHash,
        dir: PathBuf,
    ) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel();
        let mut watches = self.watches.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = watches.get(&h) {
            entry
                .waiters
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(tx);
            return Ok(Subscription { rx });
        }

        let dirty = Arc::new((Mutex::new(false), Condvar::new()));
        let dirty_for_callback = Arc::clone(&dirty);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                let (lock, cvar) = &*dirty_for_callback;
                *lock.lock().unwrap_or_else(|e| e.into_inner()) = true;
                cvar.notify_one();
            }
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let waiters = Arc::new(Mutex::new(vec![tx]));
        watches.insert(
            h.clone(),
            WatchEntry {
                waiters: Arc::clone(&waiters),
                dirty: Arc::clone(&dirty),
                _watcher: watcher,
            },
        );
        drop(watches);

        spawn_watch_thread(Arc::downgrade(inner), h, waiters, dirty, self.poll_interval);

        Ok(Subscription { rx })
    }

    fn remove(&self, h: &ContentHash) {
        self.watches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(h);
    }
}

fn resolve_all(waiters: &Mutex<Vec<Sender<Resolution>>>, resolution: Resolution) {
    let senders = std::mem::take(&mut *waiters.lock().unwrap_or_else(|e| e.into_inner()));
    for tx in senders {
        // A waiter that dropped its receiver (cancelled) just gets a send
        // error here, which we tolerate silently -- it may race with
        // tear-down.
        let _ = tx.send(resolution.clone());
    }
}

fn spawn_watch_thread(
    inner: Weak<Inner>,
    h: ContentHash,
    waiters: Arc<Mutex<Vec<Sender<Resolution>>>>,
    dirty: Arc<(Mutex<bool>, Condvar)>,
    poll_interval: Duration,
) {
    thread::spawn(move || {
        loop {
            {
                let (lock, cvar) = &*dirty;
                let mut is_dirty = lock.lock().unwrap_or_else(|e| e.into_inner());
                while !*is_dirty {
                    let (guard, timeout) = cvar
                        .wait_timeout(is_dirty, poll_interval)
                        .unwrap_or_else(|e| e.into_inner());
                    is_dirty = guard;
                    if timeout.timed_out() {
                        break;
                    }
                }
                *is_dirty = false;
            }

            let Some(outcome) = store::lookup_via_weak(&inner, &h) else {
                // The store handle was dropped. Waiters that are still
                // waiting get nothing further from us; their `recv()` will
                // see a disconnected channel once `waiters` is dropped,
                // which callers treat the same as `Failed`.
                trace!("store dropped while waiting on {h}, tearing down watch");
                return;
            };

            match outcome {
                Ok(State::Pending) => {
                    trace!("requery for {h} still pending, continuing to wait");
                    continue;
                }
                Ok(State::Complete(item)) => {
                    debug!("watch for {h} resolved: Completed({})", item.hash);
                    resolve_all(&waiters, Resolution::Completed(item));
                }
                Ok(State::Missing) | Err(_) => {
                    debug!("watch for {h} resolved: Failed");
                    resolve_all(&waiters, Resolution::Failed);
                }
            }
            break;
        }

        if let Some(inner) = inner.upgrade() {
            inner.notifier.remove(&h);
        }
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::{ContentStore, DirHasher};
    use std::fs;

    fn identity_hasher() -> impl DirHasher {
        |dir: &Path| -> Result<ContentHash> {
            let mut names: Vec<_> = fs::read_dir(dir)?
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            Ok(ContentHash::from_bytes(names.join(",").into_bytes()))
        }
    }

    #[test]
    fn subscription_resolves_completed_on_mark_complete() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ContentStore::open_with_poll_interval(
            tmp.path(),
            identity_hasher(),
            Duration::from_millis(50),
        )
        .unwrap();
        let h1 = ContentHash::from_bytes(vec![7]);
        let build = store.mark_pending(&h1).unwrap();
        fs::write(build.join("x"), b"a").unwrap();

        let sub = match store.construct_or_wait(&h1).unwrap() {
            crate::store::ConstructOrWait::Pending(sub) => sub,
            _ => panic!("expected Pending"),
        };

        let store2 = store.clone();
        let h1b = h1.clone();
        let completer = thread::spawn(move || store2.mark_complete(&h1b).unwrap());

        match sub.wait() {
            Resolution::Completed(item) => {
                let completed = completer.join().unwrap();
                assert_eq!(item, completed);
            }
            Resolution::Failed => panic!("expected Completed"),
        }
    }

    #[test]
    fn two_waiters_on_same_key_both_resolve() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ContentStore::open_with_poll_interval(
            tmp.path(),
            identity_hasher(),
            Duration::from_millis(50),
        )
        .unwrap();
        let h1 = ContentHash::from_bytes(vec![8]);
        store.mark_pending(&h1).unwrap();

        let sub1 = match store.construct_or_wait(&h1).unwrap() {
            crate::store::ConstructOrWait::Pending(sub) => sub,
            _ => panic!("expected Pending"),
        };
        let sub2 = match store.construct_or_wait(&h1).unwrap() {
            crate::store::ConstructOrWait::Pending(sub) => sub,
            _ => panic!("expected Pending"),
        };

        let store2 = store.clone();
        let h1b = h1.clone();
        thread::spawn(move || store2.remove_failed(&h1b).unwrap());

        assert_eq!(sub1.wait(), Resolution::Failed);
        assert_eq!(sub2.wait(), Resolution::Failed);
    }
}
