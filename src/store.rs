//! The set of atomic operations that make up the store's public API, plus
//! the `Inner` type that holds everything a [`ContentStore`] handle owns.
//! Every key moves through a three-state (`Missing`/`Pending`/`Complete`)
//! lifecycle, with dedup/sealing on completion and change notification for
//! anyone waiting on a key that's still `Pending`.

use crate::encoding::{self, complete_path, item_path, pending_path, Entry};
use crate::lock::{LockGuard, StoreLock};
use crate::prelude::*;
use crate::seal;
use crate::watch::{Notifier, Resolution, Subscription};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::{Arc, Weak};
use std::time::Duration;

const WRITABLE_DIR_MODE: u32 = 0o755;

/// Injected by the caller at [`ContentStore::open`] time. The store treats
/// this as an opaque pure function: it must be deterministic over a
/// directory's filenames and contents, and it must not observe any
/// permission bits other than the ones the store itself sets (which is why
/// sealing happens before hashing -- the hasher never sees a writable
/// pending directory).
pub trait DirHasher: Send + Sync {
    fn hash_dir(&self, dir: &Path) -> Result<ContentHash>;
}

impl<F> DirHasher for F
where
    F: Fn(&Path) -> Result<ContentHash> + Send + Sync,
{
    fn hash_dir(&self, dir: &Path) -> Result<ContentHash> {
        self(dir)
    }
}

/// A completed, read-only, content-addressed directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub hash: ContentHash,
    pub path: PathBuf,
}

/// The bare state tag returned by [`ContentStore::query`], with no attached
/// paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTag {
    Missing,
    Pending,
    Complete,
}

/// The result of [`ContentStore::lookup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Missing,
    Pending,
    Complete(Item),
}

/// The result of [`ContentStore::lookup_or_wait`].
pub enum LookupOrWait {
    Missing,
    Pending(Subscription),
    Complete(Item),
}

/// The result of [`ContentStore::construct_if_missing`].
pub enum Construct {
    Complete(Item),
    Pending,
    New(PathBuf),
}

/// The result of [`ContentStore::construct_or_wait`].
pub enum ConstructOrWait {
    Complete(Item),
    Pending(Subscription),
    New(PathBuf),
}

/// The three sequences returned by [`ContentStore::list_all`]. Ordering is
/// unspecified; sort the returned vectors yourself if you need determinism
/// (`ContentHash` implements `Ord`).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Listing {
    pub pending: Vec<ContentHash>,
    pub complete: Vec<ContentHash>,
    pub items: Vec<ContentHash>,
}

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(600);

pub(crate) struct Inner {
    pub(crate) root: PathBuf,
    lock: StoreLock,
    hasher: Box<dyn DirHasher>,
    pub(crate) notifier: Notifier,
}

/// A handle on a content-addressed store rooted at some directory on a
/// shared filesystem. Cheap to clone (it's an `Arc` underneath); every clone
/// talks to the same underlying lock and notifier state, which is the point
/// -- within one process, many threads are meant to share one handle.
#[derive(Clone)]
pub struct ContentStore {
    inner: Arc<Inner>,
}

impl ContentStore {
    /// Open (creating if necessary) a store rooted at `root`, with the
    /// default 600-second notifier poll-fallback interval.
    pub fn open(root: &Path, hasher: impl DirHasher + 'static) -> Result<ContentStore> {
        Self::open_with_poll_interval(root, hasher, DEFAULT_POLL_INTERVAL)
    }

    /// Like [`ContentStore::open`], but with an explicit poll-fallback
    /// interval for the change notifier. Exposed mainly so tests don't have
    /// to wait 600 real seconds to exercise the polling path.
    pub fn open_with_poll_interval(
        root: &Path,
        hasher: impl DirHasher + 'static,
        poll_interval: Duration,
    ) -> Result<ContentStore> {
        fs::create_dir_all(root)?;
        let lock_path = root.join("lock");
        // Whether some earlier `open()` (in this process or another) already
        // got here first. If the lock file is already there, `root/` has
        // already been normalized into the at-rest mode and may currently be
        // mid-transition under another holder's lock -- resetting it here
        // with no locking at all would yank it out from under them.
        let already_initialized = lock_path.exists();

        let lock = StoreLock::open(&lock_path)?;
        let inner = Arc::new(Inner {
            root: root.to_path_buf(),
            lock,
            hasher: Box::new(hasher),
            notifier: Notifier::new(poll_interval),
        });
        let store = ContentStore { inner };

        if !already_initialized {
            let _guard = store.lock()?;
            encoding::init_root_readonly(root)?;
        }

        Ok(store)
    }

    fn lock(&self) -> Result<LockGuard<'_>> {
        self.inner.lock.acquire()
    }

    /// Resolve a `complete-<h>` symlink into an `Item`, failing with
    /// `CorruptedLink` if its target doesn't parse as `item-<h'>/`.
    fn resolve_complete(&self, h: &ContentHash, link: &Path) -> Result<Item> {
        let target = fs::read_link(link)?;
        match encoding::parse_item_target(&target) {
            Some(output_hash) => Ok(Item {
                path: item_path(&self.inner.root, &output_hash),
                hash: output_hash,
            }),
            None => Err(StoreError::CorruptedLink {
                hash: h.clone(),
                target,
            }),
        }
    }

    /// Classify `h`'s on-disk state. Must be called with the lock held.
    fn query_locked(&self, h: &ContentHash) -> Result<StateTag> {
        if pending_path(&self.inner.root, h).is_dir() {
            return Ok(StateTag::Pending);
        }
        let link = complete_path(&self.inner.root, h);
        if link.symlink_metadata().is_ok() {
            // Validate it eagerly so `query` surfaces corruption the same
            // way `lookup` does, per spec: query's CorruptedLink check is
            // not optional just because it throws away the resolved item.
            self.resolve_complete(h, &link)?;
            return Ok(StateTag::Complete);
        }
        Ok(StateTag::Missing)
    }

    fn lookup_locked(&self, h: &ContentHash) -> Result<State> {
        if pending_path(&self.inner.root, h).is_dir() {
            return Ok(State::Pending);
        }
        let link = complete_path(&self.inner.root, h);
        if link.symlink_metadata().is_ok() {
            return Ok(State::Complete(self.resolve_complete(h, &link)?));
        }
        Ok(State::Missing)
    }

    fn mark_pending_locked(&self, h: &ContentHash) -> Result<PathBuf> {
        match self.lookup_locked(h)? {
            State::Pending => return Err(StoreError::AlreadyPending(h.clone())),
            State::Complete(_) => return Err(StoreError::AlreadyComplete(h.clone())),
            State::Missing => {}
        }
        let dir = pending_path(&self.inner.root, h);
        let root = self.inner.root.clone();
        let dir2 = dir.clone();
        encoding::with_writable_root(&root, move || {
            fs::create_dir(&dir2)?;
            fs::set_permissions(&dir2, fs::Permissions::from_mode(WRITABLE_DIR_MODE))?;
            Ok(())
        })?;
        debug!("{h} -> Pending at {dir:?}");
        Ok(dir)
    }

    /// Returns only the state tag, no paths.
    pub fn query(&self, h: &ContentHash) -> Result<StateTag> {
        let _guard = self.lock()?;
        self.query_locked(h)
    }

    /// Like `query`, but resolves a completed item's hash and path.
    pub fn lookup(&self, h: &ContentHash) -> Result<State> {
        let _guard = self.lock()?;
        self.lookup_locked(h)
    }

    /// Like `lookup`, but if the key is `Pending`, also returns a
    /// subscription handle that resolves once the key leaves that state.
    pub fn lookup_or_wait(&self, h: &ContentHash) -> Result<LookupOrWait> {
        let guard = self.lock()?;
        match self.lookup_locked(h)? {
            State::Missing => Ok(LookupOrWait::Missing),
            State::Complete(item) => Ok(LookupOrWait::Complete(item)),
            State::Pending => {
                let dir = pending_path(&self.inner.root, h);
                let sub = self.inner.notifier.subscribe(&self.inner, h.clone(), dir)?;
                drop(guard);
                Ok(LookupOrWait::Pending(sub))
            }
        }
    }

    /// Transition `Missing -> Pending`, returning the new build directory.
    pub fn mark_pending(&self, h: &ContentHash) -> Result<PathBuf> {
        let _guard = self.lock()?;
        self.mark_pending_locked(h)
    }

    /// Atomic composite: complete, pending (no build dir), or a freshly
    /// created pending build dir.
    pub fn construct_if_missing(&self, h: &ContentHash) -> Result<Construct> {
        let _guard = self.lock()?;
        match self.lookup_locked(h)? {
            State::Complete(item) => Ok(Construct::Complete(item)),
            State::Pending => Ok(Construct::Pending),
            State::Missing => Ok(Construct::New(self.mark_pending_locked(h)?)),
        }
    }

    /// Like `construct_if_missing`, but returns a subscription handle
    /// instead of a bare `Pending` tag when the key is already pending.
    pub fn construct_or_wait(&self, h: &ContentHash) -> Result<ConstructOrWait> {
        let guard = self.lock()?;
        match self.lookup_locked(h)? {
            State::Complete(item) => Ok(ConstructOrWait::Complete(item)),
            State::Pending => {
                let dir = pending_path(&self.inner.root, h);
                let sub = self.inner.notifier.subscribe(&self.inner, h.clone(), dir)?;
                drop(guard);
                Ok(ConstructOrWait::Pending(sub))
            }
            State::Missing => Ok(ConstructOrWait::New(self.mark_pending_locked(h)?)),
        }
    }

    /// Block until `h` leaves the `Pending` state (or return immediately if
    /// it's already resolved). A thin convenience over `lookup_or_wait` for
    /// callers that just want to wait, not poll a handle.
    pub fn wait_until_complete(&self, h: &ContentHash) -> Result<Resolution> {
        match self.lookup_or_wait(h)? {
            LookupOrWait::Missing => Ok(Resolution::Failed),
            LookupOrWait::Complete(item) => Ok(Resolution::Completed(item)),
            LookupOrWait::Pending(sub) => Ok(sub.wait()),
        }
    }

    /// Transition `Pending -> Complete`: seal, hash, dedup-or-rename, link.
    pub fn mark_complete(&self, h: &ContentHash) -> Result<Item> {
        let _guard = self.lock()?;
        let build = match self.lookup_locked(h)? {
            State::Pending => pending_path(&self.inner.root, h),
            State::Missing => return Err(StoreError::NotPending(h.clone())),
            State::Complete(_) => return Err(StoreError::AlreadyComplete(h.clone())),
        };
        let root = self.inner.root.clone();
        let item = encoding::with_writable_root(&root, || {
            seal::complete(&root, h, &build, self.inner.hasher.as_ref())
        })?;
        debug!("{h} -> Complete({})", item.hash);
        Ok(item)
    }

    /// Transition `Pending -> Missing`, discarding the build directory.
    pub fn remove_failed(&self, h: &ContentHash) -> Result<()> {
        let _guard = self.lock()?;
        match self.lookup_locked(h)? {
            State::Pending => {}
            State::Missing => return Err(StoreError::NotPending(h.clone())),
            State::Complete(_) => return Err(StoreError::AlreadyComplete(h.clone())),
        }
        let dir = pending_path(&self.inner.root, h);
        let root = self.inner.root.clone();
        encoding::with_writable_root(&root, || {
            fs::remove_dir_all(&dir)?;
            Ok(())
        })?;
        warn!("{h} build removed (marked failed)");
        Ok(())
    }

    /// Remove whatever exists for `h` -- pending dir, complete link, or
    /// nothing -- without touching the item directory a `complete-` link
    /// might point at (items may be shared by other keys).
    pub fn remove_forcibly(&self, h: &ContentHash) -> Result<()> {
        let _guard = self.lock()?;
        let root = self.inner.root.clone();
        let pending = pending_path(&root, h);
        let complete = complete_path(&root, h);
        encoding::with_writable_root(&root, || {
            if pending.is_dir() {
                fs::remove_dir_all(&pending)?;
            }
            if complete.symlink_metadata().is_ok() {
                fs::remove_file(&complete)?;
            }
            Ok(())
        })
    }

    /// Remove an item directory outright. Leaves any `complete-` links
    /// pointing at it dangling; subsequent `query`/`lookup` on those keys
    /// will fail with `CorruptedLink`.
    pub fn remove_item_forcibly(&self, item_hash: &ContentHash) -> Result<()> {
        let _guard = self.lock()?;
        let root = self.inner.root.clone();
        let path = item_path(&root, item_hash);
        encoding::with_writable_root(&root, || {
            if path.is_dir() {
                // The item tree is read-only; make it writable before
                // recursive removal can unlink its entries.
                seal::unseal_tree(&path)?;
                fs::remove_dir_all(&path)?;
            }
            Ok(())
        })?;
        warn!("item {item_hash} removed forcibly; dependent complete- links now dangle");
        Ok(())
    }

    /// Enumerate the store's top-level entries in one directory read.
    pub fn list_all(&self) -> Result<Listing> {
        let _guard = self.lock()?;
        let mut listing = Listing::default();
        for entry in fs::read_dir(&self.inner.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            match encoding::classify(name) {
                Some(Entry::Pending(h)) => listing.pending.push(h),
                Some(Entry::Complete(h)) => listing.complete.push(h),
                Some(Entry::Item(h)) => listing.items.push(h),
                None => {}
            }
        }
        Ok(listing)
    }
}

/// Needed by the notifier's background thread, which re-queries state after
/// waking without going through a `ContentStore` handle directly (it only
/// holds a `Weak<Inner>`, so the store can be torn down out from under it).
pub(crate) fn lookup_via_weak(inner: &Weak<Inner>, h: &ContentHash) -> Option<Result<State>> {
    let inner = inner.upgrade()?;
    let store = ContentStore { inner };
    Some((|| {
        let _guard = store.lock()?;
        store.lookup_locked(h)
    })())
}
