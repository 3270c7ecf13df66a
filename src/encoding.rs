//! The mapping between a key's logical state and its on-disk representation:
//! the three top-level name prefixes, and the writable-bit protocol on
//! `root/` itself.

use crate::prelude::*;
use std::fs;
use std::os::unix::fs::PermissionsExt;

const PENDING_PREFIX: &str = "pending-";
const COMPLETE_PREFIX: &str = "complete-";
const ITEM_PREFIX: &str = "item-";

/// `root/`'s mode while a mutating transition is in progress.
const WRITABLE_ROOT_MODE: u32 = 0o755;
/// `root/`'s mode at rest: the writable mode with every write bit masked off.
const READONLY_ROOT_MODE: u32 = WRITABLE_ROOT_MODE & !0o222;

pub(crate) fn pending_name(h: &ContentHash) -> String {
    format!("{PENDING_PREFIX}{}", h.encode())
}

pub(crate) fn complete_name(h: &ContentHash) -> String {
    format!("{COMPLETE_PREFIX}{}", h.encode())
}

pub(crate) fn item_name(h: &ContentHash) -> String {
    format!("{ITEM_PREFIX}{}", h.encode())
}

pub(crate) fn pending_path(root: &Path, h: &ContentHash) -> PathBuf {
    root.join(pending_name(h))
}

pub(crate) fn complete_path(root: &Path, h: &ContentHash) -> PathBuf {
    root.join(complete_name(h))
}

pub(crate) fn item_path(root: &Path, h: &ContentHash) -> PathBuf {
    root.join(item_name(h))
}

/// What a top-level entry name under `root/` decodes to, if anything.
pub(crate) enum Entry {
    Pending(ContentHash),
    Complete(ContentHash),
    Item(ContentHash),
}

/// Classify a single top-level entry name. Returns `None` for anything that
/// isn't one of our three prefixes, or whose suffix isn't a valid encoded
/// hash -- such entries are foreign and ignored rather than treated as
/// corruption (only a malformed `complete-` *target* is corruption; a
/// malformed top-level *name* just isn't ours).
pub(crate) fn classify(name: &str) -> Option<Entry> {
    if let Some(suffix) = name.strip_prefix(PENDING_PREFIX) {
        return ContentHash::try_decode(suffix).map(Entry::Pending);
    }
    if let Some(suffix) = name.strip_prefix(COMPLETE_PREFIX) {
        return ContentHash::try_decode(suffix).map(Entry::Complete);
    }
    if let Some(suffix) = name.strip_prefix(ITEM_PREFIX) {
        return ContentHash::try_decode(suffix).map(Entry::Item);
    }
    None
}

/// Parse the target of a `complete-<h>` symlink, which must be a relative
/// path whose final component is `item-<h'>`.
pub(crate) fn parse_item_target(target: &Path) -> Option<ContentHash> {
    let name = target.file_name()?.to_str()?;
    let suffix = name.strip_prefix(ITEM_PREFIX)?;
    ContentHash::try_decode(suffix)
}

fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

pub(crate) fn init_root_readonly(root: &Path) -> std::io::Result<()> {
    set_mode(root, READONLY_ROOT_MODE)
}

/// A scoped acquisition of `root/`'s owner-write bit. Restores the at-rest
/// mode on every exit path -- including a panic unwinding through the
/// closure passed to [`with_writable_root`] -- because the restoration lives
/// in `Drop`, not in a post-closure statement that a `?` or panic could skip.
struct WritableRootGuard<'a> {
    root: &'a Path,
}

impl<'a> WritableRootGuard<'a> {
    fn acquire(root: &'a Path) -> std::io::Result<Self> {
        set_mode(root, WRITABLE_ROOT_MODE)?;
        Ok(WritableRootGuard { root })
    }
}

impl<'a> Drop for WritableRootGuard<'a> {
    fn drop(&mut self) {
        if let Err(e) = set_mode(self.root, READONLY_ROOT_MODE) {
            warn!("failed to restore read-only mode on {:?}: {e}", self.root);
        }
    }
}

/// Run `f` with `root`'s owner-write bit set, restoring the at-rest mode
/// (owner write cleared) when `f` returns, errors, or panics.
pub(crate) fn with_writable_root<T>(
    root: &Path,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let _guard = WritableRootGuard::acquire(root)?;
    f()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classifies_each_prefix() {
        let h = ContentHash::from_bytes(vec![9, 9, 9]);
        match classify(&pending_name(&h)) {
            Some(Entry::Pending(got)) => assert_eq!(got, h),
            _ => panic!("expected Pending"),
        }
        match classify(&complete_name(&h)) {
            Some(Entry::Complete(got)) => assert_eq!(got, h),
            _ => panic!("expected Complete"),
        }
        match classify(&item_name(&h)) {
            Some(Entry::Item(got)) => assert_eq!(got, h),
            _ => panic!("expected Item"),
        }
    }

    #[test]
    fn ignores_foreign_entries() {
        assert!(classify("lock").is_none());
        assert!(classify("tmp").is_none());
        assert!(classify("pending-not-valid-base64!!").is_none());
    }

    #[test]
    fn parses_item_target() {
        let h = ContentHash::from_bytes(vec![1, 2, 3]);
        let target = PathBuf::from(item_name(&h));
        assert_eq!(parse_item_target(&target), Some(h));
        assert_eq!(parse_item_target(Path::new("garbage")), None);
    }

    #[test]
    fn writable_root_guard_restores_mode_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        init_root_readonly(tmp.path()).unwrap();
        let mode_before = fs::metadata(tmp.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode_before, READONLY_ROOT_MODE);

        with_writable_root(tmp.path(), || {
            let mode_during =
                fs::metadata(tmp.path()).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode_during, WRITABLE_ROOT_MODE);
            Ok(())
        })
        .unwrap();

        let mode_after = fs::metadata(tmp.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode_after, READONLY_ROOT_MODE);
    }

    #[test]
    fn writable_root_guard_restores_mode_even_on_error() {
        let tmp = tempfile::tempdir().unwrap();
        init_root_readonly(tmp.path()).unwrap();

        let result: Result<()> = with_writable_root(tmp.path(), || {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom").into())
        });
        assert!(result.is_err());

        let mode_after = fs::metadata(tmp.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode_after, READONLY_ROOT_MODE);
    }
}
