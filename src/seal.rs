//! Sealing a completed pending tree (recursive write-bit removal) and the
//! dedup/rename step that turns it into an `item-<h'>/` directory, linked
//! from `complete-<h>`.

use crate::encoding::{complete_path, item_path};
use crate::prelude::*;
use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};

/// Recursively clear the owner/group/other write bits on every file and
/// directory within `dir`, bottom-up (children before their parent, so we
/// never lock ourselves out of a directory we still need to write into).
pub(crate) fn seal_tree(dir: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            seal_tree(&path)?;
        }
        clear_write_bits(&path)?;
    }
    clear_write_bits(dir)
}

fn clear_write_bits(path: &Path) -> std::io::Result<()> {
    let mode = fs::symlink_metadata(path)?.permissions().mode();
    fs::set_permissions(path, fs::Permissions::from_mode(mode & !0o222))
}

/// The inverse of `seal_tree`: restore owner write recursively, so a sealed
/// item directory can be recursively removed by
/// [`crate::ContentStore::remove_item_forcibly`].
pub(crate) fn unseal_tree(dir: &Path) -> std::io::Result<()> {
    add_owner_write(dir)?;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            unseal_tree(&path)?;
        } else {
            add_owner_write(&path)?;
        }
    }
    Ok(())
}

fn add_owner_write(path: &Path) -> std::io::Result<()> {
    let mode = fs::symlink_metadata(path)?.permissions().mode();
    fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o200))
}

/// Finish constructing `h`: seal `build`, hash it, and either discard it (a
/// dedup hit against an existing item) or rename it into place. Either way,
/// install the `complete-<h>` symlink and return the resulting [`Item`].
///
/// Must be called with the store lock held; the caller is responsible for
/// that (this module has no knowledge of locking).
pub(crate) fn complete(
    root: &Path,
    h: &ContentHash,
    build: &Path,
    hasher: &dyn crate::store::DirHasher,
) -> Result<crate::store::Item> {
    seal_tree(build)?;
    let output_hash = hasher.hash_dir(build)?;
    let final_path = item_path(root, &output_hash);

    if final_path.exists() {
        debug!("dedup hit for {output_hash}, discarding freshly built tree");
        // `seal_tree` just cleared every write bit in `build`, including its
        // own -- removing its entries needs that bit back first.
        unseal_tree(build)?;
        fs::remove_dir_all(build)?;
    } else {
        fs::rename(build, &final_path)?;
    }

    let link_path = complete_path(root, h);
    // Both `complete-<h>` and `item-<h'>` live directly under `root/`, so the
    // relative target is just the item directory's own filename.
    let target = final_path
        .file_name()
        .expect("item path always has a file name");
    symlink(target, &link_path)?;

    Ok(crate::store::Item {
        hash: output_hash,
        path: final_path,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::{DirHasher, Item};
    use std::io::Write;

    struct FixedHasher(ContentHash);
    impl DirHasher for FixedHasher {
        fn hash_dir(&self, _dir: &Path) -> Result<ContentHash> {
            Ok(self.0.clone())
        }
    }

    fn write_file(path: &Path, contents: &[u8]) {
        let mut f = fs::File::create(path).unwrap();
        f.write_all(contents).unwrap();
    }

    #[test]
    fn seal_tree_clears_write_bits_recursively() {
        let tmp = tempfile::tempdir().unwrap();
        let sub = tmp.path().join("sub");
        fs::create_dir(&sub).unwrap();
        write_file(&tmp.path().join("top.txt"), b"top");
        write_file(&sub.join("nested.txt"), b"nested");

        seal_tree(tmp.path()).unwrap();

        for p in [
            tmp.path().to_path_buf(),
            tmp.path().join("top.txt"),
            sub.clone(),
            sub.join("nested.txt"),
        ] {
            let mode = fs::metadata(&p).unwrap().permissions().mode();
            assert_eq!(mode & 0o222, 0, "{p:?} still has a write bit set");
        }
    }

    #[test]
    fn complete_renames_on_first_arrival() {
        let tmp = tempfile::tempdir().unwrap();
        let build = tmp.path().join("pending-h1");
        fs::create_dir(&build).unwrap();
        write_file(&build.join("out"), b"hello");

        let h = ContentHash::from_bytes(vec![1]);
        let output = ContentHash::from_bytes(vec![0xAA]);
        let hasher = FixedHasher(output.clone());

        let item: Item = complete(tmp.path(), &h, &build, &hasher).unwrap();
        assert_eq!(item.hash, output);
        assert!(item.path.is_dir());
        assert!(!build.exists());

        let link = complete_path(tmp.path(), &h);
        let resolved = fs::read_link(&link).unwrap();
        assert_eq!(resolved, item_path(tmp.path(), &output).file_name().unwrap());
    }

    #[test]
    fn complete_dedups_against_existing_item() {
        let tmp = tempfile::tempdir().unwrap();
        let output = ContentHash::from_bytes(vec![0xBB]);

        let build_a = tmp.path().join("pending-a");
        fs::create_dir(&build_a).unwrap();
        write_file(&build_a.join("out"), b"same bytes");
        let ha = ContentHash::from_bytes(vec![1]);
        let item_a = complete(tmp.path(), &ha, &build_a, &FixedHasher(output.clone())).unwrap();

        let build_b = tmp.path().join("pending-b");
        fs::create_dir(&build_b).unwrap();
        write_file(&build_b.join("out"), b"same bytes");
        let hb = ContentHash::from_bytes(vec![2]);
        let item_b = complete(tmp.path(), &hb, &build_b, &FixedHasher(output.clone())).unwrap();

        assert_eq!(item_a.path, item_b.path);
        assert!(!build_b.exists());

        let item_dirs = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("item-"))
            .count();
        assert_eq!(item_dirs, 1);
    }
}
