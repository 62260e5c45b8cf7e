use std::fs;
use std::path::Path;

use crossbeam_channel::unbounded;

use crate::error::{Error, Result};
use crate::index;
use crate::status::Status;
use crate::store::{self, parse_atom_document, IndexStore, StoreKind, StoreSetup};

/// Collapse a mixed tree of split and nested atom indexes below `root`
/// into the atom store at `root`. Source indexes are left in place.
/// Returns the number of fused index blobs.
pub fn fuse_store(
    root: &Path,
    index_name: &str,
    skip_symlinks: bool,
    verbose: bool,
    mut log: impl FnMut(&str),
) -> Result<usize> {
    let root = fs::canonicalize(root)?;
    if !store::marker_file(StoreKind::Atom, &root, index_name).exists() {
        return Err(Error::Store(
            "no atom index at the target (run 'init atom' first)".to_string(),
        ));
    }

    // store errors are rare here; an unbounded queue avoids interleaving a
    // drain thread with the walk
    let (log_tx, log_rx) = unbounded();
    let store = IndexStore::open(
        StoreSetup::Atom {
            root: root.clone(),
            refresh: false,
        },
        index_name,
        false,
        100,
        log_tx,
    )?;

    let mut fuse = Fuser {
        store: &store,
        index_name,
        skip_symlinks,
        verbose,
        count: 0,
        log: &mut log,
    };
    fuse.scan_dir(&root, "");
    let count = fuse.count;

    store.finish(false)?;

    while let Ok(Some(event)) = log_rx.try_recv() {
        log(&format!("{} {}", event.status, event.message));
    }
    log(&format!("fused {count} indexes"));
    Ok(count)
}

struct Fuser<'a, F: FnMut(&str)> {
    store: &'a IndexStore,
    index_name: &'a str,
    skip_symlinks: bool,
    verbose: bool,
    count: usize,
    log: &'a mut F,
}

impl<F: FnMut(&str)> Fuser<'_, F> {
    fn log_err(&mut self, message: &str) {
        (self.log)(&format!("{} {}", Status::Panic, message));
    }

    fn scan_dir(&mut self, dir: &Path, prefix: &str) {
        let entries = match fs::read_dir(dir) {
            Ok(iter) => {
                let mut entries: Vec<_> = iter.flatten().collect();
                entries.sort_by_key(|e| e.file_name());
                entries
            }
            Err(e) => {
                self.log_err(&format!("{}/: {}", dir.display(), e));
                return;
            }
        };

        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = dir.join(&name);
            if !self.is_dir(&entry, &path) {
                continue;
            }
            let child_prefix = format!("{prefix}{name}/");

            let atom_marker = store::marker_file(StoreKind::Atom, &path, self.index_name);
            let split_marker = store::marker_file(StoreKind::Split, &path, self.index_name);
            if atom_marker.exists() {
                if let Err(e) = self.fuse_atom(&atom_marker, &child_prefix) {
                    self.log_err(&format!("fuse {}/: {}", path.display(), e));
                }
            } else if split_marker.exists() {
                if let Err(e) = self.fuse_split(&split_marker, &child_prefix) {
                    self.log_err(&format!("fuse {}/: {}", path.display(), e));
                }
            }

            self.scan_dir(&path, &child_prefix);
        }
    }

    fn is_dir(&self, entry: &fs::DirEntry, path: &Path) -> bool {
        let Ok(ft) = entry.file_type() else {
            return false;
        };
        if ft.is_dir() {
            return true;
        }
        if ft.is_symlink() && !self.skip_symlinks {
            return fs::metadata(path).map(|md| md.is_dir()).unwrap_or(false);
        }
        false
    }

    /// Re-key a nested atom document's entries under the accumulated
    /// prefix.
    fn fuse_atom(&mut self, file: &Path, prefix: &str) -> Result<()> {
        if self.verbose {
            (self.log)(&format!("fusing {}", file.display()));
        }
        let text = fs::read_to_string(file)?;
        let mut count = 0usize;
        parse_atom_document(&text, |key, value| {
            let full = if key.is_empty() {
                format!("{prefix}{}", self.index_name)
            } else {
                format!("{prefix}{key}/{}", self.index_name)
            };
            self.store
                .save_raw(full, value.get().as_bytes().to_vec())?;
            count += 1;
            Ok(())
        })?;
        self.count += count;
        Ok(())
    }

    /// Take a sidecar file verbatim, after checking it decodes.
    fn fuse_split(&mut self, file: &Path, prefix: &str) -> Result<()> {
        if self.verbose {
            (self.log)(&format!("fusing {} prefix: {}", file.display(), prefix));
        }
        let value = fs::read(file)?;
        index::decode_index(&value)?;
        self.store
            .save_raw(format!("{prefix}{}", self.index_name), value)?;
        self.count += 1;
        Ok(())
    }
}
