use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::debug;

use crate::error::{Error, Result};
use crate::hasher::HashAlgo;
use crate::ignore::{Ignore, NameRules};
use crate::status::{LogEvent, PerfEvent, Status};
use crate::store::{IndexStore, StoreSetup};
use crate::worker;

/// One directory's work unit, produced by the traversal and consumed by
/// exactly one worker.
pub(crate) struct WorkItem {
    pub dir: PathBuf,
    pub files: Vec<String>,
    pub dirs: Vec<String>,
    pub ignore: Arc<Ignore>,
}

/// Aggregated result counters of a run. Monotone during the run; read via
/// [`Context::counters`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunCounters {
    pub total: i64,
    pub index_saved: i64,
    pub new: i64,
    pub updated: i64,
    pub deleted: i64,
    pub damaged: i64,
    pub errors: i64,
}

impl RunCounters {
    /// Whether the run should be reported as a failure.
    pub fn failed(&self) -> bool {
        self.damaged > 0 || self.errors > 0
    }
}

/// Shared state of one check/update run: flags, channels, counters and the
/// store selection.
pub struct Context {
    pub num_workers: usize,
    pub update_index: bool,
    /// Skip hashing files whose mtime is unchanged (quick add-only update).
    pub skip_check: bool,
    pub show_ignored_only: bool,
    /// Report removed files/directories.
    pub log_deleted: bool,
    /// In check mode, drop `new` events entirely.
    pub skip_new: bool,
    pub include_dot: bool,
    pub force_update_dmg: bool,
    pub hash_algo: HashAlgo,
    pub track_directories: bool,
    pub skip_symlinks: bool,
    /// Traversal depth limit; 0 means unlimited.
    pub max_depth: u32,

    index_filename: String,
    ignore_filename: String,

    work_tx: Sender<Option<WorkItem>>,
    work_rx: Receiver<Option<WorkItem>>,
    log_tx: Sender<Option<LogEvent>>,
    log_rx: Receiver<Option<LogEvent>>,
    perf_tx: Sender<PerfEvent>,
    perf_rx: Receiver<PerfEvent>,

    counters: Mutex<RunCounters>,
    abort: AtomicBool,
    store_setup: Mutex<StoreSetup>,
}

impl Context {
    pub fn new(
        num_workers: usize,
        hash_algo: HashAlgo,
        index_filename: &str,
        ignore_filename: &str,
    ) -> Result<Context> {
        if !index_filename.starts_with('.') {
            return Err(Error::Config(
                "the index filename must start with a dot".to_string(),
            ));
        }
        if !ignore_filename.starts_with('.') {
            return Err(Error::Config(
                "the ignore filename must start with a dot".to_string(),
            ));
        }
        if num_workers < 1 {
            return Err(Error::Config("expected at least one worker".to_string()));
        }

        let (work_tx, work_rx) = bounded(num_workers * 10);
        let (log_tx, log_rx) = bounded(num_workers * 100);
        let (perf_tx, perf_rx) = bounded(num_workers * 10);

        Ok(Context {
            num_workers,
            update_index: false,
            skip_check: false,
            show_ignored_only: false,
            log_deleted: false,
            skip_new: false,
            include_dot: false,
            force_update_dmg: false,
            hash_algo,
            track_directories: true,
            skip_symlinks: false,
            max_depth: 0,
            index_filename: index_filename.to_string(),
            ignore_filename: ignore_filename.to_string(),
            work_tx,
            work_rx,
            log_tx,
            log_rx,
            perf_tx,
            perf_rx,
            counters: Mutex::new(RunCounters::default()),
            abort: AtomicBool::new(false),
            store_setup: Mutex::new(StoreSetup::Split),
        })
    }

    pub fn index_filename(&self) -> &str {
        &self.index_filename
    }

    pub fn ignore_filename(&self) -> &str {
        &self.ignore_filename
    }

    /// The event stream of a run; closed by a final `None`.
    pub fn log_events(&self) -> Receiver<Option<LogEvent>> {
        self.log_rx.clone()
    }

    pub fn perf_events(&self) -> Receiver<PerfEvent> {
        self.perf_rx.clone()
    }

    pub fn counters(&self) -> RunCounters {
        *self.counters.lock().unwrap()
    }

    /// Request cooperative cancellation; checked before each directory
    /// descent.
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }

    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    /// Reserved names are excluded from indexing; the index prefix also
    /// covers the store's `-db`, `.bak` and `.new` companions.
    pub fn is_reserved(&self, name: &str) -> bool {
        name.starts_with(&self.index_filename) || name == self.ignore_filename
    }

    pub(crate) fn name_rules(&self) -> Arc<NameRules> {
        Arc::new(NameRules {
            index_name: self.index_filename.clone(),
            ignore_name: self.ignore_filename.clone(),
            include_dot: self.include_dot,
        })
    }

    pub(crate) fn log(&self, status: Status, message: String) {
        {
            let mut c = self.counters.lock().unwrap();
            match status {
                Status::Damage => {
                    c.total += 1;
                    c.damaged += 1;
                }
                Status::IndexUpdate => c.index_saved += 1,
                Status::Update | Status::WarnOld => {
                    c.total += 1;
                    c.updated += 1;
                }
                Status::New => {
                    c.total += 1;
                    c.new += 1;
                }
                Status::Ok => {
                    if !self.skip_check {
                        c.total += 1;
                    }
                }
                Status::Deleted => c.deleted += 1,
                Status::Panic => c.errors += 1,
                _ => {}
            }
        }
        let _ = self.log_tx.send(Some(LogEvent { status, message }));
    }

    pub(crate) fn log_err(&self, path: &str, err: &Error) {
        self.log(Status::Panic, format!("{path}: {err}"));
    }

    pub(crate) fn perf_files(&self, files: i64) {
        let _ = self.perf_tx.send(PerfEvent { files, bytes: 0 });
    }

    pub(crate) fn perf_bytes(&self, bytes: i64) {
        let _ = self.perf_tx.send(PerfEvent { files: 0, bytes });
    }

    pub(crate) fn work_recv(&self) -> Option<WorkItem> {
        self.work_rx.recv().ok().flatten()
    }

    /// Switch persistence to the atom store rooted at `root`. All scan
    /// paths must live below the root; scanning exactly the root enables
    /// the write-amplification-free rewrite.
    pub fn use_atom_store(&self, root: &Path, paths: &[PathBuf]) -> Result<PathBuf> {
        let root = fs::canonicalize(root)?;
        let mut refresh = paths.len() == 1;
        for path in paths {
            let abs = fs::canonicalize(path)?;
            if !abs.starts_with(&root) {
                return Err(Error::Config(format!(
                    "path {} is not below the atom store in {}",
                    path.display(),
                    root.display()
                )));
            }
            if abs != root {
                refresh = false;
            }
        }
        *self.store_setup.lock().unwrap() = StoreSetup::Atom {
            root: root.clone(),
            refresh,
        };
        Ok(root)
    }

    /// Run a full check/update over `paths`: one producer walks the tree,
    /// `num_workers` workers hash and reconcile, the store persists. The
    /// log stream is closed by a final sentinel.
    pub fn process(&self, paths: &[PathBuf]) -> RunCounters {
        *self.counters.lock().unwrap() = RunCounters::default();

        let setup = self.store_setup.lock().unwrap().clone();
        let store = match IndexStore::open(
            setup,
            &self.index_filename,
            !self.update_index,
            self.num_workers,
            self.log_tx.clone(),
        ) {
            Ok(store) => store,
            Err(e) => {
                self.log_err("index", &e);
                let _ = self.log_tx.send(None);
                return self.counters();
            }
        };

        let rules = self.name_rules();
        thread::scope(|scope| {
            for _ in 0..self.num_workers {
                scope.spawn(|| worker::run_worker(self, &store));
            }
            scope.spawn(|| {
                for path in paths {
                    match fs::canonicalize(path) {
                        Ok(root) => self.scan_dir(&root, None, &rules, 1),
                        Err(e) => self.log_err(&format!("{}/", path.display()), &e.into()),
                    }
                }
                for _ in 0..self.num_workers {
                    let _ = self.work_tx.send(None);
                }
            });
        });

        match store.finish(self.aborted()) {
            Ok(true) => self.log(Status::Info, "The index db was updated".to_string()),
            Ok(false) => {}
            Err(e) => self.log_err("index", &e),
        }
        let _ = self.log_tx.send(None);
        debug!("run complete: {:?}", self.counters());
        self.counters()
    }

    fn scan_dir(
        &self,
        root: &Path,
        parent_ignore: Option<Arc<Ignore>>,
        rules: &Arc<NameRules>,
        depth: u32,
    ) {
        if self.aborted() {
            return;
        }

        let entries = match fs::read_dir(root) {
            Ok(iter) => {
                let mut entries: Vec<_> = match iter.collect::<std::io::Result<Vec<_>>>() {
                    Ok(v) => v,
                    Err(e) => {
                        self.log_err(&format!("{}/", root.display()), &e.into());
                        return;
                    }
                };
                entries.sort_by_key(|e| e.file_name());
                entries
            }
            Err(e) => {
                self.log_err(&format!("{}/", root.display()), &e.into());
                return;
            }
        };

        let ignore = match Ignore::load(rules.clone(), root, parent_ignore) {
            Ok(ignore) => ignore,
            Err(e) => {
                self.log_err(&format!("{}/", root.display()), &e);
                Ignore::empty(rules.clone(), root)
            }
        };

        let mut dirs = Vec::new();
        let mut files = Vec::new();
        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = root.join(&name);
            if self.is_dir_entry(&entry, &path) {
                if !ignore.should_ignore(&name) {
                    dirs.push(name);
                } else {
                    self.log(Status::Ignore, format!("{name}/"));
                }
            } else if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                files.push(name);
            }
        }

        let _ = self.work_tx.send(Some(WorkItem {
            dir: root.to_path_buf(),
            files,
            dirs: dirs.clone(),
            ignore: ignore.clone(),
        }));

        if self.max_depth == 0 || depth < self.max_depth {
            for name in dirs {
                self.scan_dir(&root.join(name), Some(ignore.clone()), rules, depth + 1);
            }
        }
    }

    /// Symlinks are resolved to determine the kind unless disabled.
    fn is_dir_entry(&self, entry: &fs::DirEntry, path: &Path) -> bool {
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_validates_inputs() {
        assert!(Context::new(1, HashAlgo::Blake3, ".intact", ".intactignore").is_ok());
        assert!(Context::new(0, HashAlgo::Blake3, ".intact", ".intactignore").is_err());
        assert!(Context::new(1, HashAlgo::Blake3, "intact", ".intactignore").is_err());
        assert!(Context::new(1, HashAlgo::Blake3, ".intact", "intactignore").is_err());
    }

    #[test]
    fn ok_counts_toward_total_only_outside_skip_mode() {
        let ctx = Context::new(1, HashAlgo::Blake3, ".intact", ".intactignore").unwrap();
        ctx.log(Status::Ok, "a".to_string());
        assert_eq!(ctx.counters().total, 1);

        let mut skip = Context::new(1, HashAlgo::Blake3, ".intact", ".intactignore").unwrap();
        skip.skip_check = true;
        skip.log(Status::Ok, "a".to_string());
        assert_eq!(skip.counters().total, 0);
    }

    #[test]
    fn counter_identity_over_statuses() {
        let ctx = Context::new(1, HashAlgo::Blake3, ".intact", ".intactignore").unwrap();
        ctx.log(Status::New, "n".to_string());
        ctx.log(Status::Update, "u".to_string());
        ctx.log(Status::WarnOld, "o".to_string());
        ctx.log(Status::Damage, "d".to_string());
        ctx.log(Status::Ok, "k".to_string());
        let c = ctx.counters();
        let num_ok = 1;
        assert_eq!(c.total, num_ok + c.new + c.updated + c.damaged);
        assert!(c.failed());
    }
}
