mod atom;
mod kv;

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use filetime::FileTime;
use rusqlite::{params, Connection, OptionalExtension};
use tempfile::TempPath;
use tracing::debug;

use crate::error::{Error, Result};
use crate::status::{LogEvent, Status};

pub(crate) use atom::parse_atom_document;

/// On-disk suffix of the atom document relative to the index filename.
pub const ATOM_FILE_SUFFIX: &str = "-db";
const BAK_SUFFIX: &str = ".bak";
const NEW_SUFFIX: &str = ".new";

/// Batched atom writes are committed at least this often.
const TX_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// One sidecar index file per directory.
    Split,
    /// One aggregated document at the tree root.
    Atom,
}

/// Persistence selection selected before a run.
#[derive(Debug, Clone)]
pub enum StoreSetup {
    Split,
    Atom { root: PathBuf, refresh: bool },
}

pub fn atom_file(root: &Path, index_name: &str, suffix: &str) -> PathBuf {
    root.join(format!("{index_name}{ATOM_FILE_SUFFIX}{suffix}"))
}

pub fn marker_file(kind: StoreKind, path: &Path, index_name: &str) -> PathBuf {
    match kind {
        StoreKind::Split => path.join(index_name),
        StoreKind::Atom => atom_file(path, index_name, ""),
    }
}

/// Walk up from `start` looking for a store marker; the atom form wins
/// when both exist in one directory.
pub fn locate(start: &Path, filter: Option<StoreKind>, index_name: &str) -> Result<(StoreKind, PathBuf)> {
    let mut path = fs::canonicalize(start)?;
    loop {
        for kind in [StoreKind::Atom, StoreKind::Split] {
            if filter.is_none() || filter == Some(kind) {
                if marker_file(kind, &path, index_name).exists() {
                    return Ok((kind, path));
                }
            }
        }
        match path.parent() {
            Some(parent) if parent != path => path = parent.to_path_buf(),
            _ => {
                return Err(Error::Store(
                    "index could not be located (run 'intact init' first)".to_string(),
                ))
            }
        }
    }
}

/// Create an empty store marker of the given kind.
pub fn initialize(kind: StoreKind, path: &Path, index_name: &str, force: bool) -> Result<()> {
    let marker = marker_file(kind, path, index_name);
    if marker.exists() {
        if force {
            fs::remove_file(&marker)?;
        } else {
            return Err(Error::Store(format!(
                "{} already exists",
                marker.display()
            )));
        }
    }
    let contents = match kind {
        StoreKind::Split => "{}".to_string(),
        StoreKind::Atom => format!("{}{}", atom::ATOM_PREFIX, atom::ATOM_SUFFIX),
    };
    fs::write(&marker, contents)?;
    Ok(())
}

type SaveItem = (String, Vec<u8>);

struct AtomState {
    root: PathBuf,
    cache_r: TempPath,
    cache_w: Option<TempPath>,
    conn_r: Mutex<Connection>,
    save_tx: Option<Sender<SaveItem>>,
    writer: Option<JoinHandle<()>>,
    dirty: AtomicBool,
}

enum Mode {
    Split,
    Atom(AtomState),
}

/// Uniform load/save over the two index layouts. Opening the atom form
/// imports the document into an ephemeral KV cache; closing with changes
/// exports it back and swaps the documents atomically.
pub struct IndexStore {
    index_name: String,
    read_only: bool,
    mode: Mode,
}

impl IndexStore {
    pub fn open(
        setup: StoreSetup,
        index_name: &str,
        read_only: bool,
        num_workers: usize,
        log_tx: Sender<Option<LogEvent>>,
    ) -> Result<IndexStore> {
        let mode = match setup {
            StoreSetup::Split => Mode::Split,
            StoreSetup::Atom { root, refresh } => {
                Mode::Atom(open_atom(&root, index_name, read_only, refresh, num_workers, log_tx)?)
            }
        };
        Ok(IndexStore {
            index_name: index_name.to_string(),
            read_only,
            mode,
        })
    }

    fn atom_key(&self, dir: &Path, root: &Path) -> Result<String> {
        let rel = dir.strip_prefix(root).map_err(|_| {
            Error::Store(format!(
                "{} is outside the atom store root {}",
                dir.display(),
                root.display()
            ))
        })?;
        let rel = rel.to_string_lossy();
        if rel.is_empty() {
            Ok(self.index_name.clone())
        } else {
            Ok(format!("{rel}/{}", self.index_name))
        }
    }

    /// Whether the run is a full rewrite into a fresh KV. Directories must
    /// then save their blobs even when unchanged, so the exported document
    /// stays complete (stale keys of removed trees drop out).
    pub fn is_refresh(&self) -> bool {
        matches!(&self.mode, Mode::Atom(state) if state.cache_w.is_some())
    }

    /// Fetch the index blob for `dir`, or `None` for untracked directories.
    pub fn load(&self, dir: &Path) -> Result<Option<Vec<u8>>> {
        match &self.mode {
            Mode::Split => {
                let path = dir.join(&self.index_name);
                match fs::read(&path) {
                    Ok(bytes) => Ok(Some(bytes)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(e.into()),
                }
            }
            Mode::Atom(state) => {
                let key = self.atom_key(dir, &state.root)?;
                let conn = state.conn_r.lock().unwrap();
                let value = conn
                    .query_row("SELECT value FROM data WHERE key = ?1", params![key], |row| {
                        row.get::<_, Vec<u8>>(0)
                    })
                    .optional()?;
                Ok(value)
            }
        }
    }

    /// Persist the index blob for `dir`.
    pub fn save(&self, dir: &Path, value: Vec<u8>) -> Result<()> {
        match &self.mode {
            Mode::Split => save_split(dir, &self.index_name, &value),
            Mode::Atom(state) => {
                let key = self.atom_key(dir, &state.root)?;
                self.save_raw(key, value)
            }
        }
    }

    /// Enqueue a blob under an explicit store key (atom mode only).
    pub(crate) fn save_raw(&self, key: String, value: Vec<u8>) -> Result<()> {
        let Mode::Atom(state) = &self.mode else {
            return Err(Error::Store("raw keys require the atom store".to_string()));
        };
        let tx = state
            .save_tx
            .as_ref()
            .ok_or_else(|| Error::Store("store is read-only".to_string()))?;
        state.dirty.store(true, Ordering::Relaxed);
        tx.send((key, value))
            .map_err(|_| Error::Store("store writer stopped".to_string()))
    }

    /// Close the store. With pending atom changes, export a new document
    /// and swap it in; on abort the export is discarded so the on-disk
    /// document keeps its pre-run state. Returns whether the document was
    /// replaced.
    pub fn finish(self, aborted: bool) -> Result<bool> {
        let Mode::Atom(mut state) = self.mode else {
            return Ok(false);
        };

        // disconnect the queue, then let the writer flush its last batch
        state.save_tx.take();
        if let Some(handle) = state.writer.take() {
            let _ = handle.join();
        }
        drop(state.conn_r.into_inner().unwrap());

        if self.read_only || aborted || !state.dirty.load(Ordering::Relaxed) {
            return Ok(false);
        }

        let cache: &Path = state.cache_w.as_deref().unwrap_or(&state.cache_r);
        let new_file = atom_file(&state.root, &self.index_name, NEW_SUFFIX);
        atom::export_atom(cache, &new_file, &self.index_name)?;

        let doc = atom_file(&state.root, &self.index_name, "");
        fs::rename(&doc, atom_file(&state.root, &self.index_name, BAK_SUFFIX))?;
        fs::rename(&new_file, &doc)?;
        debug!("atom document replaced at {}", doc.display());
        Ok(true)
    }
}

fn open_atom(
    root: &Path,
    index_name: &str,
    read_only: bool,
    refresh: bool,
    num_workers: usize,
    log_tx: Sender<Option<LogEvent>>,
) -> Result<AtomState> {
    let cache_r = temp_kv_path()?;
    let conn_r = kv::open(&cache_r)?;
    conn_r.execute_batch(kv::DATA_SCHEMA)?;
    import_document(&conn_r, root, index_name)?;

    let mut state = AtomState {
        root: root.to_path_buf(),
        cache_r,
        cache_w: None,
        conn_r: Mutex::new(conn_r),
        save_tx: None,
        writer: None,
        dirty: AtomicBool::new(false),
    };

    if !read_only {
        // fail early if the export target is not writable
        File::create(atom_file(root, index_name, NEW_SUFFIX))?;

        let write_conn = if refresh {
            // leave the imported cache untouched and collect the rewrite
            // in a second KV
            let cache_w = temp_kv_path()?;
            let conn = kv::open(&cache_w)?;
            conn.execute_batch(kv::DATA_SCHEMA)?;
            state.cache_w = Some(cache_w);
            conn
        } else {
            kv::open(&state.cache_r)?
        };

        let (save_tx, save_rx) = bounded::<SaveItem>(num_workers * 10);
        state.save_tx = Some(save_tx);
        state.writer = Some(std::thread::spawn(move || {
            run_store_writer(write_conn, save_rx, log_tx);
        }));
    }

    Ok(state)
}

fn import_document(conn: &Connection, root: &Path, index_name: &str) -> Result<()> {
    let text = fs::read_to_string(atom_file(root, index_name, ""))?;
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare("INSERT OR REPLACE INTO data(key, value) VALUES (?1, ?2)")?;
        parse_atom_document(&text, |key, value| {
            // store under the split-layout key for parity with sidecars
            let full = if key.is_empty() {
                index_name.to_string()
            } else {
                format!("{key}/{index_name}")
            };
            stmt.execute(params![full, value.get().as_bytes()])?;
            Ok(())
        })?;
    }
    tx.commit()?;
    Ok(())
}

/// Dedicated writer: amortises many small saves into transactions that
/// are committed every [`TX_WINDOW`] or at shutdown, whichever is sooner.
fn run_store_writer(conn: Connection, rx: Receiver<SaveItem>, log_tx: Sender<Option<LogEvent>>) {
    let result = (|| -> Result<()> {
        let mut expires: Option<Instant> = None;
        for (key, value) in rx.iter() {
            if expires.is_some_and(|t| Instant::now() >= t) {
                conn.execute_batch("COMMIT")?;
                expires = None;
            }
            if expires.is_none() {
                conn.execute_batch("BEGIN IMMEDIATE")?;
                expires = Some(Instant::now() + TX_WINDOW);
            }
            conn.prepare_cached("INSERT OR REPLACE INTO data(key, value) VALUES (?1, ?2)")?
                .execute(params![key, value])?;
        }
        if expires.is_some() {
            conn.execute_batch("COMMIT")?;
        }
        Ok(())
    })();
    if let Err(e) = result {
        let _ = log_tx.send(Some(LogEvent {
            status: Status::Panic,
            message: format!("indexstore: {e}"),
        }));
    }
}

fn temp_kv_path() -> Result<TempPath> {
    Ok(tempfile::Builder::new()
        .prefix("intact-cache-")
        .suffix(".kv")
        .tempfile()?
        .into_temp_path())
}

/// Write a sidecar index atomically, restoring the directory's mtime so
/// the write does not perturb timestamp-based tooling.
fn save_split(dir: &Path, index_name: &str, value: &[u8]) -> Result<()> {
    let dir_mtime = fs::metadata(dir)
        .ok()
        .map(|md| FileTime::from_last_modification_time(&md));

    let target = dir.join(index_name);
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(value)?;
    tmp.persist(&target).map_err(|e| Error::Io(e.error))?;

    if let Some(mtime) = dir_mtime {
        let _ = filetime::set_file_mtime(dir, mtime);
    }
    Ok(())
}
