use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::extents::{self, extents_match, Extent};
use crate::index;
use crate::status::{DedupPerfEvent, LogEvent, Status};
use crate::store::{self, parse_atom_document};

/// On-disk suffix of the duplicate-group database relative to the index
/// filename.
pub const DEDUP_FILE_SUFFIX: &str = "-dedup.db";

/// One member of a duplicate group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupItem {
    pub path: String,
    pub merged: bool,
}

/// Persisted duplicate-group record, keyed by digest in the `item` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BagRecord {
    gen: u64,
    size: i64,
    #[serde(rename = "shared")]
    size_shared: u64,
    #[serde(rename = "exclusive")]
    size_exclusive: u64,
    #[serde(rename = "extUnknown", default, skip_serializing_if = "Option::is_none")]
    ext_unknown: Option<bool>,
    #[serde(rename = "item")]
    items: Vec<DedupItem>,
}

/// A duplicate group as handed to callers of [`Dedup::show`].
#[derive(Debug, Clone, Serialize)]
pub struct DedupBag {
    pub hash: String,
    pub size: u64,
    #[serde(rename = "shared")]
    pub size_shared: u64,
    #[serde(rename = "exclusive")]
    pub size_exclusive: u64,
    #[serde(rename = "extUnknown", skip_serializing_if = "Option::is_none")]
    pub ext_unknown: Option<bool>,
    #[serde(rename = "item")]
    pub items: Vec<DedupItem>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DedupStatus {
    gen: u64,
    #[serde(rename = "mod", default)]
    updated: String,
}

struct BagBuild {
    size: i64,
    items: Vec<DedupItem>,
}

/// Block-level deduplication driver over an atom store: detects duplicate
/// groups from the persisted digests, classifies members by extent map,
/// and merges groups through the kernel same-extents op.
pub struct Dedup {
    root: PathBuf,
    index_name: String,
    conn: Connection,
    status: DedupStatus,

    log_tx: Sender<Option<LogEvent>>,
    log_rx: Receiver<Option<LogEvent>>,
    perf_tx: Sender<DedupPerfEvent>,
    perf_rx: Receiver<DedupPerfEvent>,

    abort: Arc<AtomicBool>,
    num_total: Arc<AtomicI64>,
    reclaimed_total: Arc<AtomicU64>,
}

impl Dedup {
    /// Open (or, for a detect pass, create) the duplicate-group database
    /// at the atom root.
    pub fn new(root: &Path, index_name: &str, create_if_missing: bool) -> Result<Dedup> {
        let file = root.join(format!("{index_name}{DEDUP_FILE_SUFFIX}"));
        if !file.exists() && !create_if_missing {
            return Err(Error::Store(format!(
                "no dedup state at {} (run 'dedup detect' first)",
                file.display()
            )));
        }

        let conn = Connection::open(&file)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             CREATE TABLE IF NOT EXISTS status(key INTEGER PRIMARY KEY, value BLOB NOT NULL);
             CREATE TABLE IF NOT EXISTS item(key TEXT PRIMARY KEY, value BLOB NOT NULL);",
        )?;

        let status = conn
            .query_row("SELECT value FROM status WHERE key = 1", [], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?
            .map(|bytes| serde_json::from_slice(&bytes))
            .transpose()?
            .unwrap_or_default();

        let (log_tx, log_rx) = bounded(100);
        let (perf_tx, perf_rx) = bounded(100);

        Ok(Dedup {
            root: root.to_path_buf(),
            index_name: index_name.to_string(),
            conn,
            status,
            log_tx,
            log_rx,
            perf_tx,
            perf_rx,
            abort: Arc::new(AtomicBool::new(false)),
            num_total: Arc::new(AtomicI64::new(0)),
            reclaimed_total: Arc::new(AtomicU64::new(0)),
        })
    }

    /// The event stream of detect/run passes; close it with
    /// [`Dedup::close_log`] once the pass returns.
    pub fn log_events(&self) -> Receiver<Option<LogEvent>> {
        self.log_rx.clone()
    }

    pub fn perf_events(&self) -> Receiver<DedupPerfEvent> {
        self.perf_rx.clone()
    }

    pub fn close_log(&self) {
        let _ = self.log_tx.send(None);
    }

    /// Shared flag for cancelling a pass from another thread.
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    pub fn num_total(&self) -> i64 {
        self.num_total.load(Ordering::Relaxed)
    }

    pub fn reclaimed_total(&self) -> u64 {
        self.reclaimed_total.load(Ordering::Relaxed)
    }

    pub fn last_updated(&self) -> &str {
        &self.status.updated
    }

    pub fn generation(&self) -> u64 {
        self.status.gen
    }

    pub fn finish(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| Error::Database(e))
    }

    fn log(&self, status: Status, message: String) {
        let _ = self.log_tx.send(Some(LogEvent { status, message }));
    }

    fn log_msg(&self, message: String) {
        self.log(Status::Info, message);
    }

    fn perf(&self, files: i64, position: f64, total: usize) {
        self.num_total.fetch_add(files, Ordering::Relaxed);
        let percent = if total > 0 {
            position / total as f64
        } else {
            0.0
        };
        let _ = self.perf_tx.send(DedupPerfEvent { files, percent });
    }

    /// Scan the atom document for files sharing a digest, classify each
    /// group's members by extent map, and persist the groups under a new
    /// generation. Groups untouched by this pass are swept afterwards.
    pub fn detect(&mut self, min_size: u64) -> Result<()> {
        let text = fs::read_to_string(store::atom_file(&self.root, &self.index_name, ""))?;

        self.log_msg(format!("collect matching hashes (min={min_size} bytes)"));
        let mut all: HashMap<String, BagBuild> = HashMap::new();
        parse_atom_document(&text, |key, value| {
            if self.aborted() {
                return Err(Error::Aborted);
            }
            let decoded = index::decode_index(value.get().as_bytes())?;
            let prefix = if key.is_empty() {
                String::new()
            } else {
                format!("{key}/")
            };
            for (name, entry) in decoded.files {
                let Some(hash) = entry.hash else { continue };
                if let Some(size) = entry.size {
                    if size >= 0 && (size as u64) < min_size {
                        continue;
                    }
                }
                let bag = all.entry(hash).or_insert_with(|| BagBuild {
                    size: -1,
                    items: Vec::new(),
                });
                if bag.size < 0 {
                    if let Some(size) = entry.size {
                        if size >= 0 {
                            bag.size = size;
                        }
                    }
                }
                bag.items.push(DedupItem {
                    path: format!("{prefix}{name}"),
                    merged: false,
                });
            }
            Ok(())
        })?;

        // legacy index entries carry no size; resolve by stat on first sight
        self.log_msg("resolve file sizes for legacy entries".to_string());
        all.retain(|_, bag| {
            if bag.size < 0 {
                for item in &bag.items {
                    if let Ok(md) = fs::metadata(self.root.join(&item.path)) {
                        bag.size = md.len() as i64;
                        break;
                    }
                }
            }
            bag.size >= 0 && bag.size as u64 >= min_size
        });

        let next = DedupStatus {
            gen: self.status.gen + 1,
            updated: chrono::Utc::now().to_rfc3339(),
        };

        self.log_msg("collect matching files".to_string());
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO status(key, value) VALUES (1, ?1)",
            params![serde_json::to_vec(&next)?],
        )?;

        let total = all.len();
        let mut position = 0usize;
        self.perf(0, 0.0, total);
        for (hash, bag) in all {
            position += 1;
            if self.aborted() {
                return Err(Error::Aborted);
            }
            if bag.items.len() <= 1 {
                continue;
            }
            self.perf(bag.items.len() as i64, position as f64, total);

            let record = self.classify_group(bag, next.gen);
            if record.items.len() < 2 {
                // surviving members are too few to share anything
                tx.execute("DELETE FROM item WHERE key = ?1", params![hash])?;
                continue;
            }
            tx.execute(
                "INSERT OR REPLACE INTO item(key, value) VALUES (?1, ?2)",
                params![hash, serde_json::to_vec(&record)?],
            )?;
        }

        // sweep groups not touched by this pass
        let stale: Vec<String> = {
            let mut stmt = tx.prepare("SELECT key, value FROM item")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            let mut stale = Vec::new();
            for row in rows {
                let (key, value) = row?;
                let record: BagRecord = serde_json::from_slice(&value)?;
                if record.gen != next.gen {
                    stale.push(key);
                }
            }
            stale
        };
        for key in stale {
            tx.execute("DELETE FROM item WHERE key = ?1", params![key])?;
        }

        tx.commit()?;
        self.status = next;
        debug!("detect complete: generation {}", self.status.gen);
        Ok(())
    }

    /// Partition a group's members into equivalence classes of identical
    /// extent maps; the largest class is considered merged.
    fn classify_group(&self, bag: BagBuild, gen: u64) -> BagRecord {
        struct Candidate {
            class: i64,
            extents: Option<Vec<Extent>>,
            item: DedupItem,
        }

        let mut ext_unknown = false;
        let mut candidates: Vec<Candidate> = Vec::with_capacity(bag.items.len());
        for item in bag.items {
            match extents::file_extents(&self.root.join(&item.path)) {
                Ok(extents) => candidates.push(Candidate {
                    class: -1,
                    extents: Some(extents),
                    item,
                }),
                Err(e) if e.is_unsupported() => {
                    ext_unknown = true;
                    candidates.push(Candidate {
                        class: -1,
                        extents: None,
                        item,
                    });
                }
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => self.log(Status::Panic, e.to_string()),
            }
        }

        // class ids by first occurrence; unknown maps never join a class
        for i in 0..candidates.len() {
            if candidates[i].class != -1 {
                continue;
            }
            candidates[i].class = i as i64;
            for j in (i + 1)..candidates.len() {
                let same = match (&candidates[i].extents, &candidates[j].extents) {
                    (Some(a), Some(b)) => extents_match(a, b),
                    _ => false,
                };
                if candidates[j].class == -1 && same {
                    candidates[j].class = i as i64;
                }
            }
        }

        let mut counts: HashMap<i64, usize> = HashMap::new();
        for c in &candidates {
            *counts.entry(c.class).or_default() += 1;
        }
        let mut merged_class = -1i64;
        let mut merged_count = 1usize;
        for (&class, &count) in &counts {
            if count > merged_count {
                merged_class = class;
                merged_count = count;
            }
        }

        let size = bag.size.max(0) as u64;
        let mut record = BagRecord {
            gen,
            size: bag.size,
            size_shared: 0,
            size_exclusive: 0,
            ext_unknown: ext_unknown.then_some(true),
            items: Vec::with_capacity(candidates.len()),
        };
        for (i, mut c) in candidates.into_iter().enumerate() {
            let merged = c.class == merged_class;
            c.item.merged = merged;
            if merged {
                record.size_shared += size;
            }
            if c.class == i as i64 {
                record.size_exclusive += size;
            }
            record.items.push(c.item);
        }
        record
    }

    /// All persisted duplicate groups, largest first.
    pub fn show(&self) -> Result<Vec<DedupBag>> {
        let mut stmt = self.conn.prepare("SELECT key, value FROM item")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut list = Vec::new();
        for row in rows {
            let (hash, value) = row?;
            let record: BagRecord = serde_json::from_slice(&value)?;
            list.push(DedupBag {
                hash,
                size: record.size.max(0) as u64,
                size_shared: record.size_shared,
                size_exclusive: record.size_exclusive,
                ext_unknown: record.ext_unknown,
                items: record.items,
            });
        }
        list.sort_by(|a, b| b.size.cmp(&a.size));
        Ok(list)
    }

    /// Physically merge groups through the kernel same-extents op. With no
    /// explicit `hashes`, every known group is processed.
    pub fn run(&mut self, hashes: &[String], verbose: bool) -> Result<()> {
        let hashes: Vec<String> = if hashes.is_empty() {
            self.show()?.into_iter().map(|bag| bag.hash).collect()
        } else {
            hashes.to_vec()
        };

        let tx = self.conn.unchecked_transaction()?;
        let total = hashes.len();
        let mut done = 0usize;
        self.perf(0, 0.0, total);

        for hash in &hashes {
            if self.aborted() {
                return Err(Error::Aborted);
            }

            let value: Vec<u8> = tx
                .query_row("SELECT value FROM item WHERE key = ?1", params![hash], |r| {
                    r.get(0)
                })
                .optional()?
                .ok_or_else(|| Error::Store(format!("unknown hash {hash}")))?;
            let mut bag: BagRecord = serde_json::from_slice(&value)?;
            let size = bag.size.max(0) as u64;

            // merged members sort first and member 0 becomes the source
            bag.items.sort_by_key(|item| !item.merged);
            let todo = bag.items.iter().skip(1).filter(|i| !i.merged).count();
            let mut group_done = 0f64;

            for i in 1..bag.items.len() {
                if self.aborted() {
                    return Err(Error::Aborted);
                }
                if bag.items[i].merged {
                    continue;
                }

                let src = self.root.join(&bag.items[0].path);
                let dest = self.root.join(&bag.items[i].path);
                if verbose {
                    self.log_msg(format!(
                        "dedup {hash} {size} \"{}\" -- \"{}\"",
                        src.display(),
                        dest.display()
                    ));
                } else {
                    self.log_msg(format!("dedup {size} {}", src.display()));
                }

                match extents::deduplicate_files(&src, &dest) {
                    Ok(reclaimed) => {
                        if !bag.items[0].merged {
                            bag.size_shared += size;
                        }
                        bag.items[0].merged = true;
                        bag.items[i].merged = true;
                        bag.size_shared += size;
                        bag.size_exclusive = bag.size_exclusive.saturating_sub(size);
                        self.reclaimed_total.fetch_add(reclaimed, Ordering::Relaxed);
                    }
                    Err(e) if e.is_unsupported() => {
                        self.log(
                            Status::Panic,
                            "deduplicate is not supported on this platform/filesystem".to_string(),
                        );
                        return Err(e);
                    }
                    Err(e) => self.log(Status::Panic, e.to_string()),
                }

                group_done += 1.0;
                let position = done as f64 + group_done / todo.max(1) as f64;
                self.perf(1, position, total);
            }
            done += 1;

            tx.execute(
                "INSERT OR REPLACE INTO item(key, value) VALUES (?1, ?2)",
                params![hash, serde_json::to_vec(&bag)?],
            )?;
        }

        self.perf(0, done as f64, total);
        tx.commit()?;
        Ok(())
    }
}
