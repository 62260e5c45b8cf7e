use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::engine::Context;
use crate::error::{Error, Result};
use crate::hasher::{self, HashAlgo};
use crate::ignore::Ignore;
use crate::status::Status;
use crate::store::IndexStore;

/// Current index blob format version.
pub const INDEX_VERSION: u32 = 2;

/// One tracked file inside a directory index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    #[serde(rename = "mod")]
    pub mtime_ms: i64,
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(rename = "a", default, skip_serializing_if = "Option::is_none")]
    pub algo: Option<HashAlgo>,
    #[serde(rename = "h", default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Pre-v2 entries carried the digest under this key.
    #[serde(rename = "md5", default, skip_serializing_if = "Option::is_none")]
    pub legacy_hash: Option<String>,
}

#[derive(Serialize)]
struct BlobOut<'a> {
    v: u32,
    idx: &'a RawValue,
    idx_hash: &'a str,
    #[serde(rename = "dirlist", skip_serializing_if = "Option::is_none")]
    dirlist: Option<&'a [String]>,
}

/// Accepts both the current form (`v`/`idx`/`idx_hash`) and the legacy
/// whole-file form (`data`).
#[derive(Deserialize)]
struct BlobIn {
    #[serde(default)]
    #[allow(dead_code)]
    v: Option<u32>,
    #[serde(default)]
    idx: Option<Box<RawValue>>,
    #[serde(default)]
    idx_hash: Option<String>,
    #[serde(rename = "dirlist", default)]
    dirlist: Option<Vec<String>>,
    #[serde(default)]
    data: Option<BTreeMap<String, LegacyEntry>>,
}

#[derive(Deserialize)]
struct LegacyEntry {
    #[serde(rename = "mod")]
    mtime_ms: i64,
    md5: String,
}

pub(crate) struct DecodedIndex {
    pub files: BTreeMap<String, FileEntry>,
    pub dirs: Vec<String>,
    /// False when `idx_hash` did not verify against the raw `idx` bytes.
    pub hash_ok: bool,
}

/// Decode an index blob, verifying the self-hash and migrating legacy
/// entries to the current form.
pub(crate) fn decode_index(bytes: &[u8]) -> Result<DecodedIndex> {
    let blob: BlobIn = serde_json::from_slice(bytes)?;

    let mut files;
    let mut hash_ok = true;
    if let Some(idx) = &blob.idx {
        files = serde_json::from_str::<BTreeMap<String, FileEntry>>(idx.get())?;
        hash_ok = blob.idx_hash.as_deref() == Some(hasher::md5_hex(idx.get().as_bytes()).as_str());
        for entry in files.values_mut() {
            if let Some(legacy) = entry.legacy_hash.take() {
                if entry.hash.is_none() {
                    entry.algo = Some(HashAlgo::Md5);
                    entry.hash = Some(legacy);
                }
            }
        }
    } else if let Some(data) = blob.data {
        files = data
            .into_iter()
            .map(|(name, e)| {
                (
                    name,
                    FileEntry {
                        mtime_ms: e.mtime_ms,
                        size: None,
                        algo: Some(HashAlgo::Md5),
                        hash: Some(e.md5),
                        legacy_hash: None,
                    },
                )
            })
            .collect();
    } else {
        files = BTreeMap::new();
    }

    let mut dirs = blob.dirlist.unwrap_or_default();
    dirs.sort();

    Ok(DecodedIndex {
        files,
        dirs,
        hash_ok,
    })
}

fn mtime_ms(md: &fs::Metadata) -> i64 {
    match md.modified().ok().map(|t| t.duration_since(UNIX_EPOCH)) {
        Some(Ok(d)) => d.as_millis() as i64,
        Some(Err(e)) => -(e.duration().as_millis() as i64),
        None => 0,
    }
}

/// The per-directory record driving one hash/reconcile/save cycle.
pub(crate) struct Index<'a> {
    ctx: &'a Context,
    dir: PathBuf,
    files: Vec<String>,
    cur: BTreeMap<String, FileEntry>,
    new: BTreeMap<String, FileEntry>,
    cur_dirs: Vec<String>,
    new_dirs: Vec<String>,
    modified: bool,
    readonly: bool,
}

impl<'a> Index<'a> {
    pub fn new(
        ctx: &'a Context,
        dir: PathBuf,
        files: Vec<String>,
        mut dirs: Vec<String>,
        readonly: bool,
    ) -> Self {
        dirs.sort();
        Index {
            ctx,
            dir,
            files,
            cur: BTreeMap::new(),
            new: BTreeMap::new(),
            cur_dirs: Vec::new(),
            new_dirs: dirs,
            modified: false,
            readonly,
        }
    }

    pub fn index_filepath(&self) -> PathBuf {
        self.dir.join(self.ctx.index_filename())
    }

    fn log_file(&self, status: Status, name: &str) {
        self.ctx
            .log(status, self.dir.join(name).display().to_string());
    }

    fn log_file_error(&self, name: &str, message: &str) {
        self.ctx.log(
            Status::Panic,
            format!("{}: {}", self.dir.join(name).display(), message),
        );
    }

    fn log_dir(&self, status: Status, name: &str) {
        self.ctx
            .log(status, format!("{}/", self.dir.join(name).display()));
    }

    pub fn load(&mut self, store: &IndexStore) -> Result<()> {
        self.modified = false;
        let Some(bytes) = store.load(&self.dir)? else {
            return Ok(());
        };
        let decoded = decode_index(&bytes)?;
        self.cur = decoded.files;
        self.cur_dirs = decoded.dirs;
        if !decoded.hash_ok {
            self.modified = true;
            self.ctx.log(
                Status::IndexDamage,
                self.index_filepath().display().to_string(),
            );
        }
        Ok(())
    }

    fn current_mtime(&self, name: &str) -> i64 {
        fs::metadata(self.dir.join(name))
            .map(|md| mtime_ms(&md))
            .unwrap_or(0)
    }

    fn calc_file(&self, name: &str, algo: HashAlgo) -> Result<FileEntry> {
        let path = self.dir.join(name);
        let md = fs::metadata(&path)?;
        let (hash, _) = hasher::hash_file(&path, algo, |n| self.ctx.perf_bytes(n))?;
        self.ctx.perf_files(1);
        Ok(FileEntry {
            mtime_ms: mtime_ms(&md),
            size: Some(md.len() as i64),
            algo: Some(algo),
            hash: Some(hash),
            legacy_hash: None,
        })
    }

    /// Build the fresh entry set for this directory's file list.
    pub fn compute_hashes(&mut self, ignore: &Ignore) {
        for name in self.files.clone() {
            if ignore.should_ignore(&name) {
                if !self.ctx.is_reserved(&name) {
                    self.log_file(Status::Ignore, &name);
                }
                continue;
            }

            let result = if let Some(prior) = self.cur.get(&name) {
                let algo = prior.algo.unwrap_or(self.ctx.hash_algo);
                if self.ctx.skip_check && prior.mtime_ms == self.current_mtime(&name) {
                    Ok(prior.clone())
                } else {
                    self.calc_file(&name, algo)
                }
            } else if self.readonly {
                // no digest is computed for unknown files in readonly mode
                Ok(FileEntry {
                    mtime_ms: 0,
                    size: None,
                    algo: Some(self.ctx.hash_algo),
                    hash: None,
                    legacy_hash: None,
                })
            } else {
                self.calc_file(&name, self.ctx.hash_algo)
            };

            match result {
                Ok(entry) => {
                    self.new.insert(name, entry);
                }
                Err(e) => self.log_file_error(&name, &e.to_string()),
            }
        }
    }

    pub fn show_ignored_only(&self, ignore: &Ignore) {
        for name in &self.files {
            if ignore.should_ignore(name) {
                self.log_file(Status::Ignore, name);
            }
        }
    }

    /// Compare the fresh entries against the loaded state and emit one
    /// status per file, retaining the prior entry on damage unless forced.
    pub fn reconcile(&mut self, force_update_dmg: bool) {
        let names: Vec<String> = self.new.keys().cloned().collect();
        for name in names {
            let Some(prior) = self.cur.get(&name) else {
                if !(self.ctx.skip_new && !self.ctx.update_index) {
                    self.log_file(Status::New, &name);
                }
                self.modified = true;
                continue;
            };
            let fresh = &self.new[&name];

            if prior.hash.is_some() && fresh.hash.is_some() && prior.hash == fresh.hash {
                self.log_file(Status::Ok, &name);
                if prior.mtime_ms != fresh.mtime_ms {
                    self.modified = true;
                }
                continue;
            }

            if prior.mtime_ms == fresh.mtime_ms {
                self.log_file(Status::Damage, &name);
                if !force_update_dmg {
                    let keep = prior.clone();
                    self.new.insert(name, keep);
                } else {
                    self.modified = true;
                }
            } else if prior.mtime_ms < fresh.mtime_ms {
                self.log_file(Status::Update, &name);
                self.modified = true;
            } else {
                self.log_file(Status::WarnOld, &name);
                self.modified = true;
            }
        }

        // removed files
        let deleted: Vec<String> = self
            .cur
            .keys()
            .filter(|name| !self.new.contains_key(*name))
            .cloned()
            .collect();
        for name in deleted {
            self.modified = true;
            if self.ctx.log_deleted {
                self.log_file(Status::Deleted, &name);
            }
        }

        // removed or added subdirectories
        if self.ctx.track_directories {
            for name in &self.cur_dirs {
                if !self.new_dirs.contains(name) {
                    self.modified = true;
                    if self.ctx.log_deleted {
                        self.log_dir(Status::Deleted, name);
                    }
                }
            }
            if self.new_dirs.len() != self.cur_dirs.len() {
                self.modified = true;
            }
        }
    }

    /// Serialise and persist when modified (always when `force` is set).
    /// Returns whether the directory had actual changes.
    pub fn save(&mut self, store: &IndexStore, force: bool) -> Result<bool> {
        let had_changes = self.modified;
        if !had_changes && !force {
            return Ok(false);
        }
        if self.readonly {
            return Err(Error::Store("tried to save a readonly index".to_string()));
        }

        let idx = serde_json::to_string(&self.new)?;
        let idx_hash = hasher::md5_hex(idx.as_bytes());
        let raw = RawValue::from_string(idx)?;
        let blob = BlobOut {
            v: INDEX_VERSION,
            idx: &raw,
            idx_hash: &idx_hash,
            dirlist: self
                .ctx
                .track_directories
                .then_some(self.new_dirs.as_slice()),
        };
        store.save(&self.dir, serde_json::to_vec(&blob)?)?;
        self.modified = false;
        Ok(had_changes)
    }
}
