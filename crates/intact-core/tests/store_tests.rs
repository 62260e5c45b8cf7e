use std::fs;
use std::path::{Path, PathBuf};

use crossbeam_channel::bounded;
use intact_core::store::atom_file;
use intact_core::{fuse_store, initialize, locate, IndexStore, StoreKind, StoreSetup};
use serde_json::Value;

const INDEX: &str = ".intact";

fn open_store(root: &Path, read_only: bool, refresh: bool) -> IndexStore {
    let (log_tx, _log_rx) = bounded(100);
    IndexStore::open(
        StoreSetup::Atom {
            root: root.to_path_buf(),
            refresh,
        },
        INDEX,
        read_only,
        2,
        log_tx,
    )
    .unwrap()
}

fn data_of(doc_path: &Path) -> serde_json::Map<String, Value> {
    let value: Value = serde_json::from_str(&fs::read_to_string(doc_path).unwrap()).unwrap();
    value["data"].as_object().unwrap().clone()
}

fn canonical_root(dir: &tempfile::TempDir) -> PathBuf {
    fs::canonicalize(dir.path()).unwrap()
}

#[test]
fn init_creates_markers_and_respects_force() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical_root(&dir);

    initialize(StoreKind::Split, &root, INDEX, false).unwrap();
    assert_eq!(fs::read_to_string(root.join(INDEX)).unwrap(), "{}");
    assert!(initialize(StoreKind::Split, &root, INDEX, false).is_err());
    initialize(StoreKind::Split, &root, INDEX, true).unwrap();

    initialize(StoreKind::Atom, &root, INDEX, false).unwrap();
    assert_eq!(
        fs::read_to_string(atom_file(&root, INDEX, "")).unwrap(),
        r#"{"type":"chkbit","version":6,"data":{}}"#
    );
}

#[test]
fn locate_walks_up_and_prefers_atom() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical_root(&dir);
    let nested = root.join("a/b/c");
    fs::create_dir_all(&nested).unwrap();

    assert!(locate(&nested, None, INDEX).is_err());

    initialize(StoreKind::Split, &root, INDEX, false).unwrap();
    let (kind, found) = locate(&nested, None, INDEX).unwrap();
    assert_eq!(kind, StoreKind::Split);
    assert_eq!(found, root);

    // atom marker in the same directory wins
    initialize(StoreKind::Atom, &root, INDEX, false).unwrap();
    let (kind, found) = locate(&nested, None, INDEX).unwrap();
    assert_eq!(kind, StoreKind::Atom);
    assert_eq!(found, root);

    // the filter restricts the marker kind
    let (kind, _) = locate(&nested, Some(StoreKind::Split), INDEX).unwrap();
    assert_eq!(kind, StoreKind::Split);
}

#[test]
fn split_save_is_atomic_and_preserves_directory_mtime() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical_root(&dir);
    let sub = root.join("sub");
    fs::create_dir(&sub).unwrap();

    let old = filetime::FileTime::from_unix_time(1_500_000_000, 0);
    filetime::set_file_mtime(&sub, old).unwrap();

    let (log_tx, _log_rx) = bounded(100);
    let store = IndexStore::open(StoreSetup::Split, INDEX, false, 2, log_tx).unwrap();
    store.save(&sub, b"{\"v\":2}".to_vec()).unwrap();

    assert_eq!(fs::read(sub.join(INDEX)).unwrap(), b"{\"v\":2}");
    let md = fs::metadata(&sub).unwrap();
    assert_eq!(filetime::FileTime::from_last_modification_time(&md), old);

    assert!(!store.finish(false).unwrap());
}

#[test]
fn split_load_missing_index_is_none() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical_root(&dir);
    let (log_tx, _log_rx) = bounded(100);
    let store = IndexStore::open(StoreSetup::Split, INDEX, true, 2, log_tx).unwrap();
    assert!(store.load(&root).unwrap().is_none());
}

#[test]
fn atom_import_export_identity() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical_root(&dir);
    let doc = r#"{"type":"chkbit","version":6,"data":{"":{"v":2},"a":{"x":[1,2]},"z/x":{"y":"s"}}}"#;
    fs::write(atom_file(&root, INDEX, ""), doc).unwrap();

    let store = open_store(&root, false, false);
    assert!(store.load(&root.join("a")).unwrap().is_some());
    // re-save one key with identical bytes so the export runs
    store
        .save(&root.join("a"), b"{\"x\":[1,2]}".to_vec())
        .unwrap();
    assert!(store.finish(false).unwrap());

    let exported = fs::read_to_string(atom_file(&root, INDEX, "")).unwrap();
    assert_eq!(exported, doc);
    // the previous document moved to .bak
    assert_eq!(
        fs::read_to_string(atom_file(&root, INDEX, ".bak")).unwrap(),
        doc
    );
}

#[test]
fn atom_load_returns_imported_blobs() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical_root(&dir);
    let doc = r#"{"type":"chkbit","version":6,"data":{"":{"v":2},"deep/sub":{"v":2,"idx":{}}}}"#;
    fs::write(atom_file(&root, INDEX, ""), doc).unwrap();

    let store = open_store(&root, true, false);
    assert_eq!(store.load(&root).unwrap().unwrap(), b"{\"v\":2}");
    assert_eq!(
        store.load(&root.join("deep/sub")).unwrap().unwrap(),
        b"{\"v\":2,\"idx\":{}}"
    );
    assert!(store.load(&root.join("missing")).unwrap().is_none());
    assert!(!store.finish(false).unwrap());
}

#[test]
fn atom_save_updates_the_document() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical_root(&dir);
    initialize(StoreKind::Atom, &root, INDEX, false).unwrap();

    let store = open_store(&root, false, false);
    store.save(&root, b"{\"v\":2}".to_vec()).unwrap();
    store.save(&root.join("sub"), b"{\"v\":3}".to_vec()).unwrap();
    assert!(store.finish(false).unwrap());

    let data = data_of(&atom_file(&root, INDEX, ""));
    assert_eq!(data.len(), 2);
    assert_eq!(data[""]["v"], 2);
    assert_eq!(data["sub"]["v"], 3);
}

#[test]
fn aborted_finish_discards_pending_changes() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical_root(&dir);
    let doc = r#"{"type":"chkbit","version":6,"data":{"":{"v":2}}}"#;
    fs::write(atom_file(&root, INDEX, ""), doc).unwrap();

    let store = open_store(&root, false, false);
    store.save(&root, b"{\"v\":99}".to_vec()).unwrap();
    assert!(!store.finish(true).unwrap());

    assert_eq!(fs::read_to_string(atom_file(&root, INDEX, "")).unwrap(), doc);
    assert!(!atom_file(&root, INDEX, ".bak").exists());
}

#[test]
fn refresh_rewrites_from_scratch() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical_root(&dir);
    let doc = r#"{"type":"chkbit","version":6,"data":{"":{"v":2},"stale":{"v":2}}}"#;
    fs::write(atom_file(&root, INDEX, ""), doc).unwrap();

    let store = open_store(&root, false, true);
    assert!(store.is_refresh());
    // prior blobs stay readable during the run
    assert!(store.load(&root.join("stale")).unwrap().is_some());
    store.save(&root, b"{\"v\":2}".to_vec()).unwrap();
    assert!(store.finish(false).unwrap());

    // only the keys written during this run survive the rewrite
    let data = data_of(&atom_file(&root, INDEX, ""));
    assert_eq!(data.len(), 1);
    assert!(data.contains_key(""));
}

#[test]
fn import_rejects_malformed_documents() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical_root(&dir);
    fs::write(
        atom_file(&root, INDEX, ""),
        r#"{"version":6,"type":"chkbit","data":{}}"#,
    )
    .unwrap();

    let (log_tx, _log_rx) = bounded(100);
    let result = IndexStore::open(
        StoreSetup::Atom {
            root: root.clone(),
            refresh: false,
        },
        INDEX,
        true,
        2,
        log_tx,
    );
    assert!(result.is_err());
}

#[test]
fn fuse_collects_split_and_nested_atom_indexes() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical_root(&dir);
    initialize(StoreKind::Atom, &root, INDEX, false).unwrap();

    // a split index one level down
    let idx = "{}";
    let split_blob = format!(
        r#"{{"v":2,"idx":{idx},"idx_hash":"{}"}}"#,
        "99914b932bd37a50b983c5e7c90ae93b"
    );
    let split_dir = root.join("legacy");
    fs::create_dir(&split_dir).unwrap();
    fs::write(split_dir.join(INDEX), &split_blob).unwrap();

    // a nested atom store two levels down
    let nested = root.join("archive");
    fs::create_dir(&nested).unwrap();
    let nested_doc = format!(
        r#"{{"type":"chkbit","version":6,"data":{{"":{split_blob},"inner":{split_blob}}}}}"#
    );
    fs::write(atom_file(&nested, INDEX, ""), nested_doc).unwrap();

    let mut lines = Vec::new();
    let count = fuse_store(&root, INDEX, false, false, |line| {
        lines.push(line.to_string())
    })
    .unwrap();
    assert_eq!(count, 3);
    assert!(lines.iter().any(|l| l.contains("fused 3 indexes")));

    let data = data_of(&atom_file(&root, INDEX, ""));
    let mut keys: Vec<&str> = data.keys().map(|k| k.as_str()).collect();
    keys.sort();
    assert_eq!(keys, vec!["archive", "archive/inner", "legacy"]);

    // sources are left in place
    assert!(split_dir.join(INDEX).exists());
    assert!(atom_file(&nested, INDEX, "").exists());
}

#[test]
fn fuse_requires_an_atom_store_at_the_root() {
    let dir = tempfile::tempdir().unwrap();
    let root = canonical_root(&dir);
    let result = fuse_store(&root, INDEX, false, false, |_| {});
    assert!(result.is_err());
}
