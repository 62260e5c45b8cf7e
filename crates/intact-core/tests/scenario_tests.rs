use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use filetime::FileTime;
use intact_core::store::atom_file;
use intact_core::{initialize, Context, HashAlgo, LogEvent, RunCounters, Status, StoreKind};
use serde_json::Value;

const INDEX: &str = ".intact";
const IGNORE: &str = ".intactignore";

fn new_context(update: bool) -> Context {
    let mut ctx = Context::new(2, HashAlgo::Blake3, INDEX, IGNORE).unwrap();
    ctx.update_index = update;
    ctx
}

/// Run a pass with concurrent log/perf drains so bounded channels never
/// stall the workers.
fn run(ctx: Context, paths: &[PathBuf]) -> (RunCounters, Vec<LogEvent>) {
    let log_rx = ctx.log_events();
    let perf_rx = ctx.perf_events();
    let log_drain = thread::spawn(move || {
        let mut events = Vec::new();
        while let Ok(Some(event)) = log_rx.recv() {
            events.push(event);
        }
        events
    });
    let perf_drain = thread::spawn(move || while perf_rx.recv().is_ok() {});

    let counters = ctx.process(paths);
    let events = log_drain.join().unwrap();
    drop(ctx);
    perf_drain.join().unwrap();
    (counters, events)
}

fn statuses(events: &[LogEvent], status: Status) -> Vec<String> {
    events
        .iter()
        .filter(|e| e.status == status)
        .map(|e| e.message.clone())
        .collect()
}

fn set_mtime(path: &Path, unix_secs: i64) {
    filetime::set_file_mtime(path, FileTime::from_unix_time(unix_secs, 0)).unwrap();
}

fn stored_entry(dir: &Path, name: &str) -> Value {
    let blob: Value = serde_json::from_slice(&fs::read(dir.join(INDEX)).unwrap()).unwrap();
    blob["idx"][name].clone()
}

fn blake3_of(path: &Path) -> String {
    intact_core::hasher::hash_file(path, HashAlgo::Blake3, |_| {})
        .unwrap()
        .0
}

// 2022-02-01 11:00/12:00/13:00 UTC
const T11: i64 = 1_643_713_200;
const T12: i64 = 1_643_716_800;
const T13: i64 = 1_643_720_400;

#[test]
fn update_lifecycle_new_old_upd_dmg() {
    let tmp = tempfile::tempdir().unwrap();
    let root = fs::canonicalize(tmp.path()).unwrap();
    let file = root.join("test.txt");

    // 1. a new file is added to the index
    fs::write(&file, "foo1").unwrap();
    set_mtime(&file, T12);
    let (counters, events) = run(new_context(true), &[root.clone()]);
    assert_eq!(counters.new, 1);
    assert_eq!(statuses(&events, Status::New).len(), 1);
    assert!(statuses(&events, Status::New)[0].ends_with("test.txt"));
    let entry = stored_entry(&root, "test.txt");
    assert_eq!(entry["mod"], 1_643_716_800_000i64);
    assert_eq!(entry["a"], "blake3");
    assert_eq!(entry["h"].as_str().unwrap(), blake3_of(&file));
    assert!(!counters.failed());

    // 2. replaced by content with an older mtime: warned but updated
    fs::write(&file, "foo2").unwrap();
    set_mtime(&file, T11);
    let (counters, events) = run(new_context(true), &[root.clone()]);
    assert_eq!(counters.updated, 1);
    assert_eq!(statuses(&events, Status::WarnOld).len(), 1);
    let entry = stored_entry(&root, "test.txt");
    assert_eq!(entry["mod"], 1_643_713_200_000i64);
    assert_eq!(entry["h"].as_str().unwrap(), blake3_of(&file));

    // 3. a normal content update
    fs::write(&file, "foo3").unwrap();
    set_mtime(&file, T13);
    let (counters, events) = run(new_context(true), &[root.clone()]);
    assert_eq!(counters.updated, 1);
    assert_eq!(statuses(&events, Status::Update).len(), 1);
    let foo3_hash = blake3_of(&file);
    assert_eq!(
        stored_entry(&root, "test.txt")["h"].as_str().unwrap(),
        foo3_hash
    );

    // 4. content changed under an unchanged mtime: damage, prior entry kept
    fs::write(&file, "foo4").unwrap();
    set_mtime(&file, T13);
    let (counters, events) = run(new_context(true), &[root.clone()]);
    assert_eq!(counters.damaged, 1);
    assert!(counters.failed());
    assert_eq!(statuses(&events, Status::Damage).len(), 1);
    assert_eq!(
        stored_entry(&root, "test.txt")["h"].as_str().unwrap(),
        foo3_hash,
        "the damaged file's stored digest must stay at the pre-damage value"
    );
}

#[test]
fn forced_damage_update_overwrites_the_entry() {
    let tmp = tempfile::tempdir().unwrap();
    let root = fs::canonicalize(tmp.path()).unwrap();
    let file = root.join("data.txt");

    fs::write(&file, "first").unwrap();
    set_mtime(&file, T12);
    run(new_context(true), &[root.clone()]);

    fs::write(&file, "corrupt").unwrap();
    set_mtime(&file, T12);
    let mut ctx = new_context(true);
    ctx.force_update_dmg = true;
    let (counters, events) = run(ctx, &[root.clone()]);
    assert_eq!(counters.damaged, 1);
    assert_eq!(statuses(&events, Status::Damage).len(), 1);
    assert_eq!(
        stored_entry(&root, "data.txt")["h"].as_str().unwrap(),
        blake3_of(&file)
    );
}

fn build_tree(root: &Path) {
    for dir in [
        "thing/change",
        "thing/keep",
        "time/hour/minute",
        "plain",
    ] {
        fs::create_dir_all(root.join(dir)).unwrap();
    }
    fs::write(root.join("thing/change/one.txt"), "one").unwrap();
    fs::write(root.join("thing/change/two.txt"), "two").unwrap();
    fs::write(root.join("thing/keep/three.txt"), "three").unwrap();
    fs::write(
        root.join("time/hour/minute/body-information.csv"),
        "a,b,c\n1,2,3\n",
    )
    .unwrap();
    fs::write(root.join("time/hour/minute/head-information.csv"), "x,y\n").unwrap();
    fs::write(root.join("plain/readme.md"), "hello").unwrap();
}

#[test]
fn deleted_files_and_directories_are_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let root = fs::canonicalize(tmp.path()).unwrap();
    build_tree(&root);

    let (counters, _) = run(new_context(true), &[root.clone()]);
    assert!(counters.new >= 6);

    fs::remove_dir_all(root.join("thing/change")).unwrap();
    fs::remove_file(root.join("time/hour/minute/body-information.csv")).unwrap();

    // a readonly check reports what would be removed
    let mut ctx = new_context(false);
    ctx.log_deleted = true;
    let (counters, events) = run(ctx, &[root.clone()]);
    assert_eq!(counters.deleted, 2);
    let deleted = statuses(&events, Status::Deleted);
    assert!(deleted.iter().any(|m| m.ends_with("thing/change/")), "{deleted:?}");
    assert!(
        deleted.iter().any(|m| m.ends_with("body-information.csv")),
        "{deleted:?}"
    );

    // an update applies the removals
    let mut ctx = new_context(true);
    ctx.log_deleted = true;
    let (counters, _) = run(ctx, &[root.clone()]);
    assert_eq!(counters.deleted, 2);

    // afterwards nothing is missing
    let mut ctx = new_context(false);
    ctx.log_deleted = true;
    let (counters, _) = run(ctx, &[root.clone()]);
    assert_eq!(counters.deleted, 0);
    assert_eq!(counters.new + counters.updated, 0);
}

#[test]
fn check_mode_reports_but_does_not_write() {
    let tmp = tempfile::tempdir().unwrap();
    let root = fs::canonicalize(tmp.path()).unwrap();
    fs::write(root.join("fresh.txt"), "fresh").unwrap();

    let (counters, events) = run(new_context(false), &[root.clone()]);
    assert_eq!(counters.new, 1);
    assert_eq!(statuses(&events, Status::New).len(), 1);
    assert!(!root.join(INDEX).exists());

    // --skip-new drops both the event and the counter in check mode
    let mut ctx = new_context(false);
    ctx.skip_new = true;
    let (counters, events) = run(ctx, &[root.clone()]);
    assert_eq!(counters.new, 0);
    assert!(statuses(&events, Status::New).is_empty());
    // skip-new never applies to updates
    let mut ctx = new_context(true);
    ctx.skip_new = true;
    let (counters, _) = run(ctx, &[root.clone()]);
    assert_eq!(counters.new, 1);
}

#[test]
fn skip_check_update_hashes_only_changed_files() {
    let tmp = tempfile::tempdir().unwrap();
    let root = fs::canonicalize(tmp.path()).unwrap();
    let steady = root.join("steady.txt");
    let moving = root.join("moving.txt");
    fs::write(&steady, "steady").unwrap();
    set_mtime(&steady, T12);
    fs::write(&moving, "moving-1").unwrap();
    set_mtime(&moving, T12);
    run(new_context(true), &[root.clone()]);

    fs::write(&moving, "moving-2").unwrap();
    set_mtime(&moving, T13);
    let mut ctx = new_context(true);
    ctx.skip_check = true;
    let (counters, events) = run(ctx, &[root.clone()]);
    // unchanged files are reused without counting toward the total
    assert_eq!(counters.updated, 1);
    assert_eq!(counters.total, 1);
    assert_eq!(statuses(&events, Status::Update).len(), 1);
}

#[test]
fn ignored_names_are_skipped_and_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let root = fs::canonicalize(tmp.path()).unwrap();
    fs::create_dir(root.join("skipdir")).unwrap();
    fs::write(root.join("skipdir/inside.txt"), "x").unwrap();
    fs::write(root.join("kept.txt"), "y").unwrap();
    fs::write(root.join("dropped.tmp"), "z").unwrap();
    fs::write(root.join(IGNORE), "*.tmp\nskipdir\n").unwrap();

    let (counters, events) = run(new_context(true), &[root.clone()]);
    assert_eq!(counters.new, 1);
    let ignored = statuses(&events, Status::Ignore);
    assert!(ignored.iter().any(|m| m.ends_with("dropped.tmp")), "{ignored:?}");
    assert!(ignored.iter().any(|m| m == "skipdir/"), "{ignored:?}");
    // the ignored directory was never entered
    assert!(!root.join("skipdir").join(INDEX).exists());
}

#[test]
fn index_damage_is_flagged_and_rewritten() {
    let tmp = tempfile::tempdir().unwrap();
    let root = fs::canonicalize(tmp.path()).unwrap();
    fs::write(root.join("file.txt"), "payload").unwrap();
    run(new_context(true), &[root.clone()]);

    // tamper with the stored entries without fixing the self-hash
    let text = fs::read_to_string(root.join(INDEX)).unwrap();
    let tampered = text.replace("file.txt", "evil.txt");
    assert_ne!(text, tampered);
    fs::write(root.join(INDEX), tampered).unwrap();

    let (counters, events) = run(new_context(true), &[root.clone()]);
    assert_eq!(statuses(&events, Status::IndexDamage).len(), 1);
    // the rewrite restores a verifiable index
    assert!(counters.index_saved >= 1);
    let (_, events) = run(new_context(true), &[root.clone()]);
    assert!(statuses(&events, Status::IndexDamage).is_empty());
}

#[test]
fn atom_update_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let root = fs::canonicalize(tmp.path()).unwrap();
    build_tree(&root);
    initialize(StoreKind::Atom, &root, INDEX, false).unwrap();

    let ctx = new_context(true);
    ctx.use_atom_store(&root, &[root.clone()]).unwrap();
    let (counters, events) = run(ctx, &[root.clone()]);
    assert!(counters.new >= 6);
    assert!(events
        .iter()
        .any(|e| e.status == Status::Info && e.message.contains("index db was updated")));

    // the document's keys enumerate every directory under the root
    let doc: Value =
        serde_json::from_str(&fs::read_to_string(atom_file(&root, INDEX, "")).unwrap()).unwrap();
    assert_eq!(doc["type"], "chkbit");
    assert_eq!(doc["version"], 6);
    let mut keys: Vec<String> = doc["data"].as_object().unwrap().keys().cloned().collect();
    keys.sort();
    let mut expected: Vec<String> = [
        "",
        "plain",
        "thing",
        "thing/change",
        "thing/keep",
        "time",
        "time/hour",
        "time/hour/minute",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    expected.sort();
    assert_eq!(keys, expected);

    // no split sidecars were written anywhere
    assert!(!root.join("plain").join(INDEX).exists());

    // a second pass over an unchanged tree reports no changes
    let ctx = new_context(true);
    ctx.use_atom_store(&root, &[root.clone()]).unwrap();
    let (counters, _) = run(ctx, &[root.clone()]);
    assert_eq!(counters.new, 0);
    assert_eq!(counters.updated, 0);
    assert_eq!(counters.deleted, 0);
    assert_eq!(counters.damaged, 0);
    assert_eq!(counters.index_saved, 0);
}

#[test]
fn atom_check_counts_match_update() {
    let tmp = tempfile::tempdir().unwrap();
    let root = fs::canonicalize(tmp.path()).unwrap();
    build_tree(&root);
    initialize(StoreKind::Atom, &root, INDEX, false).unwrap();

    let ctx = new_context(true);
    ctx.use_atom_store(&root, &[root.clone()]).unwrap();
    let (update_counters, _) = run(ctx, &[root.clone()]);

    let ctx = new_context(false);
    ctx.use_atom_store(&root, &[root.clone()]).unwrap();
    let (check_counters, events) = run(ctx, &[root.clone()]);
    assert_eq!(check_counters.total, update_counters.total);
    assert_eq!(check_counters.new + check_counters.updated, 0);
    let ok_count = events.iter().filter(|e| e.status == Status::Ok).count() as i64;
    assert_eq!(
        check_counters.total,
        ok_count + check_counters.new + check_counters.updated + check_counters.damaged
    );
}

#[test]
fn scan_paths_must_live_below_the_atom_root() {
    let tmp = tempfile::tempdir().unwrap();
    let root = fs::canonicalize(tmp.path()).unwrap();
    let inside = root.join("inside");
    fs::create_dir(&inside).unwrap();
    initialize(StoreKind::Atom, &inside, INDEX, false).unwrap();

    let outside = tempfile::tempdir().unwrap();
    let ctx = new_context(true);
    assert!(ctx
        .use_atom_store(&inside, &[fs::canonicalize(outside.path()).unwrap()])
        .is_err());
}

#[test]
fn max_depth_limits_recursion() {
    let tmp = tempfile::tempdir().unwrap();
    let root = fs::canonicalize(tmp.path()).unwrap();
    fs::create_dir_all(root.join("level1/level2")).unwrap();
    fs::write(root.join("top.txt"), "t").unwrap();
    fs::write(root.join("level1/mid.txt"), "m").unwrap();
    fs::write(root.join("level1/level2/deep.txt"), "d").unwrap();

    let mut ctx = new_context(true);
    ctx.max_depth = 1;
    let (counters, _) = run(ctx, &[root.clone()]);
    assert_eq!(counters.new, 1);
    assert!(root.join(INDEX).exists());
    assert!(!root.join("level1").join(INDEX).exists());
}
