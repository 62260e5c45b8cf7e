use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::engine::{Context, WorkItem};
use crate::error::Result;
use crate::index::Index;
use crate::status::Status;
use crate::store::IndexStore;

/// Worker loop: drain the work channel until the shutdown sentinel.
/// Failures never escape; they surface as `PNC` events and the loop
/// continues with the next directory.
pub(crate) fn run_worker(ctx: &Context, store: &IndexStore) {
    while let Some(item) = ctx.work_recv() {
        let dir = item.dir.display().to_string();
        match catch_unwind(AssertUnwindSafe(|| process_item(ctx, store, item))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => ctx.log_err(&dir, &e),
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                ctx.log(Status::Panic, format!("{dir}: worker panicked: {msg}"));
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

fn process_item(ctx: &Context, store: &IndexStore, item: WorkItem) -> Result<()> {
    let mut index = Index::new(ctx, item.dir, item.files, item.dirs, !ctx.update_index);

    if let Err(e) = index.load(store) {
        ctx.log_err(&index.index_filepath().display().to_string(), &e);
    }

    if ctx.show_ignored_only {
        index.show_ignored_only(&item.ignore);
        return Ok(());
    }

    index.compute_hashes(&item.ignore);
    index.reconcile(ctx.force_update_dmg);

    if ctx.update_index {
        if index.save(store, store.is_refresh())? {
            ctx.log(Status::IndexUpdate, String::new());
        }
    }
    Ok(())
}
