/// Per-event status code as it appears in log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// An error was turned into a log event; the run continues.
    Panic,
    /// Digest differs while the mtime is unchanged.
    Damage,
    /// The index file's self-hash did not verify.
    IndexDamage,
    /// Entry replaced by a file with an older mtime.
    WarnOld,
    New,
    Update,
    Ok,
    Ignore,
    Deleted,
    Info,
    /// Internal marker: a directory index was written.
    IndexUpdate,
}

impl Status {
    pub fn code(&self) -> &'static str {
        match self {
            Status::Panic => "PNC",
            Status::Damage => "DMG",
            Status::IndexDamage => "ERX",
            Status::WarnOld => "old",
            Status::New => "new",
            Status::Update => "upd",
            Status::Ok => "ok ",
            Status::Ignore => "ign",
            Status::Deleted => "del",
            Status::Info => "msg",
            Status::IndexUpdate => "xup",
        }
    }

    pub fn is_error_or_warning(&self) -> bool {
        matches!(
            self,
            Status::Panic | Status::Damage | Status::IndexDamage | Status::WarnOld
        )
    }

    /// Statuses only shown with verbose output.
    pub fn is_verbose(&self) -> bool {
        matches!(self, Status::Ok | Status::Ignore)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone)]
pub struct LogEvent {
    pub status: Status,
    pub message: String,
}

/// Throughput sample emitted by the hasher (per block) and the workers
/// (per completed file).
#[derive(Debug, Clone, Copy)]
pub struct PerfEvent {
    pub files: i64,
    pub bytes: i64,
}

/// Progress sample emitted by the dedup engine.
#[derive(Debug, Clone, Copy)]
pub struct DedupPerfEvent {
    pub files: i64,
    /// Completion in [0, 1] over the current pass.
    pub percent: f64,
}
