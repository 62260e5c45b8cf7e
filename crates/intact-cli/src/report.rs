use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use colored::Colorize;
use crossbeam_channel::{select, Receiver};
use indicatif::{ProgressBar, ProgressStyle};
use intact_core::{DedupPerfEvent, LogEvent, PerfEvent, Status};

#[derive(Debug, Clone, Default)]
pub struct ReportOptions {
    pub verbose: bool,
    pub quiet: bool,
    pub log_file: Option<PathBuf>,
    pub log_verbose: bool,
}

/// Collected error context of a run, used for the final summary and the
/// exit code.
#[derive(Debug, Default)]
pub struct ReportSummary {
    pub damaged: Vec<String>,
    pub errors: Vec<String>,
}

struct Reporter {
    opts: ReportOptions,
    bar: ProgressBar,
    log_writer: Option<BufWriter<File>>,
    summary: ReportSummary,
}

impl Reporter {
    fn new(opts: ReportOptions, bar: ProgressBar) -> Self {
        let log_writer = opts.log_file.as_ref().and_then(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map(BufWriter::new)
                .ok()
        });
        Reporter {
            opts,
            bar,
            log_writer,
            summary: ReportSummary::default(),
        }
    }

    fn handle(&mut self, event: &LogEvent) {
        // internal index-saved marker, never shown
        if event.status == Status::IndexUpdate {
            return;
        }

        match event.status {
            Status::Damage => self.summary.damaged.push(event.message.clone()),
            Status::Panic => self.summary.errors.push(event.message.clone()),
            _ => {}
        }

        if let Some(writer) = &mut self.log_writer {
            if self.opts.log_verbose || !event.status.is_verbose() {
                let now = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S");
                let _ = writeln!(writer, "{} {} {}", now, event.status, event.message);
            }
        }

        if self.opts.quiet && event.status == Status::Info {
            return;
        }
        if self.opts.verbose || !event.status.is_verbose() {
            let line = format!("{} {}", event.status, event.message);
            if event.status.is_error_or_warning() {
                self.print_line(line.red().to_string());
            } else {
                self.print_line(line);
            }
        }
    }

    /// `ProgressBar::println` draws nothing on a hidden bar (quiet mode or
    /// a non-terminal), so fall back to plain stdout there.
    fn print_line(&self, line: String) {
        if self.bar.is_hidden() {
            println!("{line}");
        } else {
            self.bar.println(line);
        }
    }

    fn finish(mut self) -> ReportSummary {
        if let Some(writer) = &mut self.log_writer {
            let _ = writer.flush();
        }
        self.bar.finish_and_clear();
        self.summary
    }
}

fn status_bar(quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap()
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
    );
    bar.enable_steady_tick(std::time::Duration::from_millis(120));
    bar
}

/// Drain a run's log and perf channels until the log sentinel, rendering
/// status lines and a files/bytes throughput spinner.
pub fn spawn_run_reporter(
    log_rx: Receiver<Option<LogEvent>>,
    perf_rx: Receiver<PerfEvent>,
    opts: ReportOptions,
) -> JoinHandle<ReportSummary> {
    thread::spawn(move || {
        let quiet = opts.quiet;
        let mut reporter = Reporter::new(opts, status_bar(quiet));
        let start = Instant::now();
        let mut files = 0i64;
        let mut bytes = 0i64;
        loop {
            select! {
                recv(log_rx) -> msg => match msg {
                    Ok(Some(event)) => reporter.handle(&event),
                    _ => break,
                },
                recv(perf_rx) -> msg => {
                    if let Ok(perf) = msg {
                        files += perf.files;
                        bytes += perf.bytes;
                        let secs = start.elapsed().as_secs_f64().max(0.001);
                        reporter.bar.set_message(format!(
                            "{} files  {:.0} files/s  {}/s",
                            files,
                            files as f64 / secs,
                            format_size((bytes as f64 / secs) as u64),
                        ));
                    }
                },
            }
        }
        reporter.finish()
    })
}

/// Drain the dedup engine's channels until the log sentinel, rendering a
/// percent bar.
pub fn spawn_dedup_reporter(
    log_rx: Receiver<Option<LogEvent>>,
    perf_rx: Receiver<DedupPerfEvent>,
    opts: ReportOptions,
) -> JoinHandle<ReportSummary> {
    thread::spawn(move || {
        let bar = if opts.quiet {
            ProgressBar::hidden()
        } else {
            let bar = ProgressBar::new(1000);
            bar.set_style(
                ProgressStyle::with_template("[{bar:24.cyan/dim}] {percent:>3}% {msg}")
                    .unwrap()
                    .progress_chars("━╸─"),
            );
            bar
        };
        let mut reporter = Reporter::new(opts, bar);
        let mut files = 0i64;
        loop {
            select! {
                recv(log_rx) -> msg => match msg {
                    Ok(Some(event)) => reporter.handle(&event),
                    _ => break,
                },
                recv(perf_rx) -> msg => {
                    if let Ok(perf) = msg {
                        files += perf.files;
                        reporter.bar.set_position((perf.percent.clamp(0.0, 1.0) * 1000.0) as u64);
                        reporter.bar.set_message(format!("# {files}"));
                    }
                },
            }
        }
        reporter.finish()
    })
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "K", "M", "G", "T", "P"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}B")
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}

/// "1 file" / "3 files"
pub fn count_noun(n: i64, noun: &str) -> String {
    if n == 1 {
        format!("{n} {noun}")
    } else {
        format!("{n} {noun}s")
    }
}

/// "1 file/directory has" / "3 files/directories have"
pub fn count_choice(n: i64, one: &str, many: &str) -> String {
    if n == 1 {
        format!("{n} {one}")
    } else {
        format!("{n} {many}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_formatting() {
        assert_eq!(format_size(0), "0B");
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(4096), "4.0K");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0M");
    }

    #[test]
    fn pluralisation() {
        assert_eq!(count_noun(1, "file"), "1 file");
        assert_eq!(count_noun(2, "file"), "2 files");
        assert_eq!(
            count_choice(2, "file/directory has", "files/directories have"),
            "2 files/directories have"
        );
    }
}
