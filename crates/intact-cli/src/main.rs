mod commands;
mod logging;
mod report;
mod settings;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;
use tracing::error;

use commands::{Cli, Commands, DedupCommands, InitMode};
use intact_core::{Context, Dedup, DedupBag, HashAlgo, RunCounters, StoreKind};
use report::{count_choice, count_noun, format_size, ReportOptions, ReportSummary};
use settings::Settings;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = logging::init_logger();

    let settings = match settings::load(cli.no_config) {
        Ok(settings) => settings,
        Err(e) => {
            error!("error loading configuration: {e}");
            return ExitCode::from(1);
        }
    };

    let code = match &cli.command {
        Commands::Init { mode, path, force } => run_init(&cli, &settings, *mode, path, *force),
        Commands::Fuse { path } => run_fuse(&cli, &settings, path),
        Commands::Dedup { command } => run_dedup(&cli, &settings, command),
        Commands::Check { .. } | Commands::Update { .. } | Commands::ShowIgnored { .. } => {
            run_process(&cli, &settings)
        }
    };
    ExitCode::from(code)
}

fn index_name(cli: &Cli, settings: &Settings) -> String {
    cli.index_name
        .clone()
        .or_else(|| settings.index_name.clone())
        .unwrap_or_else(|| ".intact".to_string())
}

fn ignore_name(cli: &Cli, settings: &Settings) -> String {
    cli.ignore_name
        .clone()
        .or_else(|| settings.ignore_name.clone())
        .unwrap_or_else(|| ".intactignore".to_string())
}

fn build_context(cli: &Cli, settings: &Settings) -> intact_core::Result<Context> {
    let algo: HashAlgo = cli
        .algo
        .clone()
        .or_else(|| settings.algo.clone())
        .unwrap_or_else(|| "blake3".to_string())
        .parse()?;
    let workers = cli.workers.or(settings.workers).unwrap_or(5);

    let mut ctx = Context::new(workers, algo, &index_name(cli, settings), &ignore_name(cli, settings))?;
    ctx.include_dot = cli.include_dot || settings.include_dot.unwrap_or(false);
    ctx.skip_symlinks = cli.skip_symlinks || settings.skip_symlinks.unwrap_or(false);
    ctx.track_directories = !cli.no_dir_tracking && settings.track_directories.unwrap_or(true);
    ctx.log_deleted = cli.log_deleted;
    ctx.skip_new = cli.skip_new;
    ctx.max_depth = cli.max_depth;
    Ok(ctx)
}

fn report_options(cli: &Cli, verbose: bool) -> ReportOptions {
    ReportOptions {
        verbose,
        quiet: cli.quiet,
        log_file: cli.log_file.clone(),
        log_verbose: cli.log_verbose,
    }
}

fn run_process(cli: &Cli, settings: &Settings) -> u8 {
    let (paths, update, skip_check, force, show_ignored): (&[PathBuf], bool, bool, bool, bool) =
        match &cli.command {
            Commands::Check { paths } => (paths.as_slice(), false, false, false, false),
            Commands::Update {
                paths,
                skip_check,
                force,
            } => (paths.as_slice(), true, *skip_check, *force, false),
            Commands::ShowIgnored { paths } => (paths.as_slice(), false, false, false, true),
            _ => unreachable!(),
        };

    let mut ctx = match build_context(cli, settings) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("error: {e}");
            return 1;
        }
    };
    ctx.update_index = update;
    ctx.skip_check = skip_check;
    ctx.force_update_dmg = force;
    ctx.show_ignored_only = show_ignored;
    let verbose = cli.verbose || show_ignored;

    let (kind, root) = match intact_core::locate(&paths[0], None, ctx.index_filename()) {
        Ok(found) => found,
        Err(e) => {
            eprintln!("error: {e}");
            return 1;
        }
    };
    if kind == StoreKind::Atom {
        match ctx.use_atom_store(&root, paths) {
            Ok(root) => {
                if !cli.quiet {
                    println!("Using atom store in {}", root.display());
                }
            }
            Err(e) => {
                eprintln!("error: {e}");
                return 1;
            }
        }
    }

    let reporter = report::spawn_run_reporter(
        ctx.log_events(),
        ctx.perf_events(),
        report_options(cli, verbose),
    );
    let counters = ctx.process(paths);
    let summary = reporter.join().expect("reporter thread");

    if show_ignored {
        return 0;
    }
    print_result(cli, update, &counters, &summary);
    if counters.failed() {
        1
    } else {
        0
    }
}

fn print_result(cli: &Cli, update: bool, counters: &RunCounters, summary: &ReportSummary) {
    if !cli.quiet {
        let mode = if update { "" } else { " in readonly mode" };
        println!(
            "{}",
            format!("Processed {}{}", count_noun(counters.total, "file"), mode).green()
        );

        if update {
            if counters.index_saved > 0 {
                println!(
                    "- {} updated",
                    count_choice(counters.index_saved, "directory was", "directories were")
                );
                println!(
                    "- {} added",
                    count_choice(counters.new, "file hash was", "file hashes were")
                );
                println!(
                    "- {} updated",
                    count_choice(counters.updated, "file hash was", "file hashes were")
                );
                if counters.deleted > 0 {
                    println!(
                        "- {} been removed",
                        count_choice(
                            counters.deleted,
                            "file/directory has",
                            "files/directories have"
                        )
                    );
                }
            }
        } else if counters.new + counters.updated + counters.deleted > 0 {
            println!("{}", "No changes were made".red());
            println!(
                "- {} would have been added",
                count_noun(counters.new, "file")
            );
            println!(
                "- {} would have been updated",
                count_noun(counters.updated, "file")
            );
            if counters.deleted > 0 {
                println!(
                    "- {} would have been removed",
                    count_choice(counters.deleted, "file/directory", "files/directories")
                );
            }
        }
    }

    if !summary.damaged.is_empty() {
        eprintln!("{}", "intact detected damage in these files:".red());
        for path in &summary.damaged {
            eprintln!("{path}");
        }
        eprintln!(
            "error: detected {} with damage!",
            count_noun(summary.damaged.len() as i64, "file")
        );
    }
    if !summary.errors.is_empty() {
        eprintln!("{}", "intact ran into errors:".red());
        for message in &summary.errors {
            eprintln!("{message}");
        }
    }
}

fn run_init(cli: &Cli, settings: &Settings, mode: InitMode, path: &PathBuf, force: bool) -> u8 {
    let kind = match mode {
        InitMode::Split => StoreKind::Split,
        InitMode::Atom => StoreKind::Atom,
    };
    if !cli.quiet {
        println!(
            "intact init {} {}",
            match kind {
                StoreKind::Split => "split",
                StoreKind::Atom => "atom",
            },
            path.display()
        );
    }
    match intact_core::initialize(kind, path, &index_name(cli, settings), force) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    }
}

fn run_fuse(cli: &Cli, settings: &Settings, path: &PathBuf) -> u8 {
    let name = index_name(cli, settings);
    match intact_core::fuse_store(path, &name, cli.skip_symlinks, cli.verbose, |line| {
        println!("{line}")
    }) {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    }
}

fn run_dedup(cli: &Cli, settings: &Settings, command: &DedupCommands) -> u8 {
    let name = index_name(cli, settings);
    let path = match command {
        DedupCommands::Detect { path, .. }
        | DedupCommands::Show { path, .. }
        | DedupCommands::Run { path, .. } => path,
    };

    let (kind, root) = match intact_core::locate(path, None, &name) {
        Ok(found) => found,
        Err(e) => {
            eprintln!("error: {e}");
            return 1;
        }
    };
    if kind != StoreKind::Atom {
        eprintln!("error: dedup requires an atom store (see 'intact init atom')");
        return 1;
    }

    match command {
        DedupCommands::Show { json, details, .. } => {
            let dedup = match Dedup::new(&root, &name, false) {
                Ok(dedup) => dedup,
                Err(e) => {
                    eprintln!("error: {e}");
                    return 1;
                }
            };
            match dedup.show() {
                Ok(list) => {
                    if *json {
                        match serde_json::to_string(&list) {
                            Ok(text) => println!("{text}"),
                            Err(e) => {
                                eprintln!("error: {e}");
                                return 1;
                            }
                        }
                    } else {
                        show_dedup_status(&list, *details);
                    }
                    0
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    1
                }
            }
        }
        DedupCommands::Detect { min_size, .. } => {
            let mut dedup = match Dedup::new(&root, &name, true) {
                Ok(dedup) => dedup,
                Err(e) => {
                    eprintln!("error: {e}");
                    return 1;
                }
            };
            let reporter = report::spawn_dedup_reporter(
                dedup.log_events(),
                dedup.perf_events(),
                report_options(cli, cli.verbose),
            );
            let result = dedup.detect(*min_size);
            dedup.close_log();
            let _ = reporter.join();
            match result {
                Ok(()) => {
                    if let Ok(list) = dedup.show() {
                        show_dedup_status(&list, false);
                    }
                    0
                }
                Err(e) if e.is_aborted() => 0,
                Err(e) => {
                    eprintln!("error: {e}");
                    1
                }
            }
        }
        DedupCommands::Run { hashes, .. } => {
            let mut dedup = match Dedup::new(&root, &name, false) {
                Ok(dedup) => dedup,
                Err(e) => {
                    eprintln!("error: {e}");
                    return 1;
                }
            };
            let reporter = report::spawn_dedup_reporter(
                dedup.log_events(),
                dedup.perf_events(),
                report_options(cli, cli.verbose),
            );
            let result = dedup.run(hashes, cli.verbose);
            dedup.close_log();
            let _ = reporter.join();
            match result {
                Ok(()) => {
                    if !cli.quiet {
                        println!(
                            "- {} processed, {} reclaimed",
                            count_noun(dedup.num_total(), "file"),
                            format_size(dedup.reclaimed_total())
                        );
                    }
                    0
                }
                Err(e) if e.is_aborted() => 0,
                Err(e) => {
                    eprintln!("error: {e}");
                    1
                }
            }
        }
    }
}

fn show_dedup_status(list: &[DedupBag], details: bool) {
    let mut hash_count = 0u64;
    let mut file_count = 0u64;
    let mut min_space = 0u64;
    let mut max_space = 0u64;
    let mut actual_space = 0u64;
    let mut unknown_count = 0usize;

    for (i, bag) in list.iter().enumerate() {
        let members = bag.items.len() as u64;
        hash_count += 1;
        file_count += members;
        min_space += bag.size;
        max_space += bag.size * members;
        actual_space += bag.size_exclusive;
        let unknown = bag.ext_unknown.unwrap_or(false);
        if unknown {
            unknown_count += 1;
        }

        if details {
            if unknown {
                println!("#{i} {} [{}*]", bag.hash, format_size(bag.size));
            } else {
                println!(
                    "#{i} {} [{}, shared={}, exclusive={}]",
                    bag.hash,
                    format_size(bag.size),
                    format_size(bag.size_shared),
                    format_size(bag.size_exclusive)
                );
            }
            for item in &bag.items {
                println!("{} {}", if item.merged { "+" } else { "-" }, item.path);
            }
        }
    }

    println!();
    println!("Detected {hash_count} hashes that are shared by {file_count} files:");
    if unknown_count * 2 > list.len() && !list.is_empty() {
        println!("- Used space:             {}", format_size(actual_space));
        println!();
        println!(
            "*) file extents could not be loaded on this OS/filesystem for \
             {:.2}% of the groups; details and reclaimable space are unavailable",
            unknown_count as f64 / list.len() as f64 * 100.0
        );
    } else {
        println!("- Minimum required space: {}", format_size(min_space));
        println!("- Maximum required space: {}", format_size(max_space));
        println!("- Actual used space:      {}", format_size(actual_space));
        println!(
            "- Reclaimable space:      {}",
            format_size(actual_space.saturating_sub(min_space))
        );
        if max_space > min_space {
            let efficiency = (1.0
                - actual_space.saturating_sub(min_space) as f64 / (max_space - min_space) as f64)
                * 100.0;
            println!("- Efficiency:             {efficiency:.2}%");
        }
        if unknown_count > 0 {
            println!();
            println!(
                "*) file extents could not be loaded on this OS/filesystem for \
                 {:.2}% of the groups; shown data is not accurate",
                unknown_count as f64 / list.len() as f64 * 100.0
            );
        }
    }
}
