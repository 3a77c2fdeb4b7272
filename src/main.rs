//! epubmeta - Inspect and edit EPUB metadata

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use log::LevelFilter;
use serde::Serialize;

use epubmeta::{
    Coordinator, CoverOutcome, EditRequest, EpubMetadata, Job, MissingCoverPolicy, ReplaceOptions,
    RetryPolicy, run_batch,
};

#[derive(Parser)]
#[command(name = "epubmeta")]
#[command(version, about = "Inspect and edit EPUB metadata", long_about = None)]
#[command(after_help = "EXAMPLES:
    epubmeta info book.epub                        Show metadata
    epubmeta edit book.epub --force --title T      Retitle in place
    epubmeta edit book.epub -o new.epub --cover c.jpg
                                                   Write a copy with a new cover")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Show debug output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only show errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Show the metadata of one or more books
    Info {
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Change the metadata of one or more books
    Edit(EditArgs),
}

#[derive(Args)]
struct EditArgs {
    #[arg(value_name = "FILE", required = true)]
    files: Vec<PathBuf>,

    #[arg(long)]
    title: Option<String>,

    #[arg(long)]
    author: Option<String>,

    #[arg(long)]
    publisher: Option<String>,

    #[arg(long)]
    language: Option<String>,

    #[arg(long)]
    identifier: Option<String>,

    #[arg(long)]
    description: Option<String>,

    /// Image to install as the cover
    #[arg(long, value_name = "IMAGE")]
    cover: Option<PathBuf>,

    /// Add the cover even when the book does not declare one
    #[arg(long, requires = "cover")]
    insert_cover: bool,

    /// Write the result here instead of editing in place (single FILE only)
    #[arg(short, long, value_name = "OUT")]
    output: Option<PathBuf>,

    /// Allow replacing existing files (needed for in-place edits)
    #[arg(short, long)]
    force: bool,

    /// Attempts at removing the scratch directory
    #[arg(long, default_value_t = 3)]
    retries: u32,

    /// Deflate level for repacked entries
    #[arg(long, value_parser = clap::value_parser!(i64).range(0..=9))]
    compression_level: Option<i64>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.quiet {
        LevelFilter::Error
    } else if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    init_logging(level);

    let result = match cli.command {
        Command::Info { files, json } => show_info(&files, json),
        Command::Edit(args) => edit(args, cli.quiet),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[derive(Serialize)]
struct InfoJson<'a> {
    file: &'a Path,
    title: Option<&'a str>,
    author: Option<&'a str>,
    publisher: Option<&'a str>,
    language: Option<&'a str>,
    identifier: Option<&'a str>,
    description: Option<&'a str>,
    cover: Option<CoverJson<'a>>,
}

#[derive(Serialize)]
struct CoverJson<'a> {
    extension: &'a str,
    bytes: usize,
}

impl<'a> InfoJson<'a> {
    fn new(file: &'a Path, meta: &'a EpubMetadata) -> Self {
        Self {
            file,
            title: meta.title.as_deref(),
            author: meta.author.as_deref(),
            publisher: meta.publisher.as_deref(),
            language: meta.language.as_deref(),
            identifier: meta.identifier.as_deref(),
            description: meta.description.as_deref(),
            cover: meta.cover.as_ref().map(|c| CoverJson {
                extension: &c.extension,
                bytes: c.data.len(),
            }),
        }
    }
}

fn show_info(files: &[PathBuf], json: bool) -> Result<(), String> {
    let mut unreadable = 0;
    let mut snapshots = Vec::new();
    for file in files {
        match epubmeta::extract(file) {
            Some(meta) => snapshots.push((file.as_path(), meta)),
            None => {
                eprintln!("error: {}: no readable metadata", file.display());
                unreadable += 1;
            }
        }
    }

    if json {
        let entries: Vec<InfoJson> = snapshots.iter().map(|(f, m)| InfoJson::new(f, m)).collect();
        let text = serde_json::to_string_pretty(&entries).map_err(|e| e.to_string())?;
        println!("{text}");
    } else {
        for (i, (file, meta)) in snapshots.iter().enumerate() {
            if i > 0 {
                println!();
            }
            print_info(file, meta);
        }
    }

    match unreadable {
        0 => Ok(()),
        n => Err(format!("{n} of {} file(s) could not be read", files.len())),
    }
}

fn print_info(file: &Path, meta: &EpubMetadata) {
    println!("File: {}", file.display());
    let fields = [
        ("Title", &meta.title),
        ("Author", &meta.author),
        ("Publisher", &meta.publisher),
        ("Language", &meta.language),
        ("Identifier", &meta.identifier),
    ];
    for (label, value) in fields {
        if let Some(value) = value {
            println!("{label}: {value}");
        }
    }
    if let Some(desc) = &meta.description {
        let desc = desc.trim();
        match desc.char_indices().nth(200) {
            Some((cut, _)) => println!("Description: {}...", &desc[..cut]),
            None => println!("Description: {desc}"),
        }
    }
    if let Some(cover) = &meta.cover {
        println!("Cover: {} ({} bytes)", cover.extension, cover.data.len());
    }
}

fn edit(args: EditArgs, quiet: bool) -> Result<(), String> {
    if args.output.is_some() && args.files.len() > 1 {
        return Err("--output needs exactly one input file".to_string());
    }

    let edits = EditRequest {
        title: args.title,
        author: args.author,
        publisher: args.publisher,
        language: args.language,
        identifier: args.identifier,
        description: args.description,
        cover: args.cover,
    };
    if edits.is_empty() {
        return Err("nothing to change; pass at least one field or --cover".to_string());
    }

    let mut options = ReplaceOptions::new()
        .with_overwrite(args.force)
        .with_retry(RetryPolicy {
            attempts: args.retries,
            ..RetryPolicy::default()
        });
    if args.insert_cover {
        options = options.with_missing_cover(MissingCoverPolicy::Insert);
    }
    if let Some(level) = args.compression_level {
        options = options.with_compression_level(level);
    }
    let coordinator = Coordinator::new(options);

    let jobs: Vec<Job> = match args.output {
        Some(output) => args
            .files
            .into_iter()
            .map(|file| Job::to(file, output.clone(), edits.clone()))
            .collect(),
        None => args
            .files
            .into_iter()
            .map(|file| Job::in_place(file, edits.clone()))
            .collect(),
    };

    let report = run_batch(&coordinator, jobs);
    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(run) if !quiet => {
                let cover = match &run.cover {
                    CoverOutcome::Unchanged => String::new(),
                    CoverOutcome::Replaced { href, .. } => format!(", cover -> {href}"),
                    CoverOutcome::Inserted { href } => format!(", cover added at {href}"),
                    CoverOutcome::Skipped => ", cover skipped (none declared)".to_string(),
                };
                println!(
                    "{}: {} field(s) updated{cover}",
                    run.destination.display(),
                    run.fields_changed.len()
                );
            }
            Ok(_) => {}
            Err(e) => {
                eprintln!("error: {}: {e}", outcome.source.display());
                if let Some(backup) = e.recovery_path() {
                    eprintln!("       original kept at {}", backup.display());
                }
            }
        }
    }
    coordinator.sweep();

    let failed = report.failed().count();
    match failed {
        0 => Ok(()),
        n => Err(format!("{n} of {} file(s) failed", report.len())),
    }
}

/// Send `log` records to stderr. `RUST_LOG` overrides the `-v`/`-q` level.
fn init_logging(level: LevelFilter) {
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .format_target(false)
        .parse_default_env()
        .try_init();
}
