//! Command-line shell over the engine.
//!
//! Deliberately thin: selection parsing, output formatting and exit codes
//! live here; every behavior worth testing lives in the engine modules.

use std::error::Error;
use std::path::PathBuf;

use clap::Parser;

use crate::data::MetadataCache;
use crate::functions;
use crate::gateway::ExifTool;
use crate::log::Log;
use crate::settings::Settings;

#[derive(Parser)]
#[command(name = "exifdeck", version, about = "Metadata editing over exiftool")]
struct Cli {
    /// Settings file (defaults to EXIFDECK_SETTINGS or the user config dir)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    /// Track this directory instead of the configured list
    #[arg(long, global = true)]
    dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// List tracked files with selected tag columns
    List(ListArgs),
    /// Dump one file's saved, pending and failed tags
    Show(ShowArgs),
    /// Edit one tag across files and save
    Set(SetArgs),
    /// Copy a tag's value to other tags across files
    Copy(CopyArgs),
    /// Shift a datetime tag across files
    Shift(ShiftArgs),
    /// Rename files from a tag template
    Rename(RenameArgs),
    /// Sort files by a tag, optionally reversing the values
    Sort(SortArgs),
}

#[derive(clap::Args)]
struct ListArgs {
    /// Tag columns (normal, ?conditional, &composite or (datetime) cast)
    #[arg(long, value_delimiter = ',', default_value = "?DateTime")]
    tags: Vec<String>,
}

#[derive(clap::Args)]
struct ShowArgs {
    file: PathBuf,
}

#[derive(clap::Args)]
struct SetArgs {
    /// Tag address to edit
    #[arg(long)]
    tag: String,
    /// New value; empty deletes the tag
    #[arg(long, default_value = "")]
    value: String,
    /// Files to touch; all tracked files when omitted
    files: Vec<PathBuf>,
}

#[derive(clap::Args)]
struct CopyArgs {
    #[arg(long)]
    from: String,
    #[arg(long, value_delimiter = ',')]
    to: Vec<String>,
    files: Vec<PathBuf>,
}

#[derive(clap::Args)]
struct ShiftArgs {
    #[arg(long)]
    tag: String,
    /// Target datetime for the reference file
    #[arg(long)]
    to: Option<String>,
    /// Signed duration, `[days ]HH:MM:SS[.frac]`
    #[arg(long)]
    by: Option<String>,
    /// Reference file for --to; first selected file when omitted
    #[arg(long)]
    reference: Option<PathBuf>,
    files: Vec<PathBuf>,
}

#[derive(clap::Args)]
struct RenameArgs {
    /// Template with `<Tag>` and `<Tag>[a:b]` tokens
    #[arg(long)]
    template: String,
    files: Vec<PathBuf>,
}

#[derive(clap::Args)]
struct SortArgs {
    #[arg(long)]
    tag: String,
    /// Swap the tag's values front-to-back across the sorted order
    #[arg(long)]
    reverse: bool,
    files: Vec<PathBuf>,
}

pub fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let mut settings = Settings::load_or_default(cli.settings.as_deref())?;
    if let Some(dir) = cli.dir {
        settings.dirs = vec![dir];
    }
    let log = Log::to_file(&settings.log_path());
    let gateway = ExifTool::new(settings.exiftool_program());
    let cache = MetadataCache::load(settings, Box::new(gateway), log);

    if cache.is_empty() {
        eprintln!("No files tracked. Configure dirs in the settings file or pass --dir.");
        return Ok(());
    }

    match cli.command {
        Command::List(args) => list(&cache, &args),
        Command::Show(args) => show(&cache, &args),
        Command::Set(args) => {
            let selection = select(&cache, &args.files)?;
            for &idx in &selection {
                cache.edit(idx, &args.tag, &args.value, false);
            }
            save_and_report(&cache, &selection)
        }
        Command::Copy(args) => {
            let selection = select(&cache, &args.files)?;
            let staged = functions::copy_value(&cache, &selection, &args.from, &args.to, false);
            eprintln!("{staged} edits staged");
            save_and_report(&cache, &selection)
        }
        Command::Shift(args) => {
            let selection = select(&cache, &args.files)?;
            let reference = match &args.reference {
                Some(path) => cache
                    .index_of(path)
                    .ok_or_else(|| format!("not a tracked file: {}", path.display()))?,
                None => *selection.first().ok_or("nothing selected")?,
            };
            let staged = functions::shift_datetime(
                &cache,
                &selection,
                reference,
                &args.tag,
                args.to.as_deref(),
                args.by.as_deref(),
                false,
            )?;
            eprintln!("{staged} edits staged");
            save_and_report(&cache, &selection)
        }
        Command::Rename(args) => {
            let selection = select(&cache, &args.files)?;
            let staged = functions::rename(&cache, &selection, &args.template, false);
            eprintln!("{staged} renames staged");
            save_and_report(&cache, &selection)
        }
        Command::Sort(args) => {
            let selection = select(&cache, &args.files)?;
            let order = functions::sorted_by_tag(&cache, &selection, &args.tag);
            for &idx in &order {
                let path = cache.file_path(idx).unwrap_or_default();
                println!("{}\t{}", cache.get(idx, &args.tag, "-"), path.display());
            }
            if args.reverse {
                functions::reverse_order(&cache, &selection, &args.tag, false);
                return save_and_report(&cache, &selection);
            }
            Ok(())
        }
    }
}

/// Map path arguments to record indexes; an empty argument list selects
/// every tracked file.
fn select(cache: &MetadataCache, files: &[PathBuf]) -> Result<Vec<usize>, Box<dyn Error>> {
    if files.is_empty() {
        return Ok((0..cache.len()).collect());
    }
    files
        .iter()
        .map(|path| {
            cache
                .index_of(path)
                .ok_or_else(|| format!("not a tracked file: {}", path.display()).into())
        })
        .collect()
}

fn list(cache: &MetadataCache, args: &ListArgs) -> Result<(), Box<dyn Error>> {
    for idx in 0..cache.len() {
        let path = cache.file_path(idx).unwrap_or_default();
        println!("{}", path.display());
        for tag in &args.tags {
            let view = cache.view(idx, tag);
            let marker = match view.status {
                Some(true) => ' ',
                None => '~',
                Some(false) => '!',
            };
            let value = view.value.unwrap_or_else(|| "-".to_string());
            match view.edited {
                Some(edited) if edited != value => {
                    println!("  {marker} {tag}: {value} -> {edited}")
                }
                _ => println!("  {marker} {tag}: {value}"),
            }
        }
    }
    Ok(())
}

fn show(cache: &MetadataCache, args: &ShowArgs) -> Result<(), Box<dyn Error>> {
    let idx = cache
        .index_of(&args.file)
        .ok_or_else(|| format!("not a tracked file: {}", args.file.display()))?;
    cache.with_record(idx, |record| {
        println!("{}", record.source_path.display());
        for (key, value) in &record.saved {
            println!("  {key}: {}", crate::tags::to_display(value));
        }
        if !record.edited.is_empty() {
            println!("pending:");
            for (key, value) in &record.edited {
                println!("  {key}: {}", crate::tags::to_display(value));
            }
        }
        if !record.failed.is_empty() {
            println!("failed:");
            for (key, value) in &record.failed {
                println!("  {key}: {}", crate::tags::to_display(value));
            }
        }
    });
    Ok(())
}

/// Save the selection and report each file's outcome from its failed layer.
fn save_and_report(
    cache: &MetadataCache,
    selection: &[usize],
) -> Result<(), Box<dyn Error>> {
    for &idx in selection {
        cache.save_file(idx);
    }
    let mut failures = 0;
    for &idx in selection {
        let failed = cache.failed_tags(idx);
        if failed.is_empty() {
            continue;
        }
        failures += 1;
        let path = cache.file_path(idx).unwrap_or_default();
        for (tag, value) in failed {
            eprintln!("FAIL {}: {tag} = {value:?} was not applied", path.display());
        }
    }
    if failures > 0 {
        eprintln!("{failures} file(s) had rejected edits; see the log for details");
    }
    Ok(())
}
