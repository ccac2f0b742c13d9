//! CLI entrypoint for importing survey archives.
#![forbid(unsafe_code)]

use clap::Parser;
use std::{path::PathBuf, process};
use survey_sync::{import_archive, ImportError, ImportOptions};

fn main() {
    let args = Arguments::parse();
    if let Err(error) = run(args) {
        eprintln!("survey-sync: {error}");
        process::exit(1);
    }
}

fn run(arguments: Arguments) -> Result<(), ImportError> {
    let Arguments {
        archives,
        workspace,
        mapping,
        reject_duplicates,
    } = arguments;

    let mut options = ImportOptions::new(workspace).with_reject_duplicates(reject_duplicates);
    if let Some(path) = mapping {
        options = options.with_mapping(path);
    }

    for archive in &archives {
        let report = import_archive(archive, &options)?;
        println!(
            "Imported {} into {} (generation {})",
            report.archive,
            report.store.display(),
            report.generation
        );
        for (collection, rows) in &report.row_counts {
            println!("  {collection}: {rows} rows");
        }
    }
    Ok(())
}

#[derive(Debug, Parser)]
#[command(name = "survey-sync", about = "Import survey archives into SQLite stores")]
struct Arguments {
    /// Survey archives to import, in order
    #[arg(value_name = "archive", required = true)]
    archives: Vec<PathBuf>,
    /// Directory holding the per-generation stores
    #[arg(short, long, value_name = "path", default_value = ".")]
    workspace: PathBuf,
    /// Mapping specification file (defaults to the embedded specification)
    #[arg(short, long, value_name = "path")]
    mapping: Option<PathBuf>,
    /// Refuse archives whose checksum was already imported
    #[arg(long)]
    reject_duplicates: bool,
}
