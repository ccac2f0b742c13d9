//! Extraction of survey archives into their protocol descriptor and tabular
//! datasets.

use std::{
    collections::BTreeMap,
    fs::{self, File},
    path::{Path, PathBuf},
};

use log::debug;
use tempfile::TempDir;
use thiserror::Error;
use zip::result::ZipError;

use crate::protocol::{DescriptorError, ProtocolDescriptor};

/// Descriptor file names recognised inside an archive, probed in order. The
/// `.obsprot` spelling is kept for archives produced by legacy survey apps.
const DESCRIPTOR_NAMES: [&str; 2] = ["protocol.json", "protocol.obsprot"];

/// Errors raised while opening and extracting a survey archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The archive file could not be read at all.
    #[error("failed to open survey archive at {path:?}")]
    Open {
        /// Archive location.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The archive container is unreadable or truncated.
    #[error("survey archive at {path:?} is corrupt")]
    Corrupt {
        /// Archive location.
        path: PathBuf,
        /// Underlying zip failure.
        #[source]
        source: ZipError,
    },
    /// Extracting the archive contents failed.
    #[error("failed to extract survey archive {path:?}")]
    Extract {
        /// Archive location.
        path: PathBuf,
        /// Underlying zip failure.
        #[source]
        source: ZipError,
    },
    /// Creating the temporary extraction directory failed.
    #[error("failed to create extraction directory for {path:?}")]
    Workspace {
        /// Archive location.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The archive carries no protocol descriptor.
    #[error("survey archive {path:?} carries no protocol descriptor")]
    MissingProtocol {
        /// Archive location.
        path: PathBuf,
    },
    /// The protocol descriptor is present but invalid.
    #[error("survey archive {path:?} carries an invalid protocol descriptor")]
    Descriptor {
        /// Archive location.
        path: PathBuf,
        /// Underlying descriptor failure.
        #[source]
        source: DescriptorError,
    },
}

/// A fully extracted survey archive: the protocol descriptor plus one CSV
/// file per tabular dataset, held in a temporary directory that lives as
/// long as this value.
#[derive(Debug)]
pub struct ExtractedArchive {
    /// Parsed protocol descriptor.
    pub descriptor: ProtocolDescriptor,
    tables: BTreeMap<String, PathBuf>,
    _extraction_dir: TempDir,
}

impl ExtractedArchive {
    /// Path of the CSV file for a named table, if the archive carries it.
    pub fn table_path(&self, table: &str) -> Option<&Path> {
        self.tables.get(table).map(PathBuf::as_path)
    }

    /// Names of the tabular datasets found in the archive, sorted.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}

/// Open a survey archive, validate its structure, and extract its contents.
///
/// The archive must be a zip container with one protocol descriptor file and
/// any number of `<table>.csv` datasets. On any failure nothing is handed
/// downstream.
///
/// # Examples
/// ```no_run
/// use std::path::Path;
/// use survey_sync::archive::extract_archive;
///
/// # fn main() -> Result<(), survey_sync::archive::ArchiveError> {
/// let archive = extract_archive(Path::new("shorebirds-2024.zip"))?;
/// println!("protocol {}", archive.descriptor.version);
/// # Ok(())
/// # }
/// ```
pub fn extract_archive(path: &Path) -> Result<ExtractedArchive, ArchiveError> {
    let file = File::open(path).map_err(|source| ArchiveError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let mut container = zip::ZipArchive::new(file).map_err(|source| ArchiveError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;

    let extraction_dir = TempDir::new().map_err(|source| ArchiveError::Workspace {
        path: path.to_path_buf(),
        source,
    })?;
    container
        .extract(extraction_dir.path())
        .map_err(|source| match source {
            ZipError::Io(source) => ArchiveError::Workspace {
                path: path.to_path_buf(),
                source,
            },
            source => ArchiveError::Extract {
                path: path.to_path_buf(),
                source,
            },
        })?;

    let descriptor = load_descriptor(path, extraction_dir.path())?;
    let tables = collect_tables(path, extraction_dir.path())?;
    debug!(
        "extracted archive {path:?}: protocol {} with {} dataset(s)",
        descriptor.version,
        tables.len()
    );

    Ok(ExtractedArchive {
        descriptor,
        tables,
        _extraction_dir: extraction_dir,
    })
}

fn load_descriptor(
    archive_path: &Path,
    extraction_dir: &Path,
) -> Result<ProtocolDescriptor, ArchiveError> {
    for name in DESCRIPTOR_NAMES {
        let candidate = extraction_dir.join(name);
        if !candidate.is_file() {
            continue;
        }
        let document = fs::read_to_string(&candidate).map_err(|source| ArchiveError::Open {
            path: archive_path.to_path_buf(),
            source,
        })?;
        return ProtocolDescriptor::from_json(&document).map_err(|source| {
            ArchiveError::Descriptor {
                path: archive_path.to_path_buf(),
                source,
            }
        });
    }
    Err(ArchiveError::MissingProtocol {
        path: archive_path.to_path_buf(),
    })
}

fn collect_tables(
    archive_path: &Path,
    extraction_dir: &Path,
) -> Result<BTreeMap<String, PathBuf>, ArchiveError> {
    let entries = fs::read_dir(extraction_dir).map_err(|source| ArchiveError::Workspace {
        path: archive_path.to_path_buf(),
        source,
    })?;
    let mut tables = BTreeMap::new();
    for entry in entries {
        let entry = entry.map_err(|source| ArchiveError::Workspace {
            path: archive_path.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let is_csv = path
            .extension()
            .is_some_and(|extension| extension.eq_ignore_ascii_case("csv"));
        if !is_csv {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
            tables.insert(stem.to_owned(), path);
        }
    }
    Ok(tables)
}
