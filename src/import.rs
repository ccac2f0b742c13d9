//! Orchestration of one archive import from zip to committed transaction.
//!
//! The importer strings the other modules together: extract the archive,
//! load the mapping specification, resolve the schema generation, map every
//! mapped table in parent-before-child order, then write all records and the
//! audit entry inside a single exclusive transaction. Any failure before the
//! commit leaves the store exactly as it was.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use thiserror::Error;

use crate::archive::{extract_archive, ArchiveError, ExtractedArchive};
use crate::engine::{EngineError, KeyAllocator, MappingEngine};
use crate::mapping::{MappingSpec, MappingSpecError};
use crate::parse::TypedRows;
use crate::registry::{resolve_generation, store_path, GenerationHandle, SchemaError};
use crate::store::{
    CollectionBatch, ImportAudit, SqliteBackend, StorageBackend, StoreError,
};

/// Errors raised while importing one archive.
#[derive(Debug, Error)]
pub enum ImportError {
    /// The archive could not be opened, extracted, or described.
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    /// The mapping specification could not be loaded or validated.
    #[error(transparent)]
    Mapping(#[from] MappingSpecError),
    /// The schema generation could not be resolved.
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// A source row failed to parse or map.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// The storage backend failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The archive bytes could not be read for checksumming.
    #[error("failed to read archive {path:?} for checksumming")]
    Checksum {
        /// Archive location.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The archive was already imported and duplicate rejection is on.
    #[error("archive {archive:?} was already imported as {previous:?}")]
    DuplicateArchive {
        /// Archive being imported.
        archive: String,
        /// Archive name recorded for the earlier import.
        previous: String,
    },
}

/// Import configuration.
///
/// # Examples
///
/// ```
/// use survey_sync::ImportOptions;
///
/// let options = ImportOptions::new("/var/lib/surveys")
///     .with_reject_duplicates(true);
/// assert!(options.reject_duplicates());
/// ```
#[derive(Debug, Clone)]
pub struct ImportOptions {
    workspace: PathBuf,
    mapping: Option<PathBuf>,
    reject_duplicates: bool,
}

impl ImportOptions {
    /// Options targeting a workspace directory, with the embedded mapping
    /// specification and duplicate archives accepted.
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            mapping: None,
            reject_duplicates: false,
        }
    }

    /// Load the mapping specification from a file instead of the embedded
    /// default.
    #[must_use]
    pub fn with_mapping(mut self, path: impl Into<PathBuf>) -> Self {
        self.mapping = Some(path.into());
        self
    }

    /// Reject archives whose checksum matches an earlier import.
    #[must_use]
    pub fn with_reject_duplicates(mut self, reject: bool) -> Self {
        self.reject_duplicates = reject;
        self
    }

    /// Workspace directory holding the per-generation stores.
    #[must_use]
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Whether duplicate archives are rejected.
    #[must_use]
    pub fn reject_duplicates(&self) -> bool {
        self.reject_duplicates
    }
}

/// Summary of one committed import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReport {
    /// File name of the imported archive.
    pub archive: String,
    /// Store the archive was written to.
    pub store: PathBuf,
    /// Schema generation the store belongs to.
    pub generation: u32,
    /// BLAKE3 checksum of the archive bytes.
    pub checksum: String,
    /// Rows written per feature collection.
    pub row_counts: BTreeMap<String, u64>,
}

/// Import one survey archive into the workspace.
///
/// Resolves the store from the archive's protocol descriptor, creating the
/// schema generation when the store is new, then maps and writes every table
/// the mapping specification names. The write is atomic per archive.
pub fn import_archive(
    archive: &Path,
    options: &ImportOptions,
) -> Result<ImportReport, ImportError> {
    let checksum = checksum_archive(archive)?;
    let extracted = extract_archive(archive)?;
    let spec = match &options.mapping {
        Some(path) => MappingSpec::from_path(path)?,
        None => MappingSpec::embedded_default()?,
    };

    fs::create_dir_all(&options.workspace).map_err(|source| StoreError::CreateDirectory {
        path: options.workspace.clone(),
        source,
    })?;
    let store = store_path(&options.workspace, &extracted.descriptor);
    let mut backend = SqliteBackend::open(&store)?;

    let archive_name = display_name(archive);
    if options.reject_duplicates {
        if let Some(previous) = backend.previous_import(&checksum)? {
            return Err(ImportError::DuplicateArchive {
                archive: archive_name,
                previous,
            });
        }
    }

    let handle = resolve_generation(&mut backend, &extracted.descriptor, &spec)?;
    let batches = map_archive(&extracted, &handle)?;
    let row_counts: BTreeMap<String, u64> = batches
        .iter()
        .map(|batch| (batch.collection.clone(), batch.records.len() as u64))
        .collect();

    let audit = ImportAudit {
        archive: archive_name.clone(),
        checksum: checksum.clone(),
        row_counts: row_counts.clone(),
    };
    write_batches(&mut backend, &handle, &batches, &audit)?;

    info!(
        "imported {archive_name} into {store:?}: {} rows across {} collections",
        row_counts.values().sum::<u64>(),
        row_counts.len()
    );
    Ok(ImportReport {
        archive: archive_name,
        store,
        generation: handle.generation,
        checksum,
        row_counts,
    })
}

fn checksum_archive(path: &Path) -> Result<String, ImportError> {
    let bytes = fs::read(path).map_err(|source| ImportError::Checksum {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |name| {
            name.to_string_lossy().into_owned()
        })
}

/// Map every planned table to a collection batch, parents first.
///
/// A mapped table with no CSV in the archive yields an empty batch; field
/// crews do not always record every dataset.
fn map_archive(
    extracted: &ExtractedArchive,
    handle: &GenerationHandle,
) -> Result<Vec<CollectionBatch>, EngineError> {
    let mut engine = MappingEngine::new();
    let mut batches = Vec::with_capacity(handle.plans.len());
    for plan in &handle.plans {
        let start = handle
            .start_keys
            .get(&plan.def.name)
            .copied()
            .unwrap_or_default();
        let mut allocator = KeyAllocator::new(start);
        let batch = match extracted.table_path(&plan.source) {
            Some(csv) => {
                let rows = TypedRows::from_path(&plan.source, csv, &plan.fields)?;
                engine.map_table(plan, rows, &mut allocator)?
            }
            None => {
                warn!(
                    "archive carries no CSV for table {:?}; importing zero rows",
                    plan.source
                );
                CollectionBatch {
                    collection: plan.def.name.clone(),
                    records: Vec::new(),
                }
            }
        };
        batches.push(batch);
    }
    Ok(batches)
}

/// Write every batch and the audit entry inside one transaction.
///
/// On any failure the transaction is rolled back before the error is
/// returned; a rollback failure is logged but does not mask the original
/// error.
fn write_batches<B: StorageBackend>(
    backend: &mut B,
    handle: &GenerationHandle,
    batches: &[CollectionBatch],
    audit: &ImportAudit,
) -> Result<(), StoreError> {
    backend.begin_import()?;
    let outcome = (|| {
        for (plan, batch) in handle.plans.iter().zip(batches) {
            for record in &batch.records {
                backend.insert_record(&plan.def, record)?;
            }
        }
        backend.record_import(audit)
    })();
    match outcome {
        Ok(()) => backend.commit_import(),
        Err(error) => {
            if let Err(rollback) = backend.rollback_import() {
                warn!("rollback after failed import also failed: {rollback}");
            }
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn options_default_to_embedded_mapping() {
        let options = ImportOptions::new("workspace");
        assert!(options.mapping.is_none());
        assert!(!options.reject_duplicates());
        assert_eq!(options.workspace(), Path::new("workspace"));
    }

    #[rstest]
    fn options_builders_compose() {
        let options = ImportOptions::new("workspace")
            .with_mapping("custom.json")
            .with_reject_duplicates(true);
        assert_eq!(options.mapping.as_deref(), Some(Path::new("custom.json")));
        assert!(options.reject_duplicates());
    }
}
