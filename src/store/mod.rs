//! The storage backend capability the registry and writer are written
//! against.
//!
//! The target-store product is abstracted behind [`StorageBackend`]: open or
//! create a store, define feature collections and relationships, read the
//! recorded logical schema back, and run the per-archive transaction. The
//! engine and registry never touch a concrete database API.

mod sqlite;

use std::collections::BTreeMap;
use std::path::PathBuf;

use geo::Coord;
use thiserror::Error;

use crate::parse::Value;
use crate::protocol::FieldType;

pub use sqlite::SqliteBackend;

/// One typed column of a feature collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Logical type.
    pub field_type: FieldType,
    /// Whether null values are permitted.
    pub nullable: bool,
}

/// Parent-child link between two feature collections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipDef {
    /// Parent collection name.
    pub parent: String,
    /// Foreign-key column on the child carrying the parent surrogate key.
    pub fk_field: String,
}

/// Definition of one feature collection within a schema generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionDef {
    /// Collection name.
    pub name: String,
    /// Typed columns, excluding the surrogate key and geometry ordinates.
    pub columns: Vec<ColumnDef>,
    /// Whether the collection carries a geometry column pair.
    pub geometry: bool,
    /// Parent relationship, if any.
    pub relationship: Option<RelationshipDef>,
}

/// Identity of a schema generation recorded in its store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationInfo {
    /// Protocol major version keying this generation.
    pub major: u32,
    /// Protocol name the generation was created for.
    pub protocol_name: String,
    /// EPSG code of all geometry in the store.
    pub spatial_reference: u32,
}

/// One finished record ready for the writer.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetRecord {
    /// Assigned surrogate key.
    pub key: i64,
    /// Values aligned with the collection's [`CollectionDef::columns`].
    pub values: Vec<Value>,
    /// Constructed geometry, when the collection declares one.
    pub geometry: Option<Coord<f64>>,
}

/// All records destined for one feature collection within one import.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionBatch {
    /// Target collection name.
    pub collection: String,
    /// Records in mapping order.
    pub records: Vec<TargetRecord>,
}

/// Audit entry recorded alongside a committed import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportAudit {
    /// File name of the imported archive.
    pub archive: String,
    /// BLAKE3 checksum of the archive bytes.
    pub checksum: String,
    /// Rows written per feature collection.
    pub row_counts: BTreeMap<String, u64>,
}

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Creating the workspace directory failed.
    #[error("failed to create store directory {path:?}")]
    CreateDirectory {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Opening the store failed.
    #[error("failed to open target store at {path:?}")]
    Open {
        /// Store location.
        path: PathBuf,
        /// Source error returned by `rusqlite`.
        #[source]
        source: rusqlite::Error,
    },
    /// A schema definition statement failed.
    #[error("failed to define feature collection {collection:?}")]
    Define {
        /// Collection being created.
        collection: String,
        /// Source error returned by `rusqlite`.
        #[source]
        source: rusqlite::Error,
    },
    /// Reading or writing store metadata failed.
    #[error("store metadata step '{step}' failed")]
    Metadata {
        /// The failing step.
        step: &'static str,
        /// Source error returned by `rusqlite`.
        #[source]
        source: rusqlite::Error,
    },
    /// Beginning the import transaction failed.
    #[error("failed to begin import transaction")]
    Begin {
        /// Source error returned by `rusqlite`.
        #[source]
        source: rusqlite::Error,
    },
    /// Inserting one record failed.
    #[error("failed to insert record {key} into {collection:?}")]
    Insert {
        /// Target collection name.
        collection: String,
        /// Surrogate key of the failing record.
        key: i64,
        /// Source error returned by `rusqlite`.
        #[source]
        source: rusqlite::Error,
    },
    /// Committing the import transaction failed.
    #[error("failed to commit import transaction")]
    Commit {
        /// Source error returned by `rusqlite`.
        #[source]
        source: rusqlite::Error,
    },
    /// Rolling back the import transaction failed.
    #[error("failed to roll back import transaction")]
    Rollback {
        /// Source error returned by `rusqlite`.
        #[source]
        source: rusqlite::Error,
    },
    /// Begin/commit/rollback called outside a live transaction.
    #[error("no import transaction is open")]
    NoTransaction,
}

/// Capability surface of a target store.
///
/// One backend instance is bound to one schema-generation store. The writer
/// holds the sole transaction: [`StorageBackend::begin_import`] through
/// [`StorageBackend::commit_import`] bracket an entire archive, and any
/// failure inside rolls the whole archive back.
pub trait StorageBackend {
    /// Whether the store already carries a schema generation.
    fn schema_exists(&self) -> Result<bool, StoreError>;

    /// Materialise every feature collection, relationship, and metadata
    /// record for a new generation, atomically.
    fn create_schema(
        &mut self,
        info: &GenerationInfo,
        collections: &[CollectionDef],
    ) -> Result<(), StoreError>;

    /// Read the recorded generation identity and logical schema back.
    fn read_schema(&self) -> Result<(GenerationInfo, Vec<CollectionDef>), StoreError>;

    /// Highest surrogate key currently present in a collection, 0 when empty.
    fn current_max_key(&self, collection: &str) -> Result<i64, StoreError>;

    /// Archive name of a previous import with this checksum, if recorded.
    fn previous_import(&self, checksum: &str) -> Result<Option<String>, StoreError>;

    /// Open the exclusive per-archive transaction.
    fn begin_import(&mut self) -> Result<(), StoreError>;

    /// Insert one record inside the open transaction.
    fn insert_record(
        &mut self,
        def: &CollectionDef,
        record: &TargetRecord,
    ) -> Result<(), StoreError>;

    /// Record the import audit entry inside the open transaction.
    fn record_import(&mut self, audit: &ImportAudit) -> Result<(), StoreError>;

    /// Commit the open transaction.
    fn commit_import(&mut self) -> Result<(), StoreError>;

    /// Roll the open transaction back, leaving the store untouched.
    fn rollback_import(&mut self) -> Result<(), StoreError>;
}
