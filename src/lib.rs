//! Schema-driven import of survey archives into relational stores.
//!
//! A survey archive is a zip carrying a protocol descriptor and one CSV per
//! recorded table. This crate extracts the archive, types the rows against
//! the descriptor, maps them through a declarative specification into
//! geometry-aware feature collections, and writes each archive as a single
//! atomic transaction into the SQLite store for the protocol's schema
//! generation. Stores are keyed by protocol major version and never
//! migrated; a changed major version opens a new store.
//!
//! The high-level entry point is [`import_archive`]:
//!
//! ```no_run
//! use survey_sync::{import_archive, ImportOptions};
//!
//! # fn main() -> Result<(), survey_sync::ImportError> {
//! let options = ImportOptions::new("surveys").with_reject_duplicates(true);
//! let report = import_archive("shorebird-2026-08.zip".as_ref(), &options)?;
//! println!("{} rows", report.row_counts.values().sum::<u64>());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod archive;
pub mod engine;
pub mod import;
pub mod mapping;
pub mod parse;
pub mod protocol;
pub mod registry;
pub mod store;

pub use archive::{extract_archive, ArchiveError, ExtractedArchive};
pub use engine::{EngineError, KeyAllocator, MapError, MappingEngine};
pub use import::{import_archive, ImportError, ImportOptions, ImportReport};
pub use mapping::{MappingSpec, MappingSpecError};
pub use parse::{Row, RowParseError, TypedRows, Value};
pub use protocol::{DescriptorError, FieldType, ProtocolDescriptor, ProtocolVersion};
pub use registry::{resolve_generation, store_path, GenerationHandle, SchemaError};
pub use store::{SqliteBackend, StorageBackend, StoreError};
