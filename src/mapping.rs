//! The declarative mapping specification: which target collection each
//! source table lands in, how fields are transformed on the way, and which
//! parent relationship supplies the foreign key.
//!
//! The specification is data, not code. It is parsed and validated fully
//! before any archive is touched; an invalid document never reaches the
//! registry or the engine. A default specification is embedded in the
//! binary and can be overridden with an external file, mirroring the
//! bundled `csv.json` of the original sync tool.

use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use thiserror::Error;

use crate::protocol::FieldType;

/// The mapping specification shipped inside the binary.
const EMBEDDED_SPEC: &str = include_str!("default_mapping.json");

/// Errors raised while loading or validating a mapping specification.
#[derive(Debug, Error)]
pub enum MappingSpecError {
    /// The override file could not be read.
    #[error("failed to read mapping specification at {path:?}")]
    Read {
        /// Override file location.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The document was not valid JSON.
    #[error("mapping specification is not valid JSON")]
    Syntax {
        /// Decoding failure reported by `serde_json`.
        #[source]
        source: serde_json::Error,
    },
    /// The specification maps no tables at all.
    #[error("mapping specification maps no tables")]
    Empty,
    /// Two table mappings read from the same source table.
    #[error("source table {table:?} is mapped more than once")]
    DuplicateSource {
        /// Repeated source table name.
        table: String,
    },
    /// Two table mappings write to the same target collection.
    #[error("target collection {name:?} is mapped more than once")]
    DuplicateTarget {
        /// Repeated target collection name.
        name: String,
    },
    /// A target name is not a plain identifier.
    #[error("{name:?} is not a valid target identifier (letters, digits, underscores)")]
    InvalidName {
        /// Rejected name.
        name: String,
    },
    /// A rule writes to a column the store itself provides.
    #[error("table {table:?} maps target field {field:?}, which the store reserves")]
    ReservedField {
        /// Source table name.
        table: String,
        /// Reserved target field name.
        field: String,
    },
    /// Two rules of one table write to the same target field.
    #[error("table {table:?} maps target field {field:?} more than once")]
    DuplicateField {
        /// Source table name.
        table: String,
        /// Repeated target field name.
        field: String,
    },
    /// A constant rule carries a value that cannot become a column.
    #[error("table {table:?} constant {field:?} must be a non-null scalar")]
    InvalidConstant {
        /// Source table name.
        table: String,
        /// Target field of the offending rule.
        field: String,
    },
    /// A parent relationship names a source table that is not mapped.
    #[error("table {table:?} declares unmapped parent {parent:?}")]
    UnknownParent {
        /// Child source table name.
        table: String,
        /// Missing parent source table name.
        parent: String,
    },
    /// A table declares itself as its own parent.
    #[error("table {table:?} declares itself as its parent")]
    SelfParent {
        /// Offending source table name.
        table: String,
    },
    /// The parent relationships form a cycle.
    #[error("parent relationships form a cycle through table {table:?}")]
    Cycle {
        /// A table on the cycle.
        table: String,
    },
}

/// Geometry construction kinds a mapping may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeometryKind {
    /// A point built from the table's declared coordinate pair.
    Point,
}

/// One field transformation rule.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRule {
    /// Copy a source field, optionally renaming it.
    Copy {
        /// Source field name.
        from: String,
        /// Target field name; defaults to the source name.
        #[serde(default)]
        to: Option<String>,
    },
    /// Copy a source field while casting it to another type.
    Cast {
        /// Source field name.
        from: String,
        /// Target field name; defaults to the source name.
        #[serde(default)]
        to: Option<String>,
        /// Target logical type.
        #[serde(rename = "type")]
        field_type: FieldType,
    },
    /// Emit a constant value into every record.
    Constant {
        /// Target field name.
        to: String,
        /// Constant scalar; its JSON type picks the column type.
        value: serde_json::Value,
    },
    /// Concatenate rendered source fields into one text field.
    Concat {
        /// Target field name.
        to: String,
        /// Source fields to render and join, in order.
        fields: Vec<String>,
        /// Separator between rendered fields.
        #[serde(default = "default_separator")]
        separator: String,
    },
}

fn default_separator() -> String {
    String::from(" ")
}

impl FieldRule {
    /// The target field this rule writes.
    pub fn target_field(&self) -> &str {
        match self {
            Self::Copy { from, to } | Self::Cast { from, to, .. } => {
                to.as_deref().unwrap_or(from)
            }
            Self::Constant { to, .. } | Self::Concat { to, .. } => to,
        }
    }
}

/// The parent relationship of a mapped table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ParentRule {
    /// Source name of the parent table.
    pub table: String,
    /// Source field on parent rows carrying the reference key.
    pub parent_key: String,
    /// Source field on child rows naming their parent.
    pub child_key: String,
    /// Target field receiving the parent's surrogate key.
    pub fk_field: String,
}

/// Mapping of one source table into one target feature collection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TableMapping {
    /// Source table name as declared by the protocol.
    pub source: String,
    /// Target feature collection name.
    pub target: String,
    /// Ordered field transformation rules.
    pub fields: Vec<FieldRule>,
    /// Geometry construction request, if any.
    #[serde(default)]
    pub geometry: Option<GeometryKind>,
    /// Parent relationship, if any.
    #[serde(default)]
    pub parent: Option<ParentRule>,
}

/// A fully validated mapping specification.
///
/// Construction always validates: duplicate sources or targets, invalid
/// identifiers, unknown parents, and relationship cycles are rejected before
/// the specification can be used.
#[derive(Debug, Clone)]
pub struct MappingSpec {
    tables: Vec<TableMapping>,
    order: Vec<usize>,
}

#[derive(Debug, Deserialize)]
struct RawSpec {
    tables: Vec<TableMapping>,
}

impl MappingSpec {
    /// Validate a set of table mappings into a specification.
    pub fn new(tables: Vec<TableMapping>) -> Result<Self, MappingSpecError> {
        let order = validate(&tables)?;
        Ok(Self { tables, order })
    }

    /// Parse a specification from a JSON document.
    pub fn from_json(document: &str) -> Result<Self, MappingSpecError> {
        let raw: RawSpec = serde_json::from_str(document)
            .map_err(|source| MappingSpecError::Syntax { source })?;
        Self::new(raw.tables)
    }

    /// Load a specification from an override file.
    pub fn from_path(path: &Path) -> Result<Self, MappingSpecError> {
        let document = fs::read_to_string(path).map_err(|source| MappingSpecError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&document)
    }

    /// The specification embedded in the binary.
    ///
    /// # Panics
    /// Never panics at runtime; the embedded document is covered by a test.
    pub fn embedded_default() -> Result<Self, MappingSpecError> {
        Self::from_json(EMBEDDED_SPEC)
    }

    /// All table mappings in document order.
    pub fn tables(&self) -> &[TableMapping] {
        &self.tables
    }

    /// Table mappings in dependency order: every parent table precedes all
    /// of its children.
    pub fn ordered_tables(&self) -> impl Iterator<Item = &TableMapping> {
        self.order.iter().filter_map(|&index| self.tables.get(index))
    }

    /// Look up a mapping by its source table name.
    pub fn table(&self, source: &str) -> Option<&TableMapping> {
        self.tables.iter().find(|table| table.source == source)
    }
}

fn validate(tables: &[TableMapping]) -> Result<Vec<usize>, MappingSpecError> {
    if tables.is_empty() {
        return Err(MappingSpecError::Empty);
    }

    let mut sources = HashSet::new();
    let mut targets = HashSet::new();
    for table in tables {
        if !sources.insert(table.source.as_str()) {
            return Err(MappingSpecError::DuplicateSource {
                table: table.source.clone(),
            });
        }
        if !targets.insert(table.target.as_str()) {
            return Err(MappingSpecError::DuplicateTarget {
                name: table.target.clone(),
            });
        }
        validate_table(table)?;
    }

    for table in tables {
        if let Some(parent) = &table.parent {
            if parent.table == table.source {
                return Err(MappingSpecError::SelfParent {
                    table: table.source.clone(),
                });
            }
            if !sources.contains(parent.table.as_str()) {
                return Err(MappingSpecError::UnknownParent {
                    table: table.source.clone(),
                    parent: parent.table.clone(),
                });
            }
        }
    }

    dependency_order(tables)
}

/// Column names every feature collection carries on its own: the surrogate
/// key and the geometry ordinate pair. No rule may write to them.
const RESERVED_FIELDS: [&str; 3] = ["record_id", "geom_x", "geom_y"];

fn validate_table(table: &TableMapping) -> Result<(), MappingSpecError> {
    ensure_identifier(&table.target)?;
    let mut seen = HashSet::new();
    for rule in &table.fields {
        let field = rule.target_field();
        ensure_identifier(field)?;
        ensure_unreserved(table, field)?;
        if !seen.insert(field.to_owned()) {
            return Err(MappingSpecError::DuplicateField {
                table: table.source.clone(),
                field: field.to_owned(),
            });
        }
        if let FieldRule::Constant { to, value } = rule {
            let scalar = value.is_string() || value.is_boolean() || value.is_number();
            if !scalar {
                return Err(MappingSpecError::InvalidConstant {
                    table: table.source.clone(),
                    field: to.clone(),
                });
            }
        }
    }
    if let Some(parent) = &table.parent {
        ensure_identifier(&parent.fk_field)?;
        ensure_unreserved(table, &parent.fk_field)?;
        if !seen.insert(parent.fk_field.clone()) {
            return Err(MappingSpecError::DuplicateField {
                table: table.source.clone(),
                field: parent.fk_field.clone(),
            });
        }
    }
    Ok(())
}

/// SQLite identifiers compare case-insensitively, so `Record_ID` collides
/// with the surrogate key just as `record_id` does.
fn ensure_unreserved(table: &TableMapping, field: &str) -> Result<(), MappingSpecError> {
    if RESERVED_FIELDS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(field))
    {
        return Err(MappingSpecError::ReservedField {
            table: table.source.clone(),
            field: field.to_owned(),
        });
    }
    Ok(())
}

/// Target names end up inside SQL statements, so only plain identifiers are
/// accepted.
fn ensure_identifier(name: &str) -> Result<(), MappingSpecError> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .is_some_and(|head| head.is_ascii_alphabetic() || head == '_');
    let valid_tail = chars.all(|tail| tail.is_ascii_alphanumeric() || tail == '_');
    if valid_head && valid_tail {
        Ok(())
    } else {
        Err(MappingSpecError::InvalidName {
            name: name.to_owned(),
        })
    }
}

/// Kahn's algorithm over the parent edges; document order breaks ties so the
/// output is stable.
fn dependency_order(tables: &[TableMapping]) -> Result<Vec<usize>, MappingSpecError> {
    let index_of: HashMap<&str, usize> = tables
        .iter()
        .enumerate()
        .map(|(index, table)| (table.source.as_str(), index))
        .collect();

    let mut pending: Vec<usize> = (0..tables.len()).collect();
    let mut placed = vec![false; tables.len()];
    let mut order = Vec::with_capacity(tables.len());

    while !pending.is_empty() {
        let mut progressed = false;
        pending.retain(|&index| {
            let ready = match tables.get(index).and_then(|table| table.parent.as_ref()) {
                Some(parent) => index_of
                    .get(parent.table.as_str())
                    .is_some_and(|&parent_index| placed[parent_index]),
                None => true,
            };
            if ready {
                order.push(index);
                placed[index] = true;
                progressed = true;
            }
            !ready
        });
        if !progressed {
            let table = pending
                .first()
                .and_then(|&index| tables.get(index))
                .map_or_else(String::new, |table| table.source.clone());
            return Err(MappingSpecError::Cycle { table });
        }
    }

    Ok(order)
}
