//! SQLite-backed target store, one database file per schema generation.

use std::{
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use crate::parse::Value;
use crate::protocol::FieldType;

use super::{
    CollectionDef, ColumnDef, GenerationInfo, ImportAudit, RelationshipDef, StorageBackend,
    StoreError, TargetRecord,
};

/// SQLite implementation of the storage backend capability.
///
/// Feature collections become tables with a `record_id INTEGER PRIMARY KEY`
/// surrogate key, typed columns, paired `geom_x`/`geom_y` ordinates, and a
/// foreign key to their parent's surrogate key. The logical schema is also
/// recorded in metadata tables so reuse can be validated exactly, since
/// SQLite's physical types collapse the date and boolean logical types.
#[derive(Debug)]
pub struct SqliteBackend {
    connection: Connection,
    path: PathBuf,
    txn_open: bool,
}

impl SqliteBackend {
    /// Open (or create) the store file and enable foreign keys.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let connection = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        connection
            .pragma_update(None, "foreign_keys", true)
            .map_err(|source| StoreError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            connection,
            path: path.to_path_buf(),
            txn_open: false,
        })
    }

    /// Location of the store on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

}

fn sql_type(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Integer | FieldType::Boolean => "INTEGER",
        FieldType::Real => "REAL",
        FieldType::Text | FieldType::Date => "TEXT",
    }
}

fn logical_type(name: &str) -> Option<FieldType> {
    match name {
        "integer" => Some(FieldType::Integer),
        "real" => Some(FieldType::Real),
        "text" => Some(FieldType::Text),
        "date" => Some(FieldType::Date),
        "boolean" => Some(FieldType::Boolean),
        _ => None,
    }
}

fn sql_value(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Integer(value) => rusqlite::types::Value::Integer(*value),
        Value::Real(value) => rusqlite::types::Value::Real(*value),
        Value::Text(value) => rusqlite::types::Value::Text(value.clone()),
        Value::Date(value) => {
            rusqlite::types::Value::Text(value.format("%Y-%m-%dT%H:%M:%S").to_string())
        }
        Value::Boolean(value) => rusqlite::types::Value::Integer(i64::from(*value)),
        Value::Null => rusqlite::types::Value::Null,
    }
}

fn collection_ddl(def: &CollectionDef) -> String {
    let mut clauses = vec![String::from("record_id INTEGER PRIMARY KEY")];
    for column in &def.columns {
        let nullability = if column.nullable { "" } else { " NOT NULL" };
        clauses.push(format!(
            "\"{}\" {}{nullability}",
            column.name,
            sql_type(column.field_type)
        ));
    }
    if def.geometry {
        clauses.push(String::from("geom_x REAL NOT NULL"));
        clauses.push(String::from("geom_y REAL NOT NULL"));
    }
    if let Some(relationship) = &def.relationship {
        clauses.push(format!(
            "FOREIGN KEY (\"{}\") REFERENCES \"{}\"(record_id)",
            relationship.fk_field, relationship.parent
        ));
    }
    format!("CREATE TABLE \"{}\" ({})", def.name, clauses.join(", "))
}

fn insert_sql(def: &CollectionDef) -> String {
    let mut columns = vec![String::from("record_id")];
    columns.extend(def.columns.iter().map(|column| format!("\"{}\"", column.name)));
    if def.geometry {
        columns.push(String::from("geom_x"));
        columns.push(String::from("geom_y"));
    }
    let placeholders: Vec<String> = (1..=columns.len()).map(|n| format!("?{n}")).collect();
    format!(
        "INSERT INTO \"{}\" ({}) VALUES ({})",
        def.name,
        columns.join(", "),
        placeholders.join(", ")
    )
}

fn unix_timestamp() -> Result<i64, StoreError> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|err| StoreError::Metadata {
            step: "read clock",
            source: rusqlite::Error::ToSqlConversionFailure(Box::new(err)),
        })?;
    i64::try_from(duration.as_secs()).map_err(|err| StoreError::Metadata {
        step: "read clock",
        source: rusqlite::Error::ToSqlConversionFailure(Box::new(err)),
    })
}

impl StorageBackend for SqliteBackend {
    fn schema_exists(&self) -> Result<bool, StoreError> {
        let found: Option<String> = self
            .connection
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'generation_info'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|source| StoreError::Metadata {
                step: "probe generation_info",
                source,
            })?;
        Ok(found.is_some())
    }

    fn create_schema(
        &mut self,
        info: &GenerationInfo,
        collections: &[CollectionDef],
    ) -> Result<(), StoreError> {
        let created_at = unix_timestamp()?;
        let transaction =
            self.connection
                .transaction()
                .map_err(|source| StoreError::Metadata {
                    step: "begin schema transaction",
                    source,
                })?;

        // Metadata tables are created inside the transaction so a failing
        // collection statement rolls the whole generation back, leaving the
        // store as empty as it was found.
        transaction
            .execute_batch(
                "CREATE TABLE generation_info (
                    major INTEGER NOT NULL CHECK (major >= 0),
                    protocol_name TEXT NOT NULL,
                    spatial_reference INTEGER NOT NULL,
                    created_at INTEGER NOT NULL
                );
                CREATE TABLE collections (
                    ordinal INTEGER NOT NULL,
                    name TEXT PRIMARY KEY,
                    geometry INTEGER NOT NULL,
                    parent TEXT,
                    fk_field TEXT
                ) WITHOUT ROWID;
                CREATE TABLE collection_fields (
                    collection TEXT NOT NULL,
                    position INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    logical_type TEXT NOT NULL,
                    nullable INTEGER NOT NULL,
                    PRIMARY KEY (collection, position)
                ) WITHOUT ROWID;
                CREATE TABLE imports (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    archive TEXT NOT NULL,
                    checksum TEXT NOT NULL,
                    row_counts TEXT NOT NULL,
                    imported_at INTEGER NOT NULL
                );",
            )
            .map_err(|source| StoreError::Metadata {
                step: "create metadata tables",
                source,
            })?;

        transaction
            .execute(
                "INSERT INTO generation_info (major, protocol_name, spatial_reference, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![info.major, info.protocol_name, info.spatial_reference, created_at],
            )
            .map_err(|source| StoreError::Metadata {
                step: "record generation_info",
                source,
            })?;

        for (ordinal, def) in collections.iter().enumerate() {
            transaction
                .execute(&collection_ddl(def), [])
                .map_err(|source| StoreError::Define {
                    collection: def.name.clone(),
                    source,
                })?;
            transaction
                .execute(
                    "INSERT INTO collections (ordinal, name, geometry, parent, fk_field)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        ordinal as i64,
                        def.name,
                        def.geometry,
                        def.relationship.as_ref().map(|rel| rel.parent.clone()),
                        def.relationship.as_ref().map(|rel| rel.fk_field.clone()),
                    ],
                )
                .map_err(|source| StoreError::Metadata {
                    step: "record collection",
                    source,
                })?;
            for (position, column) in def.columns.iter().enumerate() {
                transaction
                    .execute(
                        "INSERT INTO collection_fields
                             (collection, position, name, logical_type, nullable)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            def.name,
                            position as i64,
                            column.name,
                            column.field_type.to_string(),
                            column.nullable,
                        ],
                    )
                    .map_err(|source| StoreError::Metadata {
                        step: "record collection field",
                        source,
                    })?;
            }
        }

        transaction
            .commit()
            .map_err(|source| StoreError::Metadata {
                step: "commit schema transaction",
                source,
            })
    }

    fn read_schema(&self) -> Result<(GenerationInfo, Vec<CollectionDef>), StoreError> {
        let info = self
            .connection
            .query_row(
                "SELECT major, protocol_name, spatial_reference FROM generation_info LIMIT 1",
                [],
                |row| {
                    Ok(GenerationInfo {
                        major: row.get(0)?,
                        protocol_name: row.get(1)?,
                        spatial_reference: row.get(2)?,
                    })
                },
            )
            .map_err(|source| StoreError::Metadata {
                step: "read generation_info",
                source,
            })?;

        let mut statement = self
            .connection
            .prepare(
                "SELECT name, geometry, parent, fk_field FROM collections ORDER BY ordinal",
            )
            .map_err(|source| StoreError::Metadata {
                step: "read collections",
                source,
            })?;
        let collections = statement
            .query_map([], |row| {
                let parent: Option<String> = row.get(2)?;
                let fk_field: Option<String> = row.get(3)?;
                Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?, parent, fk_field))
            })
            .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
            .map_err(|source| StoreError::Metadata {
                step: "read collections",
                source,
            })?;

        let mut defs = Vec::with_capacity(collections.len());
        for (name, geometry, parent, fk_field) in collections {
            let columns = self.read_columns(&name)?;
            let relationship = match (parent, fk_field) {
                (Some(parent), Some(fk_field)) => Some(RelationshipDef { parent, fk_field }),
                _ => None,
            };
            defs.push(CollectionDef {
                name,
                columns,
                geometry,
                relationship,
            });
        }
        Ok((info, defs))
    }

    fn current_max_key(&self, collection: &str) -> Result<i64, StoreError> {
        self.connection
            .query_row(
                &format!("SELECT COALESCE(MAX(record_id), 0) FROM \"{collection}\""),
                [],
                |row| row.get(0),
            )
            .map_err(|source| StoreError::Metadata {
                step: "read max surrogate key",
                source,
            })
    }

    fn previous_import(&self, checksum: &str) -> Result<Option<String>, StoreError> {
        // A store created by this import has no schema yet, so no audit
        // table either; that simply means nothing was imported before.
        if !self.schema_exists()? {
            return Ok(None);
        }
        self.connection
            .query_row(
                "SELECT archive FROM imports WHERE checksum = ?1 LIMIT 1",
                params![checksum],
                |row| row.get(0),
            )
            .optional()
            .map_err(|source| StoreError::Metadata {
                step: "probe previous imports",
                source,
            })
    }

    fn begin_import(&mut self) -> Result<(), StoreError> {
        self.connection
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(|source| StoreError::Begin { source })?;
        self.txn_open = true;
        Ok(())
    }

    fn insert_record(
        &mut self,
        def: &CollectionDef,
        record: &TargetRecord,
    ) -> Result<(), StoreError> {
        let failed = |source| StoreError::Insert {
            collection: def.name.clone(),
            key: record.key,
            source,
        };
        let mut parameters = Vec::with_capacity(def.columns.len() + 3);
        parameters.push(rusqlite::types::Value::Integer(record.key));
        parameters.extend(record.values.iter().map(sql_value));
        if def.geometry {
            let (x, y) = record
                .geometry
                .map_or((rusqlite::types::Value::Null, rusqlite::types::Value::Null), |coord| {
                    (
                        rusqlite::types::Value::Real(coord.x),
                        rusqlite::types::Value::Real(coord.y),
                    )
                });
            parameters.push(x);
            parameters.push(y);
        }
        let mut statement = self
            .connection
            .prepare_cached(&insert_sql(def))
            .map_err(failed)?;
        statement
            .execute(params_from_iter(parameters))
            .map(|_| ())
            .map_err(failed)
    }

    fn record_import(&mut self, audit: &ImportAudit) -> Result<(), StoreError> {
        let imported_at = unix_timestamp()?;
        let row_counts =
            serde_json::to_string(&audit.row_counts).map_err(|err| StoreError::Metadata {
                step: "serialise row counts",
                source: rusqlite::Error::ToSqlConversionFailure(Box::new(err)),
            })?;
        self.connection
            .execute(
                "INSERT INTO imports (archive, checksum, row_counts, imported_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![audit.archive, audit.checksum, row_counts, imported_at],
            )
            .map(|_| ())
            .map_err(|source| StoreError::Metadata {
                step: "record import",
                source,
            })
    }

    fn commit_import(&mut self) -> Result<(), StoreError> {
        if !self.txn_open {
            return Err(StoreError::NoTransaction);
        }
        self.connection
            .execute_batch("COMMIT")
            .map_err(|source| StoreError::Commit { source })?;
        self.txn_open = false;
        Ok(())
    }

    fn rollback_import(&mut self) -> Result<(), StoreError> {
        if !self.txn_open {
            return Err(StoreError::NoTransaction);
        }
        self.connection
            .execute_batch("ROLLBACK")
            .map_err(|source| StoreError::Rollback { source })?;
        self.txn_open = false;
        Ok(())
    }
}

impl SqliteBackend {
    fn read_columns(&self, collection: &str) -> Result<Vec<ColumnDef>, StoreError> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT name, logical_type, nullable FROM collection_fields
                 WHERE collection = ?1 ORDER BY position",
            )
            .map_err(|source| StoreError::Metadata {
                step: "read collection fields",
                source,
            })?;
        let rows = statement
            .query_map(params![collection], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                ))
            })
            .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
            .map_err(|source| StoreError::Metadata {
                step: "read collection fields",
                source,
            })?;
        rows.into_iter()
            .map(|(name, type_name, nullable)| {
                let field_type =
                    logical_type(&type_name).ok_or_else(|| StoreError::Metadata {
                        step: "decode logical type",
                        source: rusqlite::Error::InvalidColumnName(type_name),
                    })?;
                Ok(ColumnDef {
                    name,
                    field_type,
                    nullable,
                })
            })
            .collect()
    }
}
