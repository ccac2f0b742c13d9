//! Resolution of a protocol descriptor to a schema generation.
//!
//! The registry computes the generation identifier (the protocol major
//! version), derives the target collection layout from the mapping
//! specification, and either materialises a fresh store or validates that an
//! existing store's recorded schema still matches. Generations are immutable:
//! a mismatch aborts the import, it is never migrated.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::info;
use thiserror::Error;

use crate::mapping::{FieldRule, MappingSpec, TableMapping};
use crate::parse::Value;
use crate::protocol::{FieldDef, FieldType, ProtocolDescriptor, TableDef};
use crate::store::{
    CollectionDef, ColumnDef, GenerationInfo, RelationshipDef, StorageBackend, StoreError,
};

/// Errors raised while resolving a schema generation.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// The mapping reads from a table the protocol does not declare.
    #[error("mapping reads from table {table:?} which the protocol does not declare")]
    UnknownSourceTable {
        /// Missing source table name.
        table: String,
    },
    /// A rule references a field the protocol does not declare.
    #[error("table {table:?} does not declare field {field:?}")]
    UnknownSourceField {
        /// Source table name.
        table: String,
        /// Missing field name.
        field: String,
    },
    /// Geometry was requested for a table without a coordinate pair.
    #[error("table {table:?} declares no geometry field pair but the mapping requests geometry")]
    MissingGeometryPair {
        /// Source table name.
        table: String,
    },
    /// Geometry was requested under a spatial reference the store cannot
    /// hold; ordinates are validated and written as EPSG:4326.
    #[error("spatial reference EPSG:{code} is not supported for geometry; only EPSG:4326 is")]
    UnsupportedSpatialReference {
        /// Declared EPSG code.
        code: u32,
    },
    /// A geometry ordinate field is not declared as real.
    #[error("geometry field {field:?} of table {table:?} must be declared real")]
    GeometryFieldNotReal {
        /// Source table name.
        table: String,
        /// Offending ordinate field.
        field: String,
    },
    /// The existing store does not match the expected schema.
    #[error("existing store does not match the mapping specification: {detail}")]
    Mismatch {
        /// Human-readable difference.
        detail: String,
    },
    /// The storage backend failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Resolved position of a rule's source fields within the typed row layout.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedRule {
    /// Copy the value at a row position.
    Copy {
        /// Source position.
        from: usize,
    },
    /// Copy while casting to the target type.
    Cast {
        /// Source position.
        from: usize,
        /// Target logical type.
        target: FieldType,
    },
    /// Emit a constant.
    Constant {
        /// The typed constant.
        value: Value,
    },
    /// Join rendered row positions into one text value.
    Concat {
        /// Source positions in join order.
        fields: Vec<usize>,
        /// Separator between rendered values.
        separator: String,
    },
}

/// Geometry construction resolved against the row layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeometryPlan {
    /// Row position of the x (longitude) ordinate.
    pub x: usize,
    /// Row position of the y (latitude) ordinate.
    pub y: usize,
    /// Declared x field name, kept for error reporting.
    pub x_field: String,
    /// Declared y field name, kept for error reporting.
    pub y_field: String,
}

/// Parent link resolved against the child row layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedParent {
    /// Source name of the parent table.
    pub parent_source: String,
    /// Field on parent rows carrying the reference key.
    pub parent_field: String,
    /// Row position of the child's reference field.
    pub child_index: usize,
    /// Child reference field name, kept for error reporting.
    pub child_field: String,
}

/// A reference key this table must expose to its children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureKey {
    /// Field name children reference.
    pub field: String,
    /// Row position of that field.
    pub index: usize,
}

/// Everything the engine needs to map one source table.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionPlan {
    /// Source table name.
    pub source: String,
    /// Declared fields; the typed row layout.
    pub fields: Vec<FieldDef>,
    /// Target collection definition.
    pub def: CollectionDef,
    /// Field rules resolved to row positions, aligned with `def.columns`.
    pub rules: Vec<ResolvedRule>,
    /// Geometry construction, when mapped.
    pub geometry: Option<GeometryPlan>,
    /// Parent link, when mapped.
    pub parent: Option<ResolvedParent>,
    /// Reference keys children of this table resolve against.
    pub capture_keys: Vec<CaptureKey>,
}

/// Handle bound to one schema generation for the remainder of an import.
#[derive(Debug)]
pub struct GenerationHandle {
    /// Resolved generation identifier (protocol major version).
    pub generation: u32,
    /// Generation identity as recorded in the store.
    pub info: GenerationInfo,
    /// Collection plans in parent-before-child order.
    pub plans: Vec<CollectionPlan>,
    /// Highest surrogate key per collection at resolution time.
    pub start_keys: HashMap<String, i64>,
}

/// Store file name for a descriptor: `<sanitised-name>_v<major>.sqlite`.
///
/// Protocol names come from user-authored documents, so everything outside
/// ASCII alphanumerics collapses to underscores and a leading digit gains a
/// prefix, following the original tool's table-name validation.
pub fn store_path(workspace: &Path, descriptor: &ProtocolDescriptor) -> PathBuf {
    let mut name: String = descriptor
        .name
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect();
    if name.chars().next().is_some_and(|head| head.is_ascii_digit()) {
        name.insert(0, '_');
    }
    if name.is_empty() {
        name.push_str("survey");
    }
    workspace.join(format!("{name}_v{}.sqlite", descriptor.generation()))
}

/// Resolve the schema generation for one import.
///
/// Creates the store's collections, relationships, and metadata on first
/// encounter, or validates an existing store against the expectation derived
/// from the descriptor and mapping specification.
pub fn resolve_generation<B: StorageBackend>(
    backend: &mut B,
    descriptor: &ProtocolDescriptor,
    spec: &MappingSpec,
) -> Result<GenerationHandle, SchemaError> {
    let plans = build_plans(descriptor, spec)?;
    let info = GenerationInfo {
        major: descriptor.generation(),
        protocol_name: descriptor.name.clone(),
        spatial_reference: descriptor.spatial_reference,
    };
    let expected: Vec<CollectionDef> = plans.iter().map(|plan| plan.def.clone()).collect();

    if backend.schema_exists()? {
        let (stored_info, stored_defs) = backend.read_schema()?;
        validate_info(&info, &stored_info)?;
        validate_collections(&expected, &stored_defs)?;
    } else {
        backend.create_schema(&info, &expected)?;
        info!(
            "created schema generation {} for protocol {:?} ({} collections)",
            info.major,
            info.protocol_name,
            expected.len()
        );
    }

    let mut start_keys = HashMap::with_capacity(plans.len());
    for plan in &plans {
        let max_key = backend.current_max_key(&plan.def.name)?;
        start_keys.insert(plan.def.name.clone(), max_key);
    }

    Ok(GenerationHandle {
        generation: info.major,
        info,
        plans,
        start_keys,
    })
}

fn validate_info(expected: &GenerationInfo, stored: &GenerationInfo) -> Result<(), SchemaError> {
    if expected == stored {
        return Ok(());
    }
    Err(SchemaError::Mismatch {
        detail: format!(
            "store was created for protocol {:?} major {} (EPSG {}), \
             this archive carries protocol {:?} major {} (EPSG {})",
            stored.protocol_name,
            stored.major,
            stored.spatial_reference,
            expected.protocol_name,
            expected.major,
            expected.spatial_reference,
        ),
    })
}

fn validate_collections(
    expected: &[CollectionDef],
    stored: &[CollectionDef],
) -> Result<(), SchemaError> {
    let recorded: HashMap<&str, &CollectionDef> = stored
        .iter()
        .map(|def| (def.name.as_str(), def))
        .collect();
    for def in expected {
        match recorded.get(def.name.as_str()) {
            None => {
                return Err(SchemaError::Mismatch {
                    detail: format!("collection {:?} is missing from the store", def.name),
                });
            }
            Some(found) if *found != def => {
                return Err(SchemaError::Mismatch {
                    detail: format!(
                        "collection {:?} differs from the mapping specification \
                         (fields, geometry, or relationship)",
                        def.name
                    ),
                });
            }
            Some(_) => {}
        }
    }
    if stored.len() != expected.len() {
        return Err(SchemaError::Mismatch {
            detail: format!(
                "store carries {} collections, the mapping specification expects {}",
                stored.len(),
                expected.len()
            ),
        });
    }
    Ok(())
}

/// The one spatial reference geometry can be written under.
const WGS84: u32 = 4326;

fn build_plans(
    descriptor: &ProtocolDescriptor,
    spec: &MappingSpec,
) -> Result<Vec<CollectionPlan>, SchemaError> {
    let maps_geometry = spec.tables().iter().any(|mapping| mapping.geometry.is_some());
    if maps_geometry && descriptor.spatial_reference != WGS84 {
        return Err(SchemaError::UnsupportedSpatialReference {
            code: descriptor.spatial_reference,
        });
    }
    spec.ordered_tables()
        .map(|mapping| build_plan(descriptor, spec, mapping))
        .collect()
}

fn build_plan(
    descriptor: &ProtocolDescriptor,
    spec: &MappingSpec,
    mapping: &TableMapping,
) -> Result<CollectionPlan, SchemaError> {
    let table = descriptor
        .table(&mapping.source)
        .ok_or_else(|| SchemaError::UnknownSourceTable {
            table: mapping.source.clone(),
        })?;

    let mut columns = Vec::with_capacity(mapping.fields.len() + 1);
    let mut rules = Vec::with_capacity(mapping.fields.len());
    for rule in &mapping.fields {
        let (column, resolved) = resolve_rule(table, rule)?;
        columns.push(column);
        rules.push(resolved);
    }

    let parent = mapping
        .parent
        .as_ref()
        .map(|link| -> Result<ResolvedParent, SchemaError> {
            let parent_table = descriptor.table(&link.table).ok_or_else(|| {
                SchemaError::UnknownSourceTable {
                    table: link.table.clone(),
                }
            })?;
            field_index(parent_table, &link.parent_key)?;
            let child_index = field_index(table, &link.child_key)?;
            columns.push(ColumnDef {
                name: link.fk_field.clone(),
                field_type: FieldType::Integer,
                nullable: false,
            });
            Ok(ResolvedParent {
                parent_source: link.table.clone(),
                parent_field: link.parent_key.clone(),
                child_index,
                child_field: link.child_key.clone(),
            })
        })
        .transpose()?;

    let geometry = mapping
        .geometry
        .map(|_| resolve_geometry(table))
        .transpose()?;

    let capture_keys = capture_keys(spec, table)?;

    let relationship = mapping.parent.as_ref().map(|link| {
        let parent_target = spec
            .table(&link.table)
            .map_or_else(|| link.table.clone(), |parent| parent.target.clone());
        RelationshipDef {
            parent: parent_target,
            fk_field: link.fk_field.clone(),
        }
    });

    Ok(CollectionPlan {
        source: mapping.source.clone(),
        fields: table.fields.clone(),
        def: CollectionDef {
            name: mapping.target.clone(),
            columns,
            geometry: geometry.is_some(),
            relationship,
        },
        rules,
        geometry,
        parent,
        capture_keys,
    })
}

fn resolve_rule(
    table: &TableDef,
    rule: &FieldRule,
) -> Result<(ColumnDef, ResolvedRule), SchemaError> {
    match rule {
        FieldRule::Copy { from, to } => {
            let index = field_index(table, from)?;
            let field = &table.fields[index];
            Ok((
                ColumnDef {
                    name: to.clone().unwrap_or_else(|| from.clone()),
                    field_type: field.field_type,
                    nullable: field.nullable,
                },
                ResolvedRule::Copy { from: index },
            ))
        }
        FieldRule::Cast {
            from,
            to,
            field_type,
        } => {
            let index = field_index(table, from)?;
            let field = &table.fields[index];
            Ok((
                ColumnDef {
                    name: to.clone().unwrap_or_else(|| from.clone()),
                    field_type: *field_type,
                    nullable: field.nullable,
                },
                ResolvedRule::Cast {
                    from: index,
                    target: *field_type,
                },
            ))
        }
        FieldRule::Constant { to, value } => {
            let value = constant_value(value);
            let field_type = value.field_type().unwrap_or(FieldType::Text);
            Ok((
                ColumnDef {
                    name: to.clone(),
                    field_type,
                    nullable: false,
                },
                ResolvedRule::Constant { value },
            ))
        }
        FieldRule::Concat {
            to,
            fields,
            separator,
        } => {
            let indices = fields
                .iter()
                .map(|field| field_index(table, field))
                .collect::<Result<Vec<_>, _>>()?;
            Ok((
                ColumnDef {
                    name: to.clone(),
                    field_type: FieldType::Text,
                    nullable: false,
                },
                ResolvedRule::Concat {
                    fields: indices,
                    separator: separator.clone(),
                },
            ))
        }
    }
}

fn resolve_geometry(table: &TableDef) -> Result<GeometryPlan, SchemaError> {
    let pair = table
        .geometry
        .as_ref()
        .ok_or_else(|| SchemaError::MissingGeometryPair {
            table: table.name.clone(),
        })?;
    let x = field_index(table, &pair.x)?;
    let y = field_index(table, &pair.y)?;
    for index in [x, y] {
        let field = &table.fields[index];
        if field.field_type != FieldType::Real {
            return Err(SchemaError::GeometryFieldNotReal {
                table: table.name.clone(),
                field: field.name.clone(),
            });
        }
    }
    Ok(GeometryPlan {
        x,
        y,
        x_field: pair.x.clone(),
        y_field: pair.y.clone(),
    })
}

fn capture_keys(spec: &MappingSpec, table: &TableDef) -> Result<Vec<CaptureKey>, SchemaError> {
    let mut keys: Vec<CaptureKey> = Vec::new();
    for child in spec.tables() {
        let Some(link) = child.parent.as_ref().filter(|link| link.table == table.name) else {
            continue;
        };
        if keys.iter().any(|key| key.field == link.parent_key) {
            continue;
        }
        keys.push(CaptureKey {
            field: link.parent_key.clone(),
            index: field_index(table, &link.parent_key)?,
        });
    }
    Ok(keys)
}

fn field_index(table: &TableDef, field: &str) -> Result<usize, SchemaError> {
    table
        .field_index(field)
        .ok_or_else(|| SchemaError::UnknownSourceField {
            table: table.name.clone(),
            field: field.to_owned(),
        })
}

fn constant_value(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Bool(flag) => Value::Boolean(*flag),
        serde_json::Value::Number(number) => number
            .as_i64()
            .map_or_else(
                || Value::Real(number.as_f64().unwrap_or(0.0)),
                Value::Integer,
            ),
        serde_json::Value::String(text) => Value::Text(text.clone()),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteBackend;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    const DESCRIPTOR: &str = r#"{
        "meta_name": "survey-protocol",
        "meta_version": 2,
        "name": "Shorebird Survey",
        "version": "2.1",
        "tables": [
            {
                "name": "track_logs",
                "fields": [
                    {"name": "tracklog_id", "type": "integer", "nullable": false},
                    {"name": "observing", "type": "boolean"},
                    {"name": "timestamp", "type": "date"},
                    {"name": "notes", "type": "text"}
                ]
            },
            {
                "name": "gps_points",
                "geometry": {"x": "longitude", "y": "latitude"},
                "fields": [
                    {"name": "point_id", "type": "integer", "nullable": false},
                    {"name": "tracklog_id", "type": "integer", "nullable": false},
                    {"name": "latitude", "type": "real", "nullable": false},
                    {"name": "longitude", "type": "real", "nullable": false},
                    {"name": "timestamp", "type": "date"},
                    {"name": "speed", "type": "real"}
                ]
            },
            {
                "name": "observations",
                "geometry": {"x": "longitude", "y": "latitude"},
                "fields": [
                    {"name": "point_id", "type": "integer", "nullable": false},
                    {"name": "species", "type": "text", "nullable": false},
                    {"name": "count", "type": "integer", "nullable": false},
                    {"name": "latitude", "type": "real", "nullable": false},
                    {"name": "longitude", "type": "real", "nullable": false}
                ]
            }
        ]
    }"#;

    #[fixture]
    fn descriptor() -> ProtocolDescriptor {
        ProtocolDescriptor::from_json(DESCRIPTOR).expect("descriptor should parse")
    }

    #[fixture]
    fn spec() -> MappingSpec {
        MappingSpec::embedded_default().expect("embedded spec should validate")
    }

    #[fixture]
    fn temp_dir() -> TempDir {
        TempDir::new().expect("create temp dir")
    }

    #[rstest]
    fn derives_collection_plans(descriptor: ProtocolDescriptor, spec: MappingSpec) {
        let plans = build_plans(&descriptor, &spec).expect("plans should build");

        let names: Vec<_> = plans.iter().map(|plan| plan.def.name.as_str()).collect();
        assert_eq!(names, ["TrackLogs", "GpsPoints", "Observations"]);

        let track_logs = &plans[0];
        assert!(track_logs.def.relationship.is_none());
        assert_eq!(
            track_logs.capture_keys,
            vec![CaptureKey {
                field: "tracklog_id".to_owned(),
                index: 0
            }]
        );

        let gps = &plans[1];
        assert!(gps.def.geometry);
        let fk = gps.def.columns.last().expect("fk column appended");
        assert_eq!(fk.name, "TrackLog_ID");
        assert_eq!(fk.field_type, FieldType::Integer);
        assert!(!fk.nullable);
        assert_eq!(
            gps.def.relationship,
            Some(RelationshipDef {
                parent: "TrackLogs".to_owned(),
                fk_field: "TrackLog_ID".to_owned(),
            })
        );
    }

    #[rstest]
    fn rejects_geometry_without_field_pair(spec: MappingSpec) {
        let stripped = DESCRIPTOR.replace(r#""geometry": {"x": "longitude", "y": "latitude"},"#, "");
        let descriptor = ProtocolDescriptor::from_json(&stripped).expect("descriptor parses");

        let outcome = build_plans(&descriptor, &spec);
        assert!(matches!(
            outcome,
            Err(SchemaError::MissingGeometryPair { .. })
        ));
    }

    #[rstest]
    fn rejects_non_wgs84_reference_when_geometry_is_mapped(spec: MappingSpec) {
        let reprojected = DESCRIPTOR.replace(
            r#""version": "2.1","#,
            r#""version": "2.1", "spatial_reference": 3857,"#,
        );
        let descriptor = ProtocolDescriptor::from_json(&reprojected).expect("descriptor parses");

        let outcome = build_plans(&descriptor, &spec);
        assert!(matches!(
            outcome,
            Err(SchemaError::UnsupportedSpatialReference { code: 3857 })
        ));

        // Without geometry rules the spatial reference is not constrained.
        let flat = MappingSpec::from_json(
            r#"{
                "tables": [{
                    "source": "track_logs",
                    "target": "TrackLogs",
                    "fields": [{"copy": {"from": "notes"}}]
                }]
            }"#,
        )
        .expect("flat spec validates");
        assert!(build_plans(&descriptor, &flat).is_ok());
    }

    #[rstest]
    fn rejects_rule_against_undeclared_field(descriptor: ProtocolDescriptor) {
        let spec = MappingSpec::from_json(
            r#"{
                "tables": [{
                    "source": "track_logs",
                    "target": "TrackLogs",
                    "fields": [{"copy": {"from": "no_such_field"}}]
                }]
            }"#,
        )
        .expect("spec should validate");

        let outcome = build_plans(&descriptor, &spec);
        assert!(matches!(
            outcome,
            Err(SchemaError::UnknownSourceField { ref field, .. }) if field == "no_such_field"
        ));
    }

    #[rstest]
    fn creates_then_reuses_generation(
        descriptor: ProtocolDescriptor,
        spec: MappingSpec,
        temp_dir: TempDir,
    ) {
        let path = store_path(temp_dir.path(), &descriptor);
        let mut backend = SqliteBackend::open(&path).expect("open store");

        let first = resolve_generation(&mut backend, &descriptor, &spec)
            .expect("first resolution creates the store");
        assert_eq!(first.generation, 2);
        assert_eq!(first.start_keys.get("TrackLogs"), Some(&0));

        let second = resolve_generation(&mut backend, &descriptor, &spec)
            .expect("second resolution validates the store");
        assert_eq!(second.generation, 2);
        assert_eq!(second.plans.len(), first.plans.len());
    }

    #[rstest]
    fn rejects_store_built_from_other_mapping(
        descriptor: ProtocolDescriptor,
        spec: MappingSpec,
        temp_dir: TempDir,
    ) {
        let path = store_path(temp_dir.path(), &descriptor);
        let mut backend = SqliteBackend::open(&path).expect("open store");
        resolve_generation(&mut backend, &descriptor, &spec).expect("create store");

        let altered = MappingSpec::from_json(
            r#"{
                "tables": [{
                    "source": "track_logs",
                    "target": "TrackLogs",
                    "fields": [{"copy": {"from": "notes"}}]
                }]
            }"#,
        )
        .expect("altered spec validates");

        let outcome = resolve_generation(&mut backend, &descriptor, &altered);
        assert!(matches!(outcome, Err(SchemaError::Mismatch { .. })));
    }

    #[rstest]
    fn store_path_sanitises_protocol_name(descriptor: ProtocolDescriptor, temp_dir: TempDir) {
        let path = store_path(temp_dir.path(), &descriptor);
        assert_eq!(
            path.file_name().and_then(|name| name.to_str()),
            Some("Shorebird_Survey_v2.sqlite")
        );
    }
}
