//! Row-to-record mapping for one import.
//!
//! The engine walks collection plans in parent-before-child order, assigns
//! monotonically increasing surrogate keys, constructs point geometry from
//! the declared coordinate pair, and resolves child reference fields to the
//! surrogate keys captured while mapping the parent table. It is fail-fast:
//! the first malformed row or unresolvable reference aborts the archive.

use std::collections::HashMap;

use geo::Coord;
use thiserror::Error;

use crate::parse::{coerce_text, Row, RowParseError, Value};
use crate::protocol::FieldType;
use crate::registry::{CollectionPlan, GeometryPlan, ResolvedParent, ResolvedRule};
use crate::store::{CollectionBatch, TargetRecord};

/// Errors raised while mapping typed rows to target records.
#[derive(Debug, Error)]
pub enum MapError {
    /// A field the mapping depends on was null.
    #[error("table {table:?} row {row}: field {field:?} is null but the mapping requires it")]
    MissingField {
        /// Source table name.
        table: String,
        /// 1-based data row index.
        row: u64,
        /// Field that was null.
        field: String,
    },
    /// A geometry ordinate was null.
    #[error("table {table:?} row {row}: geometry ordinate {field:?} is missing")]
    MissingCoordinate {
        /// Source table name.
        table: String,
        /// 1-based data row index.
        row: u64,
        /// Ordinate field name.
        field: String,
    },
    /// A geometry ordinate was outside its valid range.
    #[error("table {table:?} row {row}: ordinate {field:?} value {value} is out of range")]
    CoordinateOutOfRange {
        /// Source table name.
        table: String,
        /// 1-based data row index.
        row: u64,
        /// Ordinate field name.
        field: String,
        /// Offending value.
        value: f64,
    },
    /// A cast rule could not convert the source value.
    #[error("table {table:?} row {row}: cannot cast {value:?} to {target} for {field:?}")]
    Cast {
        /// Source table name.
        table: String,
        /// 1-based data row index.
        row: u64,
        /// Target column name.
        field: String,
        /// Rendered source value.
        value: String,
        /// Requested target type.
        target: FieldType,
    },
    /// A child row referenced a parent key that was never captured.
    #[error(
        "table {table:?} row {row}: field {field:?} references {value:?} \
         which no parent row carries"
    )]
    ForeignKey {
        /// Source table name.
        table: String,
        /// 1-based data row index.
        row: u64,
        /// Child reference field name.
        field: String,
        /// Rendered reference value.
        value: String,
    },
}

/// Errors raised while driving the typed-row iterator through the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A source row failed to parse.
    #[error(transparent)]
    Parse(#[from] RowParseError),
    /// A parsed row could not be mapped.
    #[error(transparent)]
    Map(#[from] MapError),
}

/// Hands out surrogate keys for one collection, continuing from the highest
/// key already present in the store.
#[derive(Debug)]
pub struct KeyAllocator {
    next: i64,
}

impl KeyAllocator {
    /// Create an allocator whose first key is `start + 1`.
    #[must_use]
    pub fn new(start: i64) -> Self {
        Self { next: start + 1 }
    }

    /// Take the next key.
    pub fn allocate(&mut self) -> i64 {
        let key = self.next;
        self.next += 1;
        key
    }
}

/// Lookup key for a captured parent surrogate: source table, reference field,
/// and the rendered reference value.
type ParentRef = (String, String, String);

/// Maps typed rows to target records, carrying captured parent keys across
/// tables within one import.
#[derive(Debug, Default)]
pub struct MappingEngine {
    parent_keys: HashMap<ParentRef, i64>,
}

impl MappingEngine {
    /// Create an engine with no captured keys.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map every row of one source table into a collection batch.
    ///
    /// Rows must arrive after every plan earlier in the parent-before-child
    /// order has been mapped, otherwise child references cannot resolve.
    pub fn map_table<I>(
        &mut self,
        plan: &CollectionPlan,
        rows: I,
        allocator: &mut KeyAllocator,
    ) -> Result<CollectionBatch, EngineError>
    where
        I: IntoIterator<Item = Result<Row, RowParseError>>,
    {
        let mut records = Vec::new();
        for row in rows {
            let row = row?;
            records.push(self.map_row(plan, &row, allocator)?);
        }
        Ok(CollectionBatch {
            collection: plan.def.name.clone(),
            records,
        })
    }

    fn map_row(
        &mut self,
        plan: &CollectionPlan,
        row: &Row,
        allocator: &mut KeyAllocator,
    ) -> Result<TargetRecord, MapError> {
        let key = allocator.allocate();
        let mut values = Vec::with_capacity(plan.def.columns.len());
        for (position, rule) in plan.rules.iter().enumerate() {
            values.push(apply_rule(plan, row, position, rule)?);
        }
        if let Some(parent) = &plan.parent {
            values.push(Value::Integer(self.resolve_parent(plan, row, parent)?));
        }
        let geometry = plan
            .geometry
            .as_ref()
            .map(|geometry| construct_point(plan, row, geometry))
            .transpose()?;
        self.capture_keys(plan, row, key)?;
        Ok(TargetRecord {
            key,
            values,
            geometry,
        })
    }

    fn resolve_parent(
        &self,
        plan: &CollectionPlan,
        row: &Row,
        parent: &ResolvedParent,
    ) -> Result<i64, MapError> {
        let reference = &row.values[parent.child_index];
        if reference.is_null() {
            return Err(MapError::MissingField {
                table: plan.source.clone(),
                row: row.index,
                field: parent.child_field.clone(),
            });
        }
        let rendered = reference.to_string();
        let lookup = (
            parent.parent_source.clone(),
            parent.parent_field.clone(),
            rendered.clone(),
        );
        self.parent_keys
            .get(&lookup)
            .copied()
            .ok_or_else(|| MapError::ForeignKey {
                table: plan.source.clone(),
                row: row.index,
                field: parent.child_field.clone(),
                value: rendered,
            })
    }

    fn capture_keys(
        &mut self,
        plan: &CollectionPlan,
        row: &Row,
        key: i64,
    ) -> Result<(), MapError> {
        for capture in &plan.capture_keys {
            let value = &row.values[capture.index];
            if value.is_null() {
                return Err(MapError::MissingField {
                    table: plan.source.clone(),
                    row: row.index,
                    field: capture.field.clone(),
                });
            }
            self.parent_keys.insert(
                (
                    plan.source.clone(),
                    capture.field.clone(),
                    value.to_string(),
                ),
                key,
            );
        }
        Ok(())
    }
}

fn apply_rule(
    plan: &CollectionPlan,
    row: &Row,
    position: usize,
    rule: &ResolvedRule,
) -> Result<Value, MapError> {
    match rule {
        ResolvedRule::Copy { from } => Ok(row.values[*from].clone()),
        ResolvedRule::Cast { from, target } => {
            let source = &row.values[*from];
            if source.is_null() {
                return Ok(Value::Null);
            }
            cast_value(source, *target).ok_or_else(|| MapError::Cast {
                table: plan.source.clone(),
                row: row.index,
                field: plan.def.columns[position].name.clone(),
                value: source.to_string(),
                target: *target,
            })
        }
        ResolvedRule::Constant { value } => Ok(value.clone()),
        ResolvedRule::Concat { fields, separator } => {
            let rendered: Vec<String> = fields
                .iter()
                .map(|&index| &row.values[index])
                .filter(|value| !value.is_null())
                .map(ToString::to_string)
                .collect();
            Ok(Value::Text(rendered.join(separator)))
        }
    }
}

/// Convert a non-null value to the target type, `None` when the conversion
/// has no sensible meaning.
fn cast_value(value: &Value, target: FieldType) -> Option<Value> {
    if value.field_type() == Some(target) {
        return Some(value.clone());
    }
    match (value, target) {
        (Value::Integer(number), FieldType::Real) => {
            #[allow(clippy::cast_precision_loss)]
            let widened = *number as f64;
            Some(Value::Real(widened))
        }
        (Value::Integer(number), FieldType::Boolean) => match number {
            0 => Some(Value::Boolean(false)),
            1 => Some(Value::Boolean(true)),
            _ => None,
        },
        (Value::Boolean(flag), FieldType::Integer) => Some(Value::Integer(i64::from(*flag))),
        (Value::Text(text), _) => coerce_text(text, target),
        (other, FieldType::Text) => Some(Value::Text(other.to_string())),
        _ => None,
    }
}

fn construct_point(
    plan: &CollectionPlan,
    row: &Row,
    geometry: &GeometryPlan,
) -> Result<Coord<f64>, MapError> {
    let x = ordinate(plan, row, geometry.x, &geometry.x_field)?;
    let y = ordinate(plan, row, geometry.y, &geometry.y_field)?;
    check_range(plan, row, &geometry.x_field, x, 180.0)?;
    check_range(plan, row, &geometry.y_field, y, 90.0)?;
    Ok(Coord { x, y })
}

fn ordinate(
    plan: &CollectionPlan,
    row: &Row,
    index: usize,
    field: &str,
) -> Result<f64, MapError> {
    match &row.values[index] {
        Value::Real(value) => Ok(*value),
        _ => Err(MapError::MissingCoordinate {
            table: plan.source.clone(),
            row: row.index,
            field: field.to_owned(),
        }),
    }
}

fn check_range(
    plan: &CollectionPlan,
    row: &Row,
    field: &str,
    value: f64,
    bound: f64,
) -> Result<(), MapError> {
    if value.is_finite() && value.abs() <= bound {
        return Ok(());
    }
    Err(MapError::CoordinateOutOfRange {
        table: plan.source.clone(),
        row: row.index,
        field: field.to_owned(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{CaptureKey, GeometryPlan, ResolvedParent};
    use crate::store::{CollectionDef, ColumnDef, RelationshipDef};
    use crate::protocol::FieldDef;
    use rstest::{fixture, rstest};

    fn field(name: &str, field_type: FieldType) -> FieldDef {
        FieldDef {
            name: name.to_owned(),
            field_type,
            nullable: true,
        }
    }

    fn column(name: &str, field_type: FieldType, nullable: bool) -> ColumnDef {
        ColumnDef {
            name: name.to_owned(),
            field_type,
            nullable,
        }
    }

    fn row(index: u64, values: Vec<Value>) -> Result<Row, RowParseError> {
        Ok(Row { index, values })
    }

    /// Parent table: captures `site_id` for children, copies the label.
    #[fixture]
    fn parent_plan() -> CollectionPlan {
        CollectionPlan {
            source: "sites".to_owned(),
            fields: vec![field("site_id", FieldType::Integer), field("label", FieldType::Text)],
            def: CollectionDef {
                name: "Sites".to_owned(),
                columns: vec![column("label", FieldType::Text, true)],
                geometry: false,
                relationship: None,
            },
            rules: vec![ResolvedRule::Copy { from: 1 }],
            geometry: None,
            parent: None,
            capture_keys: vec![CaptureKey {
                field: "site_id".to_owned(),
                index: 0,
            }],
        }
    }

    /// Child table: geometry, a cast, a constant, and a parent link.
    #[fixture]
    fn child_plan() -> CollectionPlan {
        CollectionPlan {
            source: "visits".to_owned(),
            fields: vec![
                field("site_id", FieldType::Integer),
                field("longitude", FieldType::Real),
                field("latitude", FieldType::Real),
                field("duration", FieldType::Text),
            ],
            def: CollectionDef {
                name: "Visits".to_owned(),
                columns: vec![
                    column("duration", FieldType::Integer, true),
                    column("source", FieldType::Text, false),
                    column("Site_ID", FieldType::Integer, false),
                ],
                geometry: true,
                relationship: Some(RelationshipDef {
                    parent: "Sites".to_owned(),
                    fk_field: "Site_ID".to_owned(),
                }),
            },
            rules: vec![
                ResolvedRule::Cast {
                    from: 3,
                    target: FieldType::Integer,
                },
                ResolvedRule::Constant {
                    value: Value::Text("field-survey".to_owned()),
                },
            ],
            geometry: Some(GeometryPlan {
                x: 1,
                y: 2,
                x_field: "longitude".to_owned(),
                y_field: "latitude".to_owned(),
            }),
            parent: Some(ResolvedParent {
                parent_source: "sites".to_owned(),
                parent_field: "site_id".to_owned(),
                child_index: 0,
                child_field: "site_id".to_owned(),
            }),
            capture_keys: Vec::new(),
        }
    }

    #[rstest]
    fn assigns_sequential_keys_from_start(parent_plan: CollectionPlan) {
        let mut engine = MappingEngine::new();
        let mut allocator = KeyAllocator::new(41);

        let batch = engine
            .map_table(
                &parent_plan,
                vec![
                    row(1, vec![Value::Integer(7), Value::Text("ridge".to_owned())]),
                    row(2, vec![Value::Integer(8), Value::Text("shore".to_owned())]),
                ],
                &mut allocator,
            )
            .expect("rows should map");

        let keys: Vec<_> = batch.records.iter().map(|record| record.key).collect();
        assert_eq!(keys, [42, 43]);
        assert_eq!(
            batch.records[0].values,
            vec![Value::Text("ridge".to_owned())]
        );
    }

    #[rstest]
    fn resolves_parent_references_to_surrogate_keys(
        parent_plan: CollectionPlan,
        child_plan: CollectionPlan,
    ) {
        let mut engine = MappingEngine::new();
        let mut parents = KeyAllocator::new(0);
        engine
            .map_table(
                &parent_plan,
                vec![
                    row(1, vec![Value::Integer(7), Value::Null]),
                    row(2, vec![Value::Integer(8), Value::Null]),
                ],
                &mut parents,
            )
            .expect("parents should map");

        let mut children = KeyAllocator::new(0);
        let batch = engine
            .map_table(
                &child_plan,
                vec![row(
                    1,
                    vec![
                        Value::Integer(8),
                        Value::Real(-151.5),
                        Value::Real(60.25),
                        Value::Text("45".to_owned()),
                    ],
                )],
                &mut children,
            )
            .expect("child should map");

        let record = &batch.records[0];
        assert_eq!(
            record.values,
            vec![
                Value::Integer(45),
                Value::Text("field-survey".to_owned()),
                Value::Integer(2),
            ]
        );
        assert_eq!(record.geometry, Some(Coord { x: -151.5, y: 60.25 }));
    }

    #[rstest]
    fn rejects_reference_to_unknown_parent(child_plan: CollectionPlan) {
        let mut engine = MappingEngine::new();
        let mut allocator = KeyAllocator::new(0);

        let outcome = engine.map_table(
            &child_plan,
            vec![row(
                1,
                vec![
                    Value::Integer(99),
                    Value::Real(0.0),
                    Value::Real(0.0),
                    Value::Null,
                ],
            )],
            &mut allocator,
        );

        assert!(matches!(
            outcome,
            Err(EngineError::Map(MapError::ForeignKey { ref value, .. })) if value == "99"
        ));
    }

    #[rstest]
    #[case(200.0, "latitude")]
    #[case(f64::NAN, "latitude")]
    fn rejects_out_of_range_ordinate(
        parent_plan: CollectionPlan,
        child_plan: CollectionPlan,
        #[case] latitude: f64,
        #[case] field: &str,
    ) {
        let mut engine = MappingEngine::new();
        let mut parents = KeyAllocator::new(0);
        engine
            .map_table(
                &parent_plan,
                vec![row(1, vec![Value::Integer(8), Value::Null])],
                &mut parents,
            )
            .expect("parent should map");

        let mut allocator = KeyAllocator::new(0);
        let outcome = engine.map_table(
            &child_plan,
            vec![row(
                1,
                vec![
                    Value::Integer(8),
                    Value::Real(-151.5),
                    Value::Real(latitude),
                    Value::Null,
                ],
            )],
            &mut allocator,
        );

        assert!(matches!(
            outcome,
            Err(EngineError::Map(MapError::CoordinateOutOfRange { field: ref name, .. }))
                if name == field
        ));
    }

    #[rstest]
    fn rejects_null_ordinate(parent_plan: CollectionPlan, child_plan: CollectionPlan) {
        let mut engine = MappingEngine::new();
        let mut parents = KeyAllocator::new(0);
        engine
            .map_table(
                &parent_plan,
                vec![row(1, vec![Value::Integer(8), Value::Null])],
                &mut parents,
            )
            .expect("parent should map");

        let mut allocator = KeyAllocator::new(0);
        let outcome = engine.map_table(
            &child_plan,
            vec![row(
                1,
                vec![
                    Value::Integer(8),
                    Value::Null,
                    Value::Real(60.0),
                    Value::Null,
                ],
            )],
            &mut allocator,
        );

        assert!(matches!(
            outcome,
            Err(EngineError::Map(MapError::MissingCoordinate { ref field, .. }))
                if field == "longitude"
        ));
    }

    #[rstest]
    fn reports_failed_casts(parent_plan: CollectionPlan, child_plan: CollectionPlan) {
        let mut engine = MappingEngine::new();
        let mut parents = KeyAllocator::new(0);
        engine
            .map_table(
                &parent_plan,
                vec![row(1, vec![Value::Integer(8), Value::Null])],
                &mut parents,
            )
            .expect("parent should map");

        let mut allocator = KeyAllocator::new(0);
        let outcome = engine.map_table(
            &child_plan,
            vec![row(
                1,
                vec![
                    Value::Integer(8),
                    Value::Real(-151.5),
                    Value::Real(60.25),
                    Value::Text("forty-five".to_owned()),
                ],
            )],
            &mut allocator,
        );

        assert!(matches!(
            outcome,
            Err(EngineError::Map(MapError::Cast { ref value, .. })) if value == "forty-five"
        ));
    }

    #[rstest]
    fn propagates_row_parse_errors(parent_plan: CollectionPlan) {
        let mut engine = MappingEngine::new();
        let mut allocator = KeyAllocator::new(0);

        let outcome = engine.map_table(
            &parent_plan,
            vec![Err(RowParseError::ShortRecord {
                table: "sites".to_owned(),
                row: 3,
            })],
            &mut allocator,
        );

        assert!(matches!(
            outcome,
            Err(EngineError::Parse(RowParseError::ShortRecord { row: 3, .. }))
        ));
    }

    #[rstest]
    fn rejects_null_capture_key(parent_plan: CollectionPlan) {
        let mut engine = MappingEngine::new();
        let mut allocator = KeyAllocator::new(0);

        let outcome = engine.map_table(
            &parent_plan,
            vec![row(1, vec![Value::Null, Value::Text("ridge".to_owned())])],
            &mut allocator,
        );

        assert!(matches!(
            outcome,
            Err(EngineError::Map(MapError::MissingField { ref field, .. })) if field == "site_id"
        ));
    }
}
