//! Typed parsing of one tabular dataset against its protocol field
//! definitions.
//!
//! [`TypedRows`] is a lazy, finite, non-restartable sequence: each CSV record
//! is coerced column-by-column into [`Value`]s as it is pulled. The first
//! malformed cell poisons the whole table and the import aborts rather than
//! silently dropping rows.

use std::{fmt, fs::File, path::Path};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use thiserror::Error;

use crate::protocol::{FieldDef, FieldType};

/// A typed cell value flowing from the parser into the mapping engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// 64-bit signed integer.
    Integer(i64),
    /// 64-bit float.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Timestamp without an offset; serialised as ISO-8601 text.
    Date(NaiveDateTime),
    /// True/false flag.
    Boolean(bool),
    /// Absent value from an empty (nullable) cell.
    Null,
}

impl Value {
    /// The logical type this value inhabits, if any.
    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            Self::Integer(_) => Some(FieldType::Integer),
            Self::Real(_) => Some(FieldType::Real),
            Self::Text(_) => Some(FieldType::Text),
            Self::Date(_) => Some(FieldType::Date),
            Self::Boolean(_) => Some(FieldType::Boolean),
            Self::Null => None,
        }
    }

    /// Whether this is the null value.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{value}"),
            Self::Real(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
            Self::Date(value) => write!(f, "{}", value.format("%Y-%m-%dT%H:%M:%S")),
            Self::Boolean(value) => write!(f, "{value}"),
            Self::Null => Ok(()),
        }
    }
}

/// One typed row of a source table.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// 1-based data row index (the header row is not counted).
    pub index: u64,
    /// Cell values ordered per the table's declared fields.
    pub values: Vec<Value>,
}

/// Errors raised while parsing a tabular dataset.
#[derive(Debug, Error)]
pub enum RowParseError {
    /// The CSV file could not be opened or decoded.
    #[error("failed to read CSV data for table {table:?}")]
    Csv {
        /// Source table name.
        table: String,
        /// Underlying CSV failure.
        #[source]
        source: csv::Error,
    },
    /// A declared field has no matching CSV header column.
    #[error("table {table:?} is missing declared column {column:?}")]
    MissingColumn {
        /// Source table name.
        table: String,
        /// The declared field absent from the header.
        column: String,
    },
    /// A cell could not be coerced to its declared type.
    #[error(
        "table {table:?} row {row} column {column:?}: {value:?} is not a valid {expected}"
    )]
    Malformed {
        /// Source table name.
        table: String,
        /// 1-based data row index.
        row: u64,
        /// Offending column name.
        column: String,
        /// The raw cell text.
        value: String,
        /// The declared type the cell failed to satisfy.
        expected: FieldType,
    },
    /// An empty cell appeared in a non-nullable column.
    #[error("table {table:?} row {row} column {column:?}: empty value in non-nullable column")]
    NullValue {
        /// Source table name.
        table: String,
        /// 1-based data row index.
        row: u64,
        /// Offending column name.
        column: String,
    },
    /// A record carried fewer columns than the header.
    #[error("table {table:?} row {row}: record is shorter than the header")]
    ShortRecord {
        /// Source table name.
        table: String,
        /// 1-based data row index.
        row: u64,
    },
}

/// Lazy iterator of typed rows over one CSV dataset.
pub struct TypedRows<R: std::io::Read> {
    table: String,
    fields: Vec<FieldDef>,
    positions: Vec<usize>,
    records: csv::StringRecordsIntoIter<R>,
    row: u64,
    poisoned: bool,
}

impl TypedRows<File> {
    /// Open a CSV file and bind it to the table's declared fields.
    ///
    /// The header row is read eagerly so missing columns surface before any
    /// data row is produced.
    pub fn from_path(
        table: &str,
        path: &Path,
        fields: &[FieldDef],
    ) -> Result<Self, RowParseError> {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_path(path)
            .map_err(|source| RowParseError::Csv {
                table: table.to_owned(),
                source,
            })?;
        Self::from_reader(table, reader, fields)
    }
}

impl<R: std::io::Read> TypedRows<R> {
    /// Bind an already-open CSV reader to the table's declared fields.
    pub fn from_reader(
        table: &str,
        mut reader: csv::Reader<R>,
        fields: &[FieldDef],
    ) -> Result<Self, RowParseError> {
        let header = reader
            .headers()
            .map_err(|source| RowParseError::Csv {
                table: table.to_owned(),
                source,
            })?
            .clone();
        let positions = fields
            .iter()
            .map(|field| {
                header
                    .iter()
                    .position(|column| column == field.name)
                    .ok_or_else(|| RowParseError::MissingColumn {
                        table: table.to_owned(),
                        column: field.name.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            table: table.to_owned(),
            fields: fields.to_vec(),
            positions,
            records: reader.into_records(),
            row: 0,
            poisoned: false,
        })
    }

    fn typed_row(&self, record: &csv::StringRecord, row: u64) -> Result<Row, RowParseError> {
        let mut values = Vec::with_capacity(self.fields.len());
        for (field, &position) in self.fields.iter().zip(&self.positions) {
            let cell = record.get(position).ok_or(RowParseError::ShortRecord {
                table: self.table.clone(),
                row,
            })?;
            values.push(self.coerce(cell, field, row)?);
        }
        Ok(Row { index: row, values })
    }

    fn coerce(&self, cell: &str, field: &FieldDef, row: u64) -> Result<Value, RowParseError> {
        if cell.is_empty() {
            if field.nullable {
                return Ok(Value::Null);
            }
            return Err(RowParseError::NullValue {
                table: self.table.clone(),
                row,
                column: field.name.clone(),
            });
        }
        coerce_text(cell, field.field_type).ok_or_else(|| RowParseError::Malformed {
            table: self.table.clone(),
            row,
            column: field.name.clone(),
            value: cell.to_owned(),
            expected: field.field_type,
        })
    }
}

impl<R: std::io::Read> Iterator for TypedRows<R> {
    type Item = Result<Row, RowParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.poisoned {
            return None;
        }
        let record = match self.records.next()? {
            Ok(record) => record,
            Err(source) => {
                self.poisoned = true;
                return Some(Err(RowParseError::Csv {
                    table: self.table.clone(),
                    source,
                }));
            }
        };
        self.row += 1;
        let outcome = self.typed_row(&record, self.row);
        if outcome.is_err() {
            self.poisoned = true;
        }
        Some(outcome)
    }
}

/// Coerce raw cell text into a typed value, `None` on failure.
pub fn coerce_text(cell: &str, field_type: FieldType) -> Option<Value> {
    match field_type {
        FieldType::Integer => cell.parse::<i64>().ok().map(Value::Integer),
        FieldType::Real => cell.parse::<f64>().ok().map(Value::Real),
        FieldType::Text => Some(Value::Text(cell.to_owned())),
        FieldType::Date => parse_date(cell).map(Value::Date),
        FieldType::Boolean => parse_boolean(cell).map(Value::Boolean),
    }
}

fn parse_boolean(cell: &str) -> Option<bool> {
    match cell.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

fn parse_date(cell: &str) -> Option<NaiveDateTime> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(cell) {
        return Some(instant.naive_utc());
    }
    if let Ok(timestamp) = NaiveDateTime::parse_from_str(cell, "%Y-%m-%dT%H:%M:%S") {
        return Some(timestamp);
    }
    if let Ok(timestamp) = NaiveDateTime::parse_from_str(cell, "%Y-%m-%d %H:%M:%S") {
        return Some(timestamp);
    }
    NaiveDate::parse_from_str(cell, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    fn field(name: &str, field_type: FieldType, nullable: bool) -> FieldDef {
        FieldDef {
            name: name.to_owned(),
            field_type,
            nullable,
        }
    }

    fn rows_from<'a>(data: &'a str, fields: &[FieldDef]) -> TypedRows<&'a [u8]> {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(data.as_bytes());
        TypedRows::from_reader("observations", reader, fields).expect("header should bind")
    }

    #[fixture]
    fn observation_fields() -> Vec<FieldDef> {
        vec![
            field("species", FieldType::Text, false),
            field("count", FieldType::Integer, false),
            field("seen_at", FieldType::Date, true),
            field("confirmed", FieldType::Boolean, true),
        ]
    }

    #[rstest]
    fn coerces_declared_types(observation_fields: Vec<FieldDef>) {
        let data = "species,count,seen_at,confirmed\n\
                    dunlin,12,2024-06-01T07:30:00,yes\n";
        let rows: Vec<_> = rows_from(data, &observation_fields)
            .collect::<Result<_, _>>()
            .expect("rows should parse");

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].index, 1);
        assert_eq!(rows[0].values[0], Value::Text("dunlin".into()));
        assert_eq!(rows[0].values[1], Value::Integer(12));
        assert!(matches!(rows[0].values[2], Value::Date(_)));
        assert_eq!(rows[0].values[3], Value::Boolean(true));
    }

    #[rstest]
    fn header_order_does_not_matter(observation_fields: Vec<FieldDef>) {
        let data = "confirmed,species,seen_at,count\n\
                    no,sanderling,,3\n";
        let rows: Vec<_> = rows_from(data, &observation_fields)
            .collect::<Result<_, _>>()
            .expect("rows should parse");

        assert_eq!(rows[0].values[0], Value::Text("sanderling".into()));
        assert_eq!(rows[0].values[1], Value::Integer(3));
        assert_eq!(rows[0].values[2], Value::Null);
        assert_eq!(rows[0].values[3], Value::Boolean(false));
    }

    #[rstest]
    fn reports_row_and_column_for_malformed_cell(observation_fields: Vec<FieldDef>) {
        let data = "species,count,seen_at,confirmed\n\
                    dunlin,4,,no\n\
                    turnstone,many,,no\n";
        let outcome: Result<Vec<_>, _> = rows_from(data, &observation_fields).collect();

        let error = outcome.expect_err("second row should fail");
        match error {
            RowParseError::Malformed {
                row,
                column,
                value,
                expected,
                ..
            } => {
                assert_eq!(row, 2);
                assert_eq!(column, "count");
                assert_eq!(value, "many");
                assert_eq!(expected, FieldType::Integer);
            }
            other => panic!("expected malformed-cell error, got {other:?}"),
        }
    }

    #[rstest]
    fn stops_after_first_failure(observation_fields: Vec<FieldDef>) {
        let data = "species,count,seen_at,confirmed\n\
                    dunlin,bad,,no\n\
                    turnstone,3,,no\n";
        let mut rows = rows_from(data, &observation_fields);

        assert!(rows.next().expect("first item").is_err());
        assert!(rows.next().is_none(), "iterator must not restart");
    }

    #[rstest]
    fn rejects_empty_cell_in_required_column(observation_fields: Vec<FieldDef>) {
        let data = "species,count,seen_at,confirmed\n\
                    ,4,,no\n";
        let outcome: Result<Vec<_>, _> = rows_from(data, &observation_fields).collect();

        assert!(matches!(
            outcome,
            Err(RowParseError::NullValue { row: 1, ref column, .. }) if column == "species"
        ));
    }

    #[rstest]
    fn rejects_missing_declared_column(observation_fields: Vec<FieldDef>) {
        let reader = csv::ReaderBuilder::new()
            .from_reader("species,count\n".as_bytes());
        let outcome = TypedRows::from_reader("observations", reader, &observation_fields);

        assert!(matches!(
            outcome,
            Err(RowParseError::MissingColumn { ref column, .. }) if column == "seen_at"
        ));
    }

    #[rstest]
    #[case("2024-06-01T07:30:00Z")]
    #[case("2024-06-01T07:30:00+02:00")]
    #[case("2024-06-01 07:30:00")]
    #[case("2024-06-01")]
    fn accepts_common_date_forms(#[case] input: &str) {
        assert!(parse_date(input).is_some(), "{input} should parse");
    }

    #[rstest]
    fn rejects_unknown_boolean_spelling() {
        assert!(coerce_text("maybe", FieldType::Boolean).is_none());
    }
}
