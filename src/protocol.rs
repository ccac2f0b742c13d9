//! Protocol descriptor types bundled with every survey archive.
//!
//! The descriptor declares each tabular dataset's fields and types, the
//! geometry-bearing field pairs, and the protocol version that keys the
//! target schema generation.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, de};
use thiserror::Error;

/// Descriptor documents must carry this meta name to be accepted.
pub const META_NAME: &str = "survey-protocol";

/// Highest descriptor meta version this crate understands.
pub const SUPPORTED_META_VERSION: u32 = 2;

/// Default spatial reference (WGS84) when the descriptor omits one.
pub const DEFAULT_SPATIAL_REFERENCE: u32 = 4326;

/// Protocol version parsed from the descriptor's `version` property.
///
/// Versions compare numerically, never lexically: `"2.10"` is newer than
/// `"2.9"`. The schema generation is keyed by [`ProtocolVersion::major`]
/// alone; minor revisions reuse the generation created for their major.
///
/// # Examples
/// ```
/// # use survey_sync::protocol::ProtocolVersion;
/// let version: ProtocolVersion = "2.1".parse().expect("valid version");
/// assert_eq!(version.major, 2);
/// assert_eq!(version.minor, 1);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ProtocolVersion {
    /// Major revision; the schema generation key.
    pub major: u32,
    /// Minor revision; reuses the major's generation.
    pub minor: u32,
}

impl ProtocolVersion {
    /// Construct a version from its parts.
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Error raised when a version string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid protocol version {value:?}; expected \"major\" or \"major.minor\"")]
pub struct ParseVersionError {
    /// The rejected input.
    pub value: String,
}

impl FromStr for ProtocolVersion {
    type Err = ParseVersionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseVersionError {
            value: value.to_owned(),
        };
        let mut parts = value.trim().splitn(2, '.');
        let major = parts
            .next()
            .and_then(|part| part.parse::<u32>().ok())
            .ok_or_else(invalid)?;
        let minor = match parts.next() {
            Some(part) => part.parse::<u32>().map_err(|_| invalid())?,
            None => 0,
        };
        Ok(Self { major, minor })
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct VersionVisitor;

        impl de::Visitor<'_> for VersionVisitor {
            type Value = ProtocolVersion;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a \"major.minor\" string or number")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                value.parse().map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
                let major = u32::try_from(value).map_err(E::custom)?;
                Ok(ProtocolVersion::new(major, 0))
            }

            fn visit_f64<E: de::Error>(self, value: f64) -> Result<Self::Value, E> {
                // JSON numbers such as 2.1 round-trip through their display
                // form so the minor digits survive intact.
                format!("{value}").parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(VersionVisitor)
    }
}

/// Logical column types a protocol table may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// 64-bit signed integer.
    Integer,
    /// 64-bit floating point.
    Real,
    /// UTF-8 text.
    Text,
    /// Calendar timestamp, stored as ISO-8601 text.
    Date,
    /// True/false flag.
    Boolean,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Integer => "integer",
            Self::Real => "real",
            Self::Text => "text",
            Self::Date => "date",
            Self::Boolean => "boolean",
        };
        f.write_str(name)
    }
}

/// One column of a protocol table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FieldDef {
    /// Column name as it appears in the CSV header.
    pub name: String,
    /// Declared logical type.
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Whether empty cells are permitted. Defaults to true.
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

/// The geometry-bearing field pair of a table, `x` being longitude and `y`
/// latitude in the descriptor's spatial reference.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GeometryPair {
    /// Field holding the x (longitude) ordinate.
    pub x: String,
    /// Field holding the y (latitude) ordinate.
    pub y: String,
}

/// One tabular dataset declared by the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TableDef {
    /// Dataset name; the archive carries `<name>.csv`.
    pub name: String,
    /// Ordered column declarations.
    pub fields: Vec<FieldDef>,
    /// Optional geometry-bearing field pair.
    #[serde(default)]
    pub geometry: Option<GeometryPair>,
}

impl TableDef {
    /// Look up a declared field by name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Position of a declared field within the typed row layout.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }
}

/// The versioned schema definition bundled with a survey archive.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProtocolDescriptor {
    /// Specification family; must equal [`META_NAME`].
    pub meta_name: String,
    /// Specification revision; must not exceed [`SUPPORTED_META_VERSION`].
    #[serde(default = "default_meta_version")]
    pub meta_version: u32,
    /// Human-readable protocol name; also names the target store.
    pub name: String,
    /// Protocol version; the major number keys the schema generation.
    pub version: ProtocolVersion,
    /// EPSG code for all geometry in this protocol.
    #[serde(default = "default_spatial_reference")]
    pub spatial_reference: u32,
    /// Tabular datasets the archive may carry.
    pub tables: Vec<TableDef>,
}

fn default_meta_version() -> u32 {
    1
}

fn default_spatial_reference() -> u32 {
    DEFAULT_SPATIAL_REFERENCE
}

/// Errors raised when reading a protocol descriptor document.
#[derive(Debug, Error)]
pub enum DescriptorError {
    /// The document was not valid JSON or missed required properties.
    #[error("protocol descriptor is not valid JSON")]
    Syntax {
        /// Decoding failure reported by `serde_json`.
        #[source]
        source: serde_json::Error,
    },
    /// The document declares a different specification family.
    #[error("descriptor meta name {found:?} is not {META_NAME:?}")]
    UnsupportedMetaName {
        /// Meta name found in the document.
        found: String,
    },
    /// The document uses a newer specification revision than supported.
    #[error(
        "descriptor meta version {found} exceeds supported version {SUPPORTED_META_VERSION}"
    )]
    UnsupportedMetaVersion {
        /// Meta version found in the document.
        found: u32,
    },
}

impl ProtocolDescriptor {
    /// Parse and validate a descriptor document.
    ///
    /// # Examples
    /// ```
    /// # use survey_sync::protocol::ProtocolDescriptor;
    /// let descriptor = ProtocolDescriptor::from_json(
    ///     r#"{
    ///         "meta_name": "survey-protocol",
    ///         "meta_version": 2,
    ///         "name": "Shorebirds",
    ///         "version": "2.1",
    ///         "tables": []
    ///     }"#,
    /// )
    /// .expect("valid descriptor");
    /// assert_eq!(descriptor.generation(), 2);
    /// ```
    pub fn from_json(document: &str) -> Result<Self, DescriptorError> {
        let descriptor: Self =
            serde_json::from_str(document).map_err(|source| DescriptorError::Syntax { source })?;
        if descriptor.meta_name != META_NAME {
            return Err(DescriptorError::UnsupportedMetaName {
                found: descriptor.meta_name,
            });
        }
        if descriptor.meta_version > SUPPORTED_META_VERSION {
            return Err(DescriptorError::UnsupportedMetaVersion {
                found: descriptor.meta_version,
            });
        }
        Ok(descriptor)
    }

    /// The schema generation this descriptor resolves to.
    pub fn generation(&self) -> u32 {
        self.version.major
    }

    /// Look up a declared table by name.
    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|table| table.name == name)
    }
}
