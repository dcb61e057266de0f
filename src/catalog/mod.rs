//! Schema catalog
//!
//! Typed model of a connected database: tables, columns, keys and the
//! relationships between them. A catalog is immutable once built; a schema
//! refresh produces a whole new catalog which replaces the old one.

pub mod builder;
pub mod join_graph;

pub use builder::{normalize_type, singularize, CatalogBuilder};
pub use join_graph::JoinStep;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Canonical column type every vendor type name is folded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalType {
    Integer,
    Decimal,
    Text,
    Date,
    Boolean,
    Other,
}

impl CanonicalType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, CanonicalType::Integer | CanonicalType::Decimal)
    }

    /// Types that support `<`/`>` comparisons.
    pub fn is_ordered(&self) -> bool {
        matches!(
            self,
            CanonicalType::Integer | CanonicalType::Decimal | CanonicalType::Date
        )
    }
}

impl fmt::Display for CanonicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CanonicalType::Integer => "integer",
            CanonicalType::Decimal => "decimal",
            CanonicalType::Text => "text",
            CanonicalType::Date => "date",
            CanonicalType::Boolean => "boolean",
            CanonicalType::Other => "other",
        };
        f.write_str(name)
    }
}

/// Explicit foreign key declared by the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnModel {
    pub name: String,
    pub declared_type: String,
    pub canonical_type: CanonicalType,
    pub nullable: bool,
    pub foreign_key: Option<ForeignKeyRef>,
    /// Distinct values of low-cardinality text columns, empty otherwise.
    #[serde(default)]
    pub sample_values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableModel {
    pub name: String,
    pub is_view: bool,
    pub columns: Vec<ColumnModel>,
    /// Single-column primary key; composite keys are not modelled.
    pub primary_key: Option<String>,
    /// Informational only.
    pub row_estimate: Option<i64>,
}

impl TableModel {
    pub fn column(&self, name: &str) -> Option<&ColumnModel> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn primary_key_column(&self) -> Option<&ColumnModel> {
        self.primary_key.as_deref().and_then(|pk| self.column(pk))
    }

    /// Column used when a whole table is grouped on or ordered by: the first
    /// name-like text column, else the first non-key text column, else the
    /// primary key.
    pub fn display_column(&self) -> Option<&ColumnModel> {
        let is_key = |c: &ColumnModel| {
            self.primary_key.as_deref() == Some(c.name.as_str()) || c.foreign_key.is_some()
        };
        self.columns
            .iter()
            .find(|c| {
                c.canonical_type == CanonicalType::Text
                    && !is_key(c)
                    && c.name.to_lowercase().contains("name")
            })
            .or_else(|| {
                self.columns
                    .iter()
                    .find(|c| c.canonical_type == CanonicalType::Text && !is_key(c))
            })
            .or_else(|| self.primary_key_column())
    }
}

/// How a relationship was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipOrigin {
    ForeignKey,
    Inferred,
}

/// Directed edge `from_table.from_column -> to_table.to_column`; the `to`
/// side is the referenced key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relationship {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
    pub origin: RelationshipOrigin,
}

impl Relationship {
    pub fn is_explicit(&self) -> bool {
        self.origin == RelationshipOrigin::ForeignKey
    }
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{}",
            self.from_table, self.from_column, self.to_table, self.to_column
        )
    }
}

/// Reference to a column in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaCatalog {
    version: u64,
    fingerprint: String,
    /// Keyed by lower-cased table name.
    tables: BTreeMap<String, TableModel>,
    relationships: Vec<Relationship>,
}

impl SchemaCatalog {
    pub(crate) fn new(
        version: u64,
        fingerprint: String,
        tables: BTreeMap<String, TableModel>,
        relationships: Vec<Relationship>,
    ) -> Self {
        Self {
            version,
            fingerprint,
            tables,
            relationships,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// SHA-256 over the catalog structure; equal fingerprints mean cached SQL
    /// built against one catalog is valid against the other.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Tables in name order.
    pub fn tables(&self) -> impl Iterator<Item = &TableModel> {
        self.tables.values()
    }

    pub fn table(&self, name: &str) -> Option<&TableModel> {
        self.tables.get(&name.to_lowercase())
    }

    pub fn column(&self, column: &ColumnRef) -> Option<&ColumnModel> {
        self.table(&column.table)
            .and_then(|t| t.column(&column.column))
    }

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn summary(&self) -> SchemaSummary {
        let tables = self
            .tables
            .values()
            .map(|t| TableSummary {
                name: t.name.clone(),
                column_count: t.columns.len(),
                primary_key: t.primary_key.clone(),
                row_estimate: t.row_estimate,
                is_view: t.is_view,
            })
            .collect();
        let explicit = self.relationships.iter().filter(|r| r.is_explicit()).count();
        SchemaSummary {
            catalog_version: self.version,
            fingerprint: self.fingerprint.clone(),
            tables,
            explicit_relationships: explicit,
            inferred_relationships: self.relationships.len() - explicit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSummary {
    pub name: String,
    pub column_count: usize,
    pub primary_key: Option<String>,
    pub row_estimate: Option<i64>,
    pub is_view: bool,
}

/// What `connect` and `refresh_schema` report back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSummary {
    pub catalog_version: u64,
    pub fingerprint: String,
    pub tables: Vec<TableSummary>,
    pub explicit_relationships: usize,
    pub inferred_relationships: usize,
}
