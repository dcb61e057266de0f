//! Catalog builder
//!
//! Turns raw introspection output into a validated [`SchemaCatalog`]:
//! vendor type names are folded into [`CanonicalType`], explicit foreign
//! keys are checked against the discovered columns, and relationships are
//! inferred from naming conventions where no constraint exists.

use super::{
    CanonicalType, ColumnModel, ForeignKeyRef, Relationship, RelationshipOrigin, SchemaCatalog,
    TableModel,
};
use crate::db::{DatabaseSource, RawSchema, RawTable};
use crate::error::Result;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// Fold a vendor type name into the canonical type set.
pub fn normalize_type(declared: &str) -> CanonicalType {
    let lower = declared.trim().to_lowercase();
    // Strip length/precision arguments: varchar(100), numeric(10,2)
    let base = lower.split('(').next().unwrap_or("").trim();

    match base {
        "int" | "integer" | "int2" | "int4" | "int8" | "smallint" | "bigint" | "tinyint"
        | "mediumint" | "serial" | "smallserial" | "bigserial" => CanonicalType::Integer,
        "decimal" | "numeric" | "real" | "float" | "float4" | "float8" | "double"
        | "double precision" | "money" => CanonicalType::Decimal,
        "text" | "varchar" | "character varying" | "char" | "character" | "bpchar"
        | "nvarchar" | "nchar" | "string" | "clob" | "citext" | "name" => CanonicalType::Text,
        "date" | "datetime" | "timestamp" | "timestamptz" | "timestamp with time zone"
        | "timestamp without time zone" => CanonicalType::Date,
        "bool" | "boolean" => CanonicalType::Boolean,
        "" => CanonicalType::Other,
        // SQLite type affinity rules for anything else
        other if other.contains("int") => CanonicalType::Integer,
        other if other.contains("char") || other.contains("clob") || other.contains("text") => {
            CanonicalType::Text
        }
        other if other.contains("real") || other.contains("floa") || other.contains("doub") => {
            CanonicalType::Decimal
        }
        _ => CanonicalType::Other,
    }
}

/// Naive English singular used for matching table names ("departments" ->
/// "department", "categories" -> "category").
pub fn singularize(word: &str) -> String {
    let lower = word.to_lowercase();
    if let Some(stem) = lower.strip_suffix("ies") {
        if stem.len() > 1 {
            return format!("{}y", stem);
        }
    }
    for suffix in ["sses", "shes", "ches", "xes"] {
        if lower.ends_with(suffix) {
            return lower[..lower.len() - 2].to_string();
        }
    }
    if lower.ends_with('s') && !lower.ends_with("ss") && lower.len() > 3 {
        return lower[..lower.len() - 1].to_string();
    }
    lower
}

pub struct CatalogBuilder {
    sample_values_per_column: usize,
}

impl Default for CatalogBuilder {
    fn default() -> Self {
        Self {
            sample_values_per_column: 50,
        }
    }
}

impl CatalogBuilder {
    pub fn new(sample_values_per_column: usize) -> Self {
        Self {
            sample_values_per_column,
        }
    }

    /// Introspect a live source and build a catalog stamped with `version`.
    pub async fn build(&self, source: &dyn DatabaseSource, version: u64) -> Result<SchemaCatalog> {
        info!("🔍 Introspecting schema of {}", source.describe());
        let raw = source.introspect().await?;
        let mut catalog = Self::from_raw(raw, version);

        if self.sample_values_per_column > 0 {
            let mut samples: HashMap<(String, String), Vec<String>> = HashMap::new();
            for table in catalog.tables() {
                for column in &table.columns {
                    if !Self::is_sampling_candidate(table, column) {
                        continue;
                    }
                    // One extra row tells us the column exceeds the limit.
                    let values = source
                        .distinct_values(&table.name, &column.name, self.sample_values_per_column + 1)
                        .await?;
                    if values.len() <= self.sample_values_per_column {
                        samples.insert((table.name.to_lowercase(), column.name.clone()), values);
                    }
                }
            }
            Self::attach_samples(&mut catalog, samples);
        }

        info!(
            "✅ Catalog v{} built: {} tables, {} relationships",
            catalog.version(),
            catalog.summary().tables.len(),
            catalog.relationships().len()
        );
        Ok(catalog)
    }

    fn is_sampling_candidate(table: &TableModel, column: &ColumnModel) -> bool {
        column.canonical_type == CanonicalType::Text
            && column.foreign_key.is_none()
            && table.primary_key.as_deref() != Some(column.name.as_str())
    }

    fn attach_samples(catalog: &mut SchemaCatalog, samples: HashMap<(String, String), Vec<String>>) {
        for ((table, column), values) in samples {
            if let Some(model) = catalog.tables.get_mut(&table) {
                if let Some(col) = model.columns.iter_mut().find(|c| c.name == column) {
                    col.sample_values = values;
                }
            }
        }
        catalog.fingerprint = fingerprint(&catalog.tables, &catalog.relationships);
    }

    /// Build a catalog from introspection output without touching a database.
    pub fn from_raw(raw: RawSchema, version: u64) -> SchemaCatalog {
        let mut tables: BTreeMap<String, TableModel> = BTreeMap::new();
        for raw_table in &raw.tables {
            let model = table_model(raw_table);
            tables.insert(model.name.to_lowercase(), model);
        }

        let mut relationships = explicit_relationships(&raw, &mut tables);
        relationships.extend(inferred_relationships(&tables));
        relationships.sort_by(|a, b| {
            (&a.from_table, &a.from_column, &a.to_table, &a.to_column, a.origin)
                .cmp(&(&b.from_table, &b.from_column, &b.to_table, &b.to_column, b.origin))
        });

        let fingerprint = fingerprint(&tables, &relationships);
        SchemaCatalog::new(version, fingerprint, tables, relationships)
    }
}

fn table_model(raw: &RawTable) -> TableModel {
    let columns = raw
        .columns
        .iter()
        .map(|c| ColumnModel {
            name: c.name.clone(),
            declared_type: c.declared_type.clone(),
            canonical_type: normalize_type(&c.declared_type),
            nullable: c.nullable,
            foreign_key: None,
            sample_values: Vec::new(),
        })
        .collect();

    let primary_key = match raw.primary_key.as_slice() {
        [single] => Some(single.clone()),
        _ => None,
    };

    TableModel {
        name: raw.name.clone(),
        is_view: raw.is_view,
        columns,
        primary_key,
        row_estimate: raw.row_estimate,
    }
}

/// Declared foreign keys whose endpoints exist. Dangling ones are dropped.
fn explicit_relationships(
    raw: &RawSchema,
    tables: &mut BTreeMap<String, TableModel>,
) -> Vec<Relationship> {
    let mut relationships = Vec::new();

    for raw_table in &raw.tables {
        for fk in &raw_table.foreign_keys {
            let Some(target) = tables.get(&fk.ref_table.to_lowercase()) else {
                warn!(
                    "Dropping foreign key {}.{}: table '{}' not in catalog",
                    raw_table.name, fk.column, fk.ref_table
                );
                continue;
            };
            let target_column = match &fk.ref_column {
                Some(col) => target.column(col).map(|c| c.name.clone()),
                None => target.primary_key.clone(),
            };
            let Some(target_column) = target_column else {
                warn!(
                    "Dropping foreign key {}.{}: referenced column missing on '{}'",
                    raw_table.name, fk.column, target.name
                );
                continue;
            };
            let target_name = target.name.clone();

            let Some(source) = tables.get_mut(&raw_table.name.to_lowercase()) else {
                continue;
            };
            let Some(column) = source
                .columns
                .iter_mut()
                .find(|c| c.name.eq_ignore_ascii_case(&fk.column))
            else {
                warn!(
                    "Dropping foreign key on {}: column '{}' not in catalog",
                    raw_table.name, fk.column
                );
                continue;
            };

            column.foreign_key = Some(ForeignKeyRef {
                table: target_name.clone(),
                column: target_column.clone(),
            });
            relationships.push(Relationship {
                from_table: source.name.clone(),
                from_column: column.name.clone(),
                to_table: target_name,
                to_column: target_column,
                origin: RelationshipOrigin::ForeignKey,
            });
        }
    }

    relationships
}

/// Name-based inference for columns without a declared foreign key. A column
/// is linked only when exactly one other table's primary key fits.
fn inferred_relationships(tables: &BTreeMap<String, TableModel>) -> Vec<Relationship> {
    let mut relationships = Vec::new();

    for table in tables.values() {
        for column in &table.columns {
            if column.foreign_key.is_some() {
                continue;
            }
            let name = column.name.to_lowercase();
            if !name.ends_with("_id") {
                continue;
            }

            let candidates: Vec<(&TableModel, &ColumnModel)> = tables
                .values()
                .filter(|other| other.name != table.name)
                .filter_map(|other| {
                    let pk = other.primary_key_column()?;
                    if pk.canonical_type != column.canonical_type {
                        return None;
                    }
                    let pk_name = pk.name.to_lowercase();
                    let other_name = other.name.to_lowercase();
                    let same_key = pk_name == name;
                    let table_key = pk_name == "id"
                        && (name == format!("{}_id", singularize(&other_name))
                            || name == format!("{}_id", other_name));
                    (same_key || table_key).then_some((other, pk))
                })
                .collect();

            match candidates.as_slice() {
                [(target, pk)] => {
                    debug!(
                        "Inferred relationship {}.{} -> {}.{}",
                        table.name, column.name, target.name, pk.name
                    );
                    relationships.push(Relationship {
                        from_table: table.name.clone(),
                        from_column: column.name.clone(),
                        to_table: target.name.clone(),
                        to_column: pk.name.clone(),
                        origin: RelationshipOrigin::Inferred,
                    });
                }
                [] => {}
                many => debug!(
                    "Leaving {}.{} unresolved: {} candidate tables",
                    table.name,
                    column.name,
                    many.len()
                ),
            }
        }
    }

    relationships
}

fn fingerprint(tables: &BTreeMap<String, TableModel>, relationships: &[Relationship]) -> String {
    let mut hasher = Sha256::new();
    for table in tables.values() {
        hasher.update(table.name.as_bytes());
        hasher.update([0]);
        for column in &table.columns {
            hasher.update(column.name.as_bytes());
            hasher.update(b":");
            hasher.update(column.canonical_type.to_string().as_bytes());
            hasher.update([u8::from(column.nullable)]);
            for value in &column.sample_values {
                hasher.update(value.as_bytes());
                hasher.update([1]);
            }
        }
        if let Some(pk) = &table.primary_key {
            hasher.update(b"pk:");
            hasher.update(pk.as_bytes());
        }
        hasher.update([0xff]);
    }
    for rel in relationships {
        hasher.update(rel.to_string().as_bytes());
        hasher.update([rel.origin as u8]);
    }
    format!("{:x}", hasher.finalize())
}
