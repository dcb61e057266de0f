pub mod cache;
pub mod catalog;
pub mod config;
pub mod db;
pub mod documents;
pub mod engine;
pub mod error;
pub mod intent;
pub mod planner;
pub mod resolver;

pub use cache::{CacheStats, RecentQuery, ResultCache};
pub use catalog::{CatalogBuilder, SchemaCatalog, SchemaSummary};
pub use config::{EngineConfig, Vocabulary};
pub use db::{DatabaseSource, QueryRows};
pub use documents::{DocumentIndex, DocumentMatch, ExtractedDocument};
pub use engine::{QueryEngine, QueryResponse, Translation};
pub use error::{EngineError, Result};
pub use intent::QueryIntent;
pub use planner::{Dialect, QueryPlanner, SqlPlan};
pub use resolver::{EntityResolver, Resolution};
