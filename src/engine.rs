//! Query Engine
//!
//! The one stateful object of the crate. It owns the session (database
//! source, published catalog, resolver and planner built against it), the
//! result cache and the document index, and answers questions against
//! whatever was published last.
//!
//! A rebuild never mutates the live session. The new catalog is built on the
//! side, swapped in under a short write lock and the cache is invalidated in
//! the same critical section; requests already holding the old session run
//! to completion against it and their results are refused by the cache.

use crate::cache::{
    CacheEntry, CacheSnapshot, CacheStats, Flight, InFlight, RecentQuery, ResultCache,
};
use crate::catalog::{CatalogBuilder, SchemaCatalog, SchemaSummary};
use crate::config::EngineConfig;
use crate::db::{self, connection::ConnectOptions, DatabaseSource, QueryRows};
use crate::documents::{DocumentIndex, DocumentMatch, ExtractedDocument};
use crate::error::{EngineError, Result};
use crate::intent::QueryIntent;
use crate::planner::{QueryPlanner, SqlPlan};
use crate::resolver::{self, EntityResolver, Resolution};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Merged answer to one question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    /// `None` when the question names nothing in the database or no
    /// database is connected.
    pub sql_results: Option<QueryRows>,
    pub document_results: Vec<DocumentMatch>,
    /// True when this request did not execute SQL itself.
    pub cache_hit: bool,
    /// Statement that produced `sql_results`.
    pub sql: Option<String>,
}

/// What a question would run, without running it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Translation {
    pub intent: QueryIntent,
    pub signature: String,
    pub plan: SqlPlan,
}

struct Session {
    source: Arc<dyn DatabaseSource>,
    resolver: EntityResolver,
    planner: QueryPlanner,
}

impl Session {
    fn catalog(&self) -> &Arc<SchemaCatalog> {
        self.resolver.catalog()
    }

    fn version(&self) -> u64 {
        self.catalog().version()
    }
}

struct SqlOutcome {
    entry: Arc<CacheEntry>,
    cache_hit: bool,
}

pub struct QueryEngine {
    config: EngineConfig,
    cache: ResultCache,
    session: RwLock<Option<Arc<Session>>>,
    documents: RwLock<Arc<DocumentIndex>>,
    versions: AtomicU64,
    /// Serializes catalog rebuilds so versions are published in order.
    rebuild: tokio::sync::Mutex<()>,
}

impl QueryEngine {
    pub fn new(config: EngineConfig) -> Self {
        let cache = ResultCache::new(config.cache_max_size, config.cache_ttl);
        Self {
            config,
            cache,
            session: RwLock::new(None),
            documents: RwLock::new(Arc::new(DocumentIndex::new())),
            versions: AtomicU64::new(0),
            rebuild: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Connect to `connection_string`, introspect it and publish its catalog.
    pub async fn connect(&self, connection_string: &str) -> Result<SchemaSummary> {
        let source = db::connect(connection_string, &ConnectOptions::from(&self.config)).await?;
        self.attach(source).await
    }

    /// Publish the catalog of an already opened source.
    pub async fn attach(&self, source: Arc<dyn DatabaseSource>) -> Result<SchemaSummary> {
        self.publish(source).await
    }

    /// Re-introspect the connected database and replace the catalog.
    pub async fn refresh_schema(&self) -> Result<SchemaSummary> {
        let source = self
            .current_session()
            .map(|s| Arc::clone(&s.source))
            .ok_or(EngineError::NotConnected)?;
        self.publish(source).await
    }

    /// Drop the session. Returns false when nothing was connected.
    pub async fn disconnect(&self) -> bool {
        let _rebuild = self.rebuild.lock().await;
        let version = self.versions.fetch_add(1, Ordering::SeqCst) + 1;
        let mut slot = self.session.write();
        let previous = slot.take();
        self.cache.invalidate_all(version);
        if let Some(session) = &previous {
            info!("🔌 Disconnected from {}", session.source.describe());
        }
        previous.is_some()
    }

    async fn publish(&self, source: Arc<dyn DatabaseSource>) -> Result<SchemaSummary> {
        let _rebuild = self.rebuild.lock().await;
        let version = self.versions.fetch_add(1, Ordering::SeqCst) + 1;

        let catalog = CatalogBuilder::new(self.config.sample_values_per_column)
            .build(source.as_ref(), version)
            .await?;
        let catalog = Arc::new(catalog);
        let summary = catalog.summary();
        let session = Session {
            planner: QueryPlanner::new(source.dialect(), self.config.default_row_limit),
            resolver: EntityResolver::new(catalog, &self.config.vocabulary),
            source,
        };

        {
            let mut slot = self.session.write();
            *slot = Some(Arc::new(session));
            self.cache.invalidate_all(version);
        }
        info!(
            "✅ Published catalog v{} ({} tables)",
            version,
            summary.tables.len()
        );
        Ok(summary)
    }

    fn current_session(&self) -> Option<Arc<Session>> {
        self.session.read().clone()
    }

    pub fn catalog(&self) -> Option<Arc<SchemaCatalog>> {
        self.current_session().map(|s| Arc::clone(s.catalog()))
    }

    pub fn schema_summary(&self) -> Option<SchemaSummary> {
        self.catalog().map(|c| c.summary())
    }

    /// Answer a question: SQL (through the cache) and documents side by side.
    pub async fn submit_query(&self, question: &str) -> Result<QueryResponse> {
        info!("🔍 Question: {}", question);
        let session = self.current_session();
        let documents = self.documents.read().clone();
        let keywords = resolver::keywords(question, &self.config.vocabulary);
        let top_k = self.config.document_top_k;

        let sql_part = async {
            match &session {
                Some(session) => self.answer_with_sql(session, question).await,
                None => {
                    debug!("No database connected, answering from documents only");
                    Ok(None)
                }
            }
        };
        let document_part = async { documents.match_documents(&keywords, top_k).collect::<Vec<_>>() };

        let (sql, document_results) = tokio::join!(sql_part, document_part);
        let response = match sql? {
            Some(outcome) => QueryResponse {
                sql: Some(outcome.entry.sql.clone()),
                sql_results: Some(outcome.entry.rows.clone()),
                document_results,
                cache_hit: outcome.cache_hit,
            },
            None => QueryResponse {
                sql_results: None,
                document_results,
                cache_hit: false,
                sql: None,
            },
        };
        info!(
            "✅ Answered: {} rows, {} documents, cache hit: {}",
            response.sql_results.as_ref().map_or(0, |r| r.len()),
            response.document_results.len(),
            response.cache_hit
        );
        Ok(response)
    }

    /// Resolve and plan a question without executing it. `None` when the
    /// question names nothing in the database.
    pub fn translate(&self, question: &str) -> Result<Option<Translation>> {
        let session = self.current_session().ok_or(EngineError::NotConnected)?;
        Self::translate_with(&session, question)
    }

    fn translate_with(session: &Session, question: &str) -> Result<Option<Translation>> {
        let intent = match session.resolver.resolve(question)? {
            Resolution::Intent(intent) => intent,
            Resolution::NoEntities => return Ok(None),
        };
        let plan = session.planner.plan(&intent, session.catalog())?;
        Ok(Some(Translation {
            signature: intent.signature(),
            intent,
            plan,
        }))
    }

    async fn answer_with_sql(&self, session: &Session, question: &str) -> Result<Option<SqlOutcome>> {
        let Some(translation) = Self::translate_with(session, question)? else {
            debug!("'{}' references no catalog entity", question);
            return Ok(None);
        };
        self.execute_once(session, question, translation).await.map(Some)
    }

    /// Cache lookup, then at most one execution per signature and catalog
    /// version; concurrent callers share the leader's result.
    async fn execute_once(
        &self,
        session: &Session,
        question: &str,
        translation: Translation,
    ) -> Result<SqlOutcome> {
        let use_cache = self.config.cache_enabled;
        let signature = translation.signature;
        let flight_key = format!("v{}:{}", session.version(), signature);

        loop {
            if use_cache {
                if let Some(entry) = self.cache.get(&signature) {
                    debug!("Cache hit for {}", signature);
                    return Ok(SqlOutcome {
                        entry,
                        cache_hit: true,
                    });
                }
            }

            match self.cache.inflight().join(&flight_key) {
                Flight::Leader(guard) => {
                    // The previous leader may have stored its result between
                    // our lookup and joining.
                    if use_cache {
                        if let Some(entry) = self.cache.peek(&signature) {
                            guard.complete(Ok(Arc::clone(&entry)));
                            return Ok(SqlOutcome {
                                entry,
                                cache_hit: true,
                            });
                        }
                    }

                    let result = self
                        .execute_with_timeout(session, &translation.plan)
                        .await
                        .map(|rows| {
                            Arc::new(
                                CacheEntry::new(
                                    translation.plan.sql.clone(),
                                    rows,
                                    session.version(),
                                )
                                .with_question(question),
                            )
                        });
                    if use_cache {
                        if let Ok(entry) = &result {
                            self.cache.put(signature.clone(), entry.as_ref().clone());
                        }
                    }
                    guard.complete(result.clone());
                    return result.map(|entry| SqlOutcome {
                        entry,
                        cache_hit: false,
                    });
                }
                Flight::Follower(rx) => {
                    debug!("Waiting on in-flight execution of {}", signature);
                    match InFlight::wait(rx).await {
                        Some(result) => {
                            return result.map(|entry| SqlOutcome {
                                entry,
                                cache_hit: true,
                            })
                        }
                        None => continue,
                    }
                }
            }
        }
    }

    async fn execute_with_timeout(&self, session: &Session, plan: &SqlPlan) -> Result<QueryRows> {
        let timeout = self.config.query_timeout;
        match tokio::time::timeout(timeout, session.source.execute(plan)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Query timed out after {:?}: {}", timeout, plan.sql);
                Err(EngineError::ExecutionTimeout {
                    after_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Add or replace documents. Returns the size of the new index.
    pub fn index_documents(&self, documents: impl IntoIterator<Item = ExtractedDocument>) -> usize {
        let mut slot = self.documents.write();
        let index = slot.with_documents(documents);
        let size = index.len();
        *slot = Arc::new(index);
        info!("📖 Document index now holds {} documents", size);
        size
    }

    pub fn remove_document(&self, document_id: &str) -> bool {
        let mut slot = self.documents.write();
        if !slot.contains(document_id) {
            return false;
        }
        let index = slot.without_document(document_id);
        *slot = Arc::new(index);
        true
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Newest cached answers first.
    pub fn recent_queries(&self, limit: usize) -> Vec<RecentQuery> {
        self.cache.recent(limit)
    }

    /// Drop expired cache entries now rather than on their next lookup.
    pub fn purge_expired_cache(&self) -> usize {
        self.cache.purge_expired()
    }

    pub fn invalidate_cache(&self) -> usize {
        self.cache.invalidate_all(self.cache.catalog_version())
    }

    /// Write the cache to `path`. Returns the number of entries written.
    pub fn save_cache_snapshot(&self, path: impl AsRef<Path>) -> Result<usize> {
        let catalog = self.catalog().ok_or(EngineError::NotConnected)?;
        let snapshot = self.cache.export_snapshot(catalog.fingerprint());
        snapshot.save(path)?;
        Ok(snapshot.entries.len())
    }

    /// Restore a snapshot written against a catalog with the same
    /// fingerprint. Returns the number of entries restored.
    pub fn load_cache_snapshot(&self, path: impl AsRef<Path>) -> Result<usize> {
        let catalog = self.catalog().ok_or(EngineError::NotConnected)?;
        let snapshot = CacheSnapshot::load(path)?;
        Ok(self.cache.restore_snapshot(snapshot, catalog.fingerprint()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{RawColumn, RawSchema, RawTable};
    use crate::planner::Dialect;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Single-table source that counts executions.
    struct CountingSource {
        executions: AtomicUsize,
        introspect_delay: std::time::Duration,
    }

    impl CountingSource {
        fn new() -> Self {
            Self::slow(std::time::Duration::ZERO)
        }

        fn slow(introspect_delay: std::time::Duration) -> Self {
            Self {
                executions: AtomicUsize::new(0),
                introspect_delay,
            }
        }
    }

    #[async_trait]
    impl DatabaseSource for CountingSource {
        fn dialect(&self) -> Dialect {
            Dialect::Sqlite
        }

        fn describe(&self) -> String {
            "counting".to_string()
        }

        async fn introspect(&self) -> Result<RawSchema> {
            tokio::time::sleep(self.introspect_delay).await;
            let column = |name: &str, ty: &str| RawColumn {
                name: name.to_string(),
                declared_type: ty.to_string(),
                nullable: false,
            };
            Ok(RawSchema {
                tables: vec![RawTable {
                    name: "projects".to_string(),
                    is_view: false,
                    columns: vec![column("project_id", "INTEGER"), column("budget", "NUMERIC")],
                    primary_key: vec!["project_id".to_string()],
                    foreign_keys: vec![],
                    row_estimate: Some(1),
                }],
            })
        }

        async fn distinct_values(&self, _: &str, _: &str, _: usize) -> Result<Vec<String>> {
            Ok(vec![])
        }

        async fn execute(&self, plan: &SqlPlan) -> Result<QueryRows> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            Ok(QueryRows {
                columns: plan.output_columns.clone(),
                rows: vec![],
            })
        }
    }

    async fn engine() -> (QueryEngine, Arc<CountingSource>) {
        let source = Arc::new(CountingSource::new());
        let engine = QueryEngine::new(EngineConfig::default());
        engine.attach(source.clone()).await.unwrap();
        (engine, source)
    }

    #[tokio::test]
    async fn test_not_connected() {
        let engine = QueryEngine::new(EngineConfig::default());
        assert_eq!(engine.refresh_schema().await.unwrap_err(), EngineError::NotConnected);
        assert_eq!(engine.translate("projects").unwrap_err(), EngineError::NotConnected);

        let response = engine.submit_query("projects").await.unwrap();
        assert!(response.sql_results.is_none());
        assert!(!response.cache_hit);
    }

    #[tokio::test]
    async fn test_versions_increase_on_publish() {
        let (engine, _) = engine().await;
        assert_eq!(engine.schema_summary().unwrap().catalog_version, 1);
        assert_eq!(engine.refresh_schema().await.unwrap().catalog_version, 2);
        assert_eq!(engine.cache_stats().catalog_version, 2);
    }

    #[tokio::test]
    async fn test_translate_does_not_execute() {
        let (engine, source) = engine().await;
        let translation = engine.translate("projects with budget over 5000").unwrap().unwrap();
        assert_eq!(translation.intent.base_table, "projects");
        assert!(translation.plan.sql.contains("\"budget\" > ?1"));
        assert_eq!(source.executions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cache_disabled_always_executes() {
        let source = Arc::new(CountingSource::new());
        let config = EngineConfig {
            cache_enabled: false,
            ..EngineConfig::default()
        };
        let engine = QueryEngine::new(config);
        engine.attach(source.clone()).await.unwrap();

        assert!(!engine.submit_query("projects").await.unwrap().cache_hit);
        assert!(!engine.submit_query("projects").await.unwrap().cache_hit);
        assert_eq!(source.executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disconnect_clears_session_and_cache() {
        let (engine, _) = engine().await;
        engine.submit_query("projects").await.unwrap();
        assert_eq!(engine.cache_stats().size, 1);

        assert!(engine.disconnect().await);
        assert!(!engine.disconnect().await);
        assert!(engine.catalog().is_none());
        assert_eq!(engine.cache_stats().size, 0);
    }

    #[tokio::test]
    async fn test_disconnect_waits_for_running_refresh() {
        let source = Arc::new(CountingSource::slow(std::time::Duration::from_millis(100)));
        let engine = Arc::new(QueryEngine::new(EngineConfig::default()));
        engine.attach(source).await.unwrap();

        let refresh = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.refresh_schema().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(engine.disconnect().await);

        assert_eq!(refresh.await.unwrap().unwrap().catalog_version, 2);
        assert!(engine.catalog().is_none());
        assert_eq!(engine.cache_stats().catalog_version, 3);
    }

    #[tokio::test]
    async fn test_document_index_swap() {
        let (engine, _) = engine().await;
        let doc = |id: &str, text: &str| ExtractedDocument {
            document_id: id.to_string(),
            text: text.to_string(),
            metadata: Default::default(),
        };
        assert_eq!(
            engine.index_documents(vec![doc("a", "budget planning"), doc("b", "hiring plan")]),
            2
        );
        let response = engine.submit_query("budget planning notes").await.unwrap();
        assert_eq!(response.document_results[0].document_id, "a");

        assert!(engine.remove_document("a"));
        assert!(!engine.remove_document("a"));
        let response = engine.submit_query("budget planning notes").await.unwrap();
        assert!(response.document_results.is_empty());
    }
}
