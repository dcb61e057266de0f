//! Engine configuration
//!
//! Settings come from the process environment (after an optional `.env` file
//! has been loaded). The resolver's vocabulary - synonyms, cue words and the
//! similarity threshold - is plain data with a built-in default and can be
//! replaced by a JSON file.

use crate::error::{EngineError, Result};
use crate::intent::{AggregateKind, Operator};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: Option<String>,
    /// Postgres schema that is introspected.
    pub pg_schema: String,
    pub query_timeout: Duration,
    pub cache_enabled: bool,
    pub cache_max_size: usize,
    /// `None` means entries never expire.
    pub cache_ttl: Option<Duration>,
    pub sample_values_per_column: usize,
    pub default_row_limit: u64,
    pub document_top_k: usize,
    pub max_connections: u32,
    pub vocabulary: Vocabulary,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            pg_schema: "public".to_string(),
            query_timeout: Duration::from_secs(30),
            cache_enabled: true,
            cache_max_size: 1000,
            cache_ttl: Some(Duration::from_secs(300)),
            sample_values_per_column: 50,
            default_row_limit: 1000,
            document_top_k: 5,
            max_connections: 10,
            vocabulary: Vocabulary::default(),
        }
    }
}

impl EngineConfig {
    /// Load from the environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let ttl_secs: u64 = parse_key(&lookup, "CACHE_TTL_SECONDS", 300)?;
        let vocabulary = match lookup("VOCABULARY_PATH").filter(|p| !p.trim().is_empty()) {
            Some(path) => Vocabulary::from_path(path)?,
            None => defaults.vocabulary,
        };

        let config = Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            pg_schema: lookup("PG_SCHEMA").unwrap_or(defaults.pg_schema),
            query_timeout: Duration::from_secs(parse_key(&lookup, "QUERY_TIMEOUT_SECS", 30)?),
            cache_enabled: parse_bool(&lookup, "CACHE_ENABLED", defaults.cache_enabled)?,
            cache_max_size: parse_key(&lookup, "CACHE_MAX_SIZE", defaults.cache_max_size)?,
            cache_ttl: (ttl_secs > 0).then(|| Duration::from_secs(ttl_secs)),
            sample_values_per_column: parse_key(
                &lookup,
                "SAMPLE_VALUES_PER_COLUMN",
                defaults.sample_values_per_column,
            )?,
            default_row_limit: parse_key(&lookup, "DEFAULT_ROW_LIMIT", defaults.default_row_limit)?,
            document_top_k: parse_key(&lookup, "DOCUMENT_TOP_K", defaults.document_top_k)?,
            max_connections: parse_key(&lookup, "MAX_CONNECTIONS", defaults.max_connections)?,
            vocabulary,
        };

        if config.cache_max_size == 0 {
            return Err(EngineError::Config(
                "CACHE_MAX_SIZE must be at least 1".to_string(),
            ));
        }
        if config.max_connections == 0 {
            return Err(EngineError::Config(
                "MAX_CONNECTIONS must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }
}

fn parse_key<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| EngineError::Config(format!("{} = '{}': {}", key, raw, e))),
    }
}

fn parse_bool<F>(lookup: &F, key: &str, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.trim().to_lowercase()) {
        None => Ok(default),
        Some(v) if v.is_empty() => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(EngineError::Config(format!("{} = '{}': expected a boolean", key, v))),
        },
    }
}

/// What a synonym phrase stands for. Candidates are tried in order and the
/// first one present in the catalog wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SynonymTarget {
    Table { candidates: Vec<String> },
    Column { candidates: Vec<String> },
    /// Phrase that is itself a filter, e.g. "python developers" meaning a
    /// substring match of "python" on a position-like column.
    Filter {
        columns: Vec<String>,
        operator: Operator,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synonym {
    pub phrase: String,
    pub target: SynonymTarget,
}

/// How a limit cue orders its rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitOrder {
    Highest,
    Lowest,
    Unordered,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Vocabulary {
    /// Minimum normalized Levenshtein similarity for a fuzzy match.
    pub similarity_threshold: f64,
    /// Longest phrase, in words, tried during matching.
    pub max_phrase_words: usize,
    pub synonyms: Vec<Synonym>,
    pub comparison_cues: BTreeMap<String, Operator>,
    pub aggregation_cues: BTreeMap<String, AggregateKind>,
    pub group_cues: Vec<String>,
    pub order_cues: Vec<String>,
    pub limit_cues: BTreeMap<String, LimitOrder>,
    pub ascending_words: Vec<String>,
    pub descending_words: Vec<String>,
    pub write_cues: Vec<String>,
    pub stop_words: Vec<String>,
}

impl Vocabulary {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        let vocabulary: Vocabulary = serde_json::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        if !(0.0..=1.0).contains(&vocabulary.similarity_threshold) {
            return Err(EngineError::Config(format!(
                "{}: similarity_threshold must be within [0, 1]",
                path.display()
            )));
        }
        info!(
            "📖 Loaded vocabulary from {} ({} synonyms)",
            path.display(),
            vocabulary.synonyms.len()
        );
        Ok(vocabulary)
    }
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|w| w.to_string()).collect()
}

fn column_synonym(phrases: &[&str], candidates: &[&str]) -> Vec<Synonym> {
    phrases
        .iter()
        .map(|p| Synonym {
            phrase: p.to_string(),
            target: SynonymTarget::Column {
                candidates: words(candidates),
            },
        })
        .collect()
}

impl Default for Vocabulary {
    fn default() -> Self {
        let mut synonyms = Vec::new();
        synonyms.extend(column_synonym(
            &[
                "salary", "salaries", "earning", "earnings", "earns", "earn", "paid", "pay",
                "compensation", "wage", "wages",
            ],
            &["annual_salary", "salary", "compensation", "pay", "wage"],
        ));
        synonyms.extend(column_synonym(
            &["hired", "hire date", "joined", "start date"],
            &["hire_date", "join_date", "start_date"],
        ));
        synonyms.extend(column_synonym(
            &["role", "roles", "title", "job", "job title"],
            &["position", "title", "job_title"],
        ));
        synonyms.extend(column_synonym(&["name", "names"], &["full_name", "name"]));
        for phrase in ["staff", "personnel", "workers", "people", "employee"] {
            synonyms.push(Synonym {
                phrase: phrase.to_string(),
                target: SynonymTarget::Table {
                    candidates: words(&["employees", "employee", "staff"]),
                },
            });
        }
        for phrase in ["python developer", "python developers"] {
            synonyms.push(Synonym {
                phrase: phrase.to_string(),
                target: SynonymTarget::Filter {
                    columns: words(&["position", "skills", "title"]),
                    operator: Operator::Contains,
                    value: "python".to_string(),
                },
            });
        }

        let comparison_cues = [
            ("over", Operator::Gt),
            ("above", Operator::Gt),
            ("more than", Operator::Gt),
            ("greater than", Operator::Gt),
            ("higher than", Operator::Gt),
            ("after", Operator::Gt),
            ("at least", Operator::Gte),
            ("since", Operator::Gte),
            ("under", Operator::Lt),
            ("below", Operator::Lt),
            ("less than", Operator::Lt),
            ("lower than", Operator::Lt),
            ("before", Operator::Lt),
            ("at most", Operator::Lte),
            ("equal to", Operator::Eq),
            ("equals", Operator::Eq),
            ("not", Operator::NotEq),
            ("other than", Operator::NotEq),
            ("containing", Operator::Contains),
            ("contains", Operator::Contains),
            ("like", Operator::Contains),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let aggregation_cues = [
            ("how many", AggregateKind::Count),
            ("number of", AggregateKind::Count),
            ("count", AggregateKind::Count),
            ("average", AggregateKind::Avg),
            ("avg", AggregateKind::Avg),
            ("mean", AggregateKind::Avg),
            ("total", AggregateKind::Sum),
            ("sum", AggregateKind::Sum),
            ("maximum", AggregateKind::Max),
            ("max", AggregateKind::Max),
            ("largest", AggregateKind::Max),
            ("minimum", AggregateKind::Min),
            ("min", AggregateKind::Min),
            ("smallest", AggregateKind::Min),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let limit_cues = [
            ("top", LimitOrder::Highest),
            ("highest", LimitOrder::Highest),
            ("bottom", LimitOrder::Lowest),
            ("lowest", LimitOrder::Lowest),
            ("first", LimitOrder::Unordered),
            ("limit", LimitOrder::Unordered),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            similarity_threshold: 0.8,
            max_phrase_words: 4,
            synonyms,
            comparison_cues,
            aggregation_cues,
            group_cues: words(&["per", "each", "for each", "grouped by", "group by", "broken down by"]),
            order_cues: words(&["sorted by", "ordered by", "order by", "sort by"]),
            limit_cues,
            ascending_words: words(&["ascending", "asc", "alphabetically", "oldest"]),
            descending_words: words(&["descending", "desc", "newest"]),
            write_cues: words(&[
                "delete", "remove", "update", "insert", "drop", "truncate", "alter", "create",
                "add",
            ]),
            stop_words: words(&[
                "show", "list", "display", "give", "me", "find", "get", "what", "which", "who",
                "are", "is", "was", "were", "the", "a", "an", "of", "in", "with", "all", "and",
                "whose", "that", "have", "has", "for", "to", "from", "on", "where", "please",
                "their", "there", "do", "does", "than", "i", "want", "see", "tell", "about",
                "working", "work", "works", "who's", "whom", "at", "as",
            ]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.pg_schema, "public");
        assert_eq!(config.query_timeout, Duration::from_secs(30));
        assert_eq!(config.cache_max_size, 1000);
        assert_eq!(config.cache_ttl, Some(Duration::from_secs(300)));
        assert_eq!(config.default_row_limit, 1000);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_overrides_and_disabled_ttl() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "sqlite::memory:"),
            ("CACHE_TTL_SECONDS", "0"),
            ("CACHE_ENABLED", "off"),
            ("DOCUMENT_TOP_K", "3"),
        ]))
        .unwrap();
        assert_eq!(config.database_url.as_deref(), Some("sqlite::memory:"));
        assert_eq!(config.cache_ttl, None);
        assert!(!config.cache_enabled);
        assert_eq!(config.document_top_k, 3);
    }

    #[test]
    fn test_malformed_value_names_key() {
        let err = EngineConfig::from_lookup(lookup(&[("QUERY_TIMEOUT_SECS", "soon")])).unwrap_err();
        match err {
            EngineError::Config(msg) => assert!(msg.contains("QUERY_TIMEOUT_SECS")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_vocabulary_json_partial_override() {
        let dir = std::env::temp_dir().join(format!("nlq-vocab-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("vocabulary.json");
        std::fs::write(
            &path,
            r#"{"similarity_threshold": 0.9, "synonyms": [
                {"phrase": "team", "target": {"kind": "table", "candidates": ["departments"]}}
            ]}"#,
        )
        .unwrap();

        let vocabulary = Vocabulary::from_path(&path).unwrap();
        assert_eq!(vocabulary.similarity_threshold, 0.9);
        assert_eq!(vocabulary.synonyms.len(), 1);
        // Fields absent from the file keep their defaults.
        assert_eq!(vocabulary.max_phrase_words, 4);
        assert!(vocabulary.comparison_cues.contains_key("over"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
