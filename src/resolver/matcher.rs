//! Phrase lexicon and fuzzy matching
//!
//! Every phrase the resolver can recognise lives here: cue words from the
//! vocabulary, table and column names derived from the catalog, synonyms,
//! and sampled column values. Lookups are exact; the fuzzy fallback scores
//! single words with normalized Levenshtein similarity.

use crate::catalog::{singularize, ColumnRef, SchemaCatalog};
use crate::config::{LimitOrder, SynonymTarget, Vocabulary};
use crate::error::{EngineError, Result};
use crate::intent::{AggregateKind, Direction, Operator};
use std::collections::{HashMap, HashSet};
use strsim::normalized_levenshtein;

#[derive(Debug, Clone, PartialEq)]
pub enum Cue {
    Compare(Operator),
    Aggregate(AggregateKind),
    Group,
    /// Plain "by": grouping when aggregating, ordering otherwise.
    By,
    Order,
    Limit(LimitOrder),
    Direction(Direction),
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Entity {
    Table(String),
    Column(ColumnRef),
    Filter {
        column: ColumnRef,
        operator: Operator,
        value: String,
    },
}

impl Entity {
    fn describe(&self) -> String {
        match self {
            Entity::Table(t) => t.clone(),
            Entity::Column(c) => c.to_string(),
            Entity::Filter { column, .. } => column.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct LexEntry {
    entity: Entity,
    /// Catalog name rather than a synonym.
    exact: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PhraseMatch {
    Cue(Cue),
    Entities(Vec<Entity>),
    /// Sampled value: (column, value as stored).
    Value(Vec<(ColumnRef, String)>),
}

pub struct Lexicon {
    cues: HashMap<String, Cue>,
    entities: HashMap<String, Vec<LexEntry>>,
    values: HashMap<String, Vec<(ColumnRef, String)>>,
    stop_words: HashSet<String>,
    threshold: f64,
    max_words: usize,
}

impl Lexicon {
    pub fn build(catalog: &SchemaCatalog, vocabulary: &Vocabulary) -> Self {
        let mut lexicon = Self {
            cues: build_cues(vocabulary),
            entities: HashMap::new(),
            values: HashMap::new(),
            stop_words: vocabulary.stop_words.iter().map(|w| w.to_lowercase()).collect(),
            threshold: vocabulary.similarity_threshold,
            max_words: vocabulary.max_phrase_words.max(1),
        };

        for table in catalog.tables() {
            let lower = table.name.to_lowercase();
            let spaced = lower.replace('_', " ");
            let mut phrases = vec![lower.clone(), spaced.clone(), singularize(&spaced)];
            phrases.push(singularize(&lower).replace('_', " "));
            for phrase in phrases {
                lexicon.add_entity(&phrase, Entity::Table(table.name.clone()), true);
            }

            for column in &table.columns {
                let column_ref = ColumnRef::new(table.name.clone(), column.name.clone());
                let lower = column.name.to_lowercase();
                for phrase in [lower.clone(), lower.replace('_', " ")] {
                    lexicon.add_entity(&phrase, Entity::Column(column_ref.clone()), true);
                }
                for value in &column.sample_values {
                    let key = normalize_phrase(value);
                    if key.is_empty() {
                        continue;
                    }
                    let entry = lexicon.values.entry(key).or_default();
                    if !entry.iter().any(|(c, _)| *c == column_ref) {
                        entry.push((column_ref.clone(), value.clone()));
                    }
                }
            }
        }

        for synonym in &vocabulary.synonyms {
            let phrase = normalize_phrase(&synonym.phrase);
            for entity in synonym_entities(catalog, &synonym.target) {
                lexicon.add_entity(&phrase, entity, false);
            }
        }

        lexicon
    }

    fn add_entity(&mut self, phrase: &str, entity: Entity, exact: bool) {
        let phrase = normalize_phrase(phrase);
        if phrase.is_empty() {
            return;
        }
        let entries = self.entities.entry(phrase).or_default();
        if !entries.iter().any(|e| e.entity == entity) {
            entries.push(LexEntry { entity, exact });
        }
    }

    pub fn max_words(&self) -> usize {
        self.max_words
    }

    pub fn is_stop_word(&self, word: &str) -> bool {
        self.stop_words.contains(word)
    }

    /// Exact lookup of a lower-cased, space-joined phrase. Cues win over
    /// entities, catalog names over synonyms, entities over sampled values.
    pub fn lookup(&self, phrase: &str) -> Option<PhraseMatch> {
        if let Some(cue) = self.cues.get(phrase) {
            return Some(PhraseMatch::Cue(cue.clone()));
        }
        if let Some(entries) = self.entities.get(phrase) {
            let exact: Vec<Entity> = entries
                .iter()
                .filter(|e| e.exact)
                .map(|e| e.entity.clone())
                .collect();
            let entities = if exact.is_empty() {
                entries.iter().map(|e| e.entity.clone()).collect()
            } else {
                exact
            };
            return Some(PhraseMatch::Entities(entities));
        }
        self.values
            .get(phrase)
            .map(|values| PhraseMatch::Value(values.clone()))
    }

    /// Best fuzzy entity match for a single word at or above the similarity
    /// threshold. Entities sharing the best score are all returned.
    pub fn fuzzy(&self, word: &str) -> Option<(Vec<Entity>, f64)> {
        if word.chars().count() < 4 || self.is_stop_word(word) {
            return None;
        }

        let mut best_score = self.threshold;
        let mut best: Vec<Entity> = Vec::new();
        for (phrase, entries) in &self.entities {
            let score = similarity(word, phrase);
            if score < self.threshold {
                continue;
            }
            if score > best_score + f64::EPSILON {
                best_score = score;
                best.clear();
            } else if score + f64::EPSILON < best_score {
                continue;
            }
            for entry in entries {
                if !best.contains(&entry.entity) {
                    best.push(entry.entity.clone());
                }
            }
        }

        (!best.is_empty()).then_some((best, best_score))
    }
}

/// Similarity in [0, 1] between two phrases.
pub fn similarity(a: &str, b: &str) -> f64 {
    normalized_levenshtein(&normalize_phrase(a), &normalize_phrase(b))
}

/// Lower-case, replace punctuation with spaces and collapse whitespace.
pub fn normalize_phrase(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Pick one entity out of the candidates for `term`. A table beats columns;
/// anything else with more than one candidate is ambiguous.
pub fn choose_entity(term: &str, candidates: Vec<Entity>) -> Result<Entity> {
    let ambiguous = |list: &[Entity]| {
        let mut names: Vec<String> = list.iter().map(Entity::describe).collect();
        names.sort();
        names.dedup();
        EngineError::AmbiguousReference {
            term: term.to_string(),
            candidates: names,
        }
    };

    let tables: Vec<Entity> = candidates
        .iter()
        .filter(|e| matches!(e, Entity::Table(_)))
        .cloned()
        .collect();
    match tables.len() {
        1 => return Ok(tables[0].clone()),
        n if n > 1 => return Err(ambiguous(&tables)),
        _ => {}
    }

    match candidates.len() {
        0 => Err(EngineError::UnresolvedReference(term.to_string())),
        1 => Ok(candidates[0].clone()),
        _ => Err(ambiguous(&candidates)),
    }
}

fn build_cues(vocabulary: &Vocabulary) -> HashMap<String, Cue> {
    let mut cues = HashMap::new();
    let mut add = |phrase: &str, cue: Cue| {
        let phrase = normalize_phrase(phrase);
        if !phrase.is_empty() {
            cues.insert(phrase, cue);
        }
    };

    for (phrase, op) in &vocabulary.comparison_cues {
        add(phrase, Cue::Compare(*op));
    }
    for (phrase, kind) in &vocabulary.aggregation_cues {
        add(phrase, Cue::Aggregate(*kind));
    }
    for phrase in &vocabulary.group_cues {
        add(phrase, Cue::Group);
    }
    for phrase in &vocabulary.order_cues {
        add(phrase, Cue::Order);
    }
    for (phrase, order) in &vocabulary.limit_cues {
        add(phrase, Cue::Limit(*order));
    }
    for phrase in &vocabulary.ascending_words {
        add(phrase, Cue::Direction(Direction::Asc));
    }
    for phrase in &vocabulary.descending_words {
        add(phrase, Cue::Direction(Direction::Desc));
    }
    for phrase in &vocabulary.write_cues {
        add(phrase, Cue::Write);
    }
    add("by", Cue::By);
    cues
}

fn synonym_entities(catalog: &SchemaCatalog, target: &SynonymTarget) -> Vec<Entity> {
    match target {
        SynonymTarget::Table { candidates } => candidates
            .iter()
            .find_map(|name| catalog.table(name))
            .map(|t| vec![Entity::Table(t.name.clone())])
            .unwrap_or_default(),
        SynonymTarget::Column { candidates } => columns_named(catalog, candidates)
            .into_iter()
            .map(Entity::Column)
            .collect(),
        SynonymTarget::Filter {
            columns,
            operator,
            value,
        } => columns_named(catalog, columns)
            .into_iter()
            .map(|column| Entity::Filter {
                column,
                operator: *operator,
                value: value.clone(),
            })
            .collect(),
    }
}

/// Columns carrying the first candidate name that exists anywhere in the
/// catalog.
fn columns_named(catalog: &SchemaCatalog, candidates: &[String]) -> Vec<ColumnRef> {
    for name in candidates {
        let found: Vec<ColumnRef> = catalog
            .tables()
            .filter_map(|t| {
                t.column(name)
                    .map(|c| ColumnRef::new(t.name.clone(), c.name.clone()))
            })
            .collect();
        if !found.is_empty() {
            return found;
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::builder::tests::{employee_schema, with_samples};
    use crate::catalog::CatalogBuilder;

    fn lexicon() -> Lexicon {
        let mut catalog = CatalogBuilder::from_raw(employee_schema(), 1);
        with_samples(&mut catalog, "departments", "dept_name", &["Engineering", "Sales"]);
        Lexicon::build(&catalog, &Vocabulary::default())
    }

    #[test]
    fn test_lookup_precedence() {
        let lex = lexicon();
        assert_eq!(
            lex.lookup("employee"),
            Some(PhraseMatch::Entities(vec![Entity::Table("employees".into())]))
        );
        assert_eq!(
            lex.lookup("salary"),
            Some(PhraseMatch::Entities(vec![Entity::Column(ColumnRef::new(
                "employees",
                "annual_salary"
            ))]))
        );
        assert_eq!(lex.lookup("over"), Some(PhraseMatch::Cue(Cue::Compare(Operator::Gt))));
        assert_eq!(
            lex.lookup("engineering"),
            Some(PhraseMatch::Value(vec![(
                ColumnRef::new("departments", "dept_name"),
                "Engineering".to_string()
            )]))
        );
        assert_eq!(lex.lookup("weather"), None);
    }

    #[test]
    fn test_fuzzy_threshold() {
        let lex = lexicon();
        let (entities, score) = lex.fuzzy("employes").unwrap();
        assert_eq!(entities, vec![Entity::Table("employees".into())]);
        assert!(score >= 0.8);
        assert!(lex.fuzzy("weather").is_none());
        assert!(lex.fuzzy("dep").is_none());
    }

    #[test]
    fn test_choose_entity() {
        let a = Entity::Column(ColumnRef::new("employees", "location"));
        let b = Entity::Column(ColumnRef::new("departments", "location"));
        let err = choose_entity("location", vec![a.clone(), b]).unwrap_err();
        match err {
            EngineError::AmbiguousReference { candidates, .. } => {
                assert_eq!(candidates, vec!["departments.location", "employees.location"]);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let table = Entity::Table("employees".into());
        assert_eq!(choose_entity("employee", vec![a, table.clone()]).unwrap(), table);
    }

    #[test]
    fn test_normalize_phrase() {
        assert_eq!(normalize_phrase("  Hire-Date "), "hire date");
        assert_eq!(normalize_phrase("R&D"), "r d");
    }
}
