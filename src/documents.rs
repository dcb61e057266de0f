//! Document Relevance Matcher
//!
//! Ranks pre-extracted documents against the keywords of a question using an
//! inverted index. Scoring is plain term overlap weighted by inverse
//! document frequency:
//!
//! ```text
//! idf(t)   = ln(1 + N / df(t))
//! score(d) = Σ idf(t) for query terms in d  /  Σ idf(t) for all query terms
//! ```
//!
//! so a document containing every query term scores 1.0. Results are
//! ordered by score descending, then document id.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Characters of context on each side of the first matched keyword.
const EXCERPT_RADIUS: usize = 80;

/// Text handed over by the document-processing collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedDocument {
    pub document_id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMatch {
    pub document_id: String,
    /// Relevance in [0, 1].
    pub score: f64,
    pub excerpt: String,
}

/// Immutable inverted index. Updates produce a new index.
#[derive(Debug, Clone, Default)]
pub struct DocumentIndex {
    /// term -> ids of documents containing it
    postings: HashMap<String, BTreeSet<String>>,
    documents: BTreeMap<String, ExtractedDocument>,
}

impl DocumentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_documents(documents: impl IntoIterator<Item = ExtractedDocument>) -> Self {
        let mut index = Self::new();
        for document in documents {
            index.insert(document);
        }
        index
    }

    /// Copy of this index with `documents` added; a document whose id is
    /// already indexed replaces the old version.
    pub fn with_documents(&self, documents: impl IntoIterator<Item = ExtractedDocument>) -> Self {
        let mut index = self.clone();
        for document in documents {
            index.insert(document);
        }
        index
    }

    /// Copy of this index without `document_id`.
    pub fn without_document(&self, document_id: &str) -> Self {
        let mut index = self.clone();
        index.remove(document_id);
        index
    }

    fn insert(&mut self, document: ExtractedDocument) {
        self.remove(&document.document_id);
        for term in terms(&document.text).into_iter().unique() {
            self.postings
                .entry(term)
                .or_default()
                .insert(document.document_id.clone());
        }
        self.documents.insert(document.document_id.clone(), document);
    }

    fn remove(&mut self, document_id: &str) {
        if self.documents.remove(document_id).is_none() {
            return;
        }
        self.postings.retain(|_, ids| {
            ids.remove(document_id);
            !ids.is_empty()
        });
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn contains(&self, document_id: &str) -> bool {
        self.documents.contains_key(document_id)
    }

    /// Inverse document frequency. A term found nowhere gets the weight of
    /// a term found in a single document.
    pub fn idf(&self, term: &str) -> f64 {
        let n = self.documents.len() as f64;
        let df = self.postings.get(term).map_or(0, |ids| ids.len()).max(1) as f64;
        (1.0 + n / df).ln()
    }

    /// Up to `top_k` matching documents, best first. Documents sharing no
    /// term with the keywords are not returned.
    pub fn match_documents(
        &self,
        keywords: &[String],
        top_k: usize,
    ) -> impl Iterator<Item = DocumentMatch> {
        let query: Vec<String> = keywords
            .iter()
            .flat_map(|k| terms(k))
            .unique()
            .collect();
        let total: f64 = query.iter().map(|t| self.idf(t)).sum();

        let mut matched: HashMap<&str, Vec<&str>> = HashMap::new();
        if total > 0.0 {
            for term in &query {
                if let Some(ids) = self.postings.get(term) {
                    for id in ids {
                        matched.entry(id.as_str()).or_default().push(term.as_str());
                    }
                }
            }
        }

        matched
            .into_iter()
            .filter_map(|(id, hits)| {
                let document = self.documents.get(id)?;
                let score = hits.iter().map(|t| self.idf(t)).sum::<f64>() / total;
                let hits: HashSet<&str> = hits.into_iter().collect();
                Some(DocumentMatch {
                    document_id: id.to_string(),
                    score: score.clamp(0.0, 1.0),
                    excerpt: excerpt(&document.text, &hits),
                })
            })
            .sorted_by(|a, b| {
                b.score
                    .total_cmp(&a.score)
                    .then_with(|| a.document_id.cmp(&b.document_id))
            })
            .take(top_k)
            .collect::<Vec<_>>()
            .into_iter()
    }
}

/// Lower-cased alphanumeric words of at least two characters.
fn terms(text: &str) -> Vec<String> {
    words(text).map(|(_, w)| w).filter(|w| w.chars().count() >= 2).collect()
}

/// Words with their byte offsets.
fn words(text: &str) -> impl Iterator<Item = (usize, String)> + '_ {
    let mut out = Vec::new();
    let mut start: Option<usize> = None;
    for (i, c) in text.char_indices() {
        match (c.is_alphanumeric(), start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                out.push((s, text[s..i].to_lowercase()));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        out.push((s, text[s..].to_lowercase()));
    }
    out.into_iter()
}

fn excerpt(text: &str, hits: &HashSet<&str>) -> String {
    let anchor = words(text)
        .find(|(_, w)| hits.contains(w.as_str()))
        .map_or(0, |(offset, _)| offset);
    let before = text[..anchor].chars().count();
    let from = before.saturating_sub(EXCERPT_RADIUS);
    let total = text.chars().count();
    let take = EXCERPT_RADIUS * 2;

    let body: String = text
        .chars()
        .skip(from)
        .take(take)
        .collect::<String>()
        .split_whitespace()
        .join(" ");
    let mut excerpt = String::new();
    if from > 0 {
        excerpt.push_str("...");
    }
    excerpt.push_str(&body);
    if from + take < total {
        excerpt.push_str("...");
    }
    excerpt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, text: &str) -> ExtractedDocument {
        ExtractedDocument {
            document_id: id.to_string(),
            text: text.to_string(),
            metadata: BTreeMap::new(),
        }
    }

    fn keywords(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    fn index() -> DocumentIndex {
        DocumentIndex::from_documents(vec![
            doc("handbook", "Remote work policy: employees may work remotely two days a week."),
            doc("benefits", "Health insurance and pension benefits for all employees."),
            doc("security", "Laptop security policy for remote access."),
        ])
    }

    #[test]
    fn test_ranking_and_scores() {
        let results: Vec<DocumentMatch> = index()
            .match_documents(&keywords(&["remote", "policy", "week"]), 10)
            .collect();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].document_id, "handbook");
        assert!((results[0].score - 1.0).abs() < 1e-9);
        assert_eq!(results[1].document_id, "security");
        assert!(results[1].score > 0.0 && results[1].score < 1.0);
    }

    #[test]
    fn test_ties_break_on_document_id() {
        let results: Vec<DocumentMatch> = index()
            .match_documents(&keywords(&["employees"]), 10)
            .collect();
        let ids: Vec<&str> = results.iter().map(|r| r.document_id.as_str()).collect();
        assert_eq!(ids, vec!["benefits", "handbook"]);
        assert_eq!(results[0].score, results[1].score);
    }

    #[test]
    fn test_top_k_and_no_match() {
        let index = index();
        assert_eq!(index.match_documents(&keywords(&["policy"]), 1).count(), 1);
        assert_eq!(index.match_documents(&keywords(&["salary"]), 5).count(), 0);
        assert_eq!(index.match_documents(&[], 5).count(), 0);
    }

    #[test]
    fn test_replace_and_remove() {
        let index = index();
        let updated = index.with_documents(vec![doc("benefits", "Dental plan details.")]);
        assert_eq!(updated.len(), 3);
        assert_eq!(updated.match_documents(&keywords(&["insurance"]), 5).count(), 0);
        // The original index is untouched.
        assert_eq!(index.match_documents(&keywords(&["insurance"]), 5).count(), 1);

        let removed = updated.without_document("handbook");
        assert!(!removed.contains("handbook"));
        assert_eq!(removed.match_documents(&keywords(&["week"]), 5).count(), 0);
    }

    #[test]
    fn test_excerpt_window() {
        let long = format!("{} needle {}", "a ".repeat(100), "b ".repeat(100));
        let index = DocumentIndex::from_documents(vec![doc("long", &long)]);
        let result = index.match_documents(&keywords(&["needle"]), 1).next().unwrap();
        assert!(result.excerpt.starts_with("..."));
        assert!(result.excerpt.ends_with("..."));
        assert!(result.excerpt.contains("needle"));
    }
}
