//! Entity Resolver
//!
//! Maps a free-text question onto the catalog. Resolution runs in two passes:
//!
//! 1. **Scan** - tokens are matched against the lexicon (longest phrase
//!    first, then fuzzy single words) and turned into a flat list of items:
//!    tables, columns, sampled values, literals and cue words.
//! 2. **Assemble** - the items are folded into a [`QueryIntent`]: cues
//!    attach comparison operators to columns, aggregations to their
//!    targets, grouping and ordering to the following entity.
//!
//! Ambiguity is never settled by guessing: a phrase that fits more than one
//! column fails with `AmbiguousReference`, a table that cannot be joined to
//! the rest of the question fails with `UnresolvedJoinPath`.

pub mod matcher;
pub mod tokenizer;

pub use matcher::{Cue, Entity, Lexicon, PhraseMatch};
pub use tokenizer::{tokenize, Token, TokenKind};

use crate::catalog::{ColumnRef, SchemaCatalog};
use crate::config::{LimitOrder, Vocabulary};
use crate::error::{EngineError, Result};
use crate::intent::{
    AggregateKind, AggregateTarget, Aggregation, Direction, Literal, Operator, OrderBy,
    Predicate, QueryIntent,
};
use matcher::{choose_entity, normalize_phrase};
use std::sync::Arc;
use tracing::debug;

/// Outcome of resolving a question.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Intent(QueryIntent),
    /// The question names nothing in the database; only documents apply.
    NoEntities,
}

#[derive(Debug, Clone, PartialEq)]
enum Item {
    Table(String),
    Column(ColumnRef),
    /// Filter implied by the phrase itself (sampled value or filter synonym).
    /// `operator` is `None` when a preceding comparison cue may supply one.
    Filter {
        column: ColumnRef,
        operator: Option<Operator>,
        literal: Literal,
    },
    Literal {
        literal: Literal,
        text: String,
    },
    Cue(Cue),
    Write(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
enum Pending {
    #[default]
    Nothing,
    Group,
    Order,
}

/// Resolver bound to one catalog. Rebuilt whenever the catalog is.
pub struct EntityResolver {
    catalog: Arc<SchemaCatalog>,
    lexicon: Lexicon,
}

impl EntityResolver {
    pub fn new(catalog: Arc<SchemaCatalog>, vocabulary: &Vocabulary) -> Self {
        let lexicon = Lexicon::build(&catalog, vocabulary);
        Self { catalog, lexicon }
    }

    pub fn catalog(&self) -> &Arc<SchemaCatalog> {
        &self.catalog
    }

    pub fn resolve(&self, question: &str) -> Result<Resolution> {
        let tokens = tokenize(question);
        let items = self.scan(&tokens)?;
        debug!("Resolved items for '{}': {:?}", question, items);
        let resolution = self.assemble(&items)?;
        if let Resolution::Intent(intent) = &resolution {
            debug!("Intent: {:?}", intent);
        }
        Ok(resolution)
    }

    fn scan(&self, tokens: &[Token]) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        let mut i = 0;

        while i < tokens.len() {
            let token = &tokens[i];
            match &token.kind {
                TokenKind::Number(literal) => {
                    items.push(Item::Literal {
                        literal: literal.clone(),
                        text: token.text.clone(),
                    });
                    i += 1;
                    continue;
                }
                TokenKind::Date(date) => {
                    items.push(Item::Literal {
                        literal: Literal::Date(*date),
                        text: token.text.clone(),
                    });
                    i += 1;
                    continue;
                }
                TokenKind::Symbol(op) => {
                    items.push(Item::Cue(Cue::Compare(*op)));
                    i += 1;
                    continue;
                }
                TokenKind::Quoted(text) => {
                    let phrase = normalize_phrase(text);
                    let item = match self.lexicon.lookup(&phrase) {
                        Some(PhraseMatch::Value(values)) => value_item(text, values)?,
                        _ => Item::Literal {
                            literal: Literal::Text(text.clone()),
                            text: text.clone(),
                        },
                    };
                    items.push(item);
                    i += 1;
                    continue;
                }
                TokenKind::Word(_) => {}
            }

            let run = tokens[i..]
                .iter()
                .take(self.lexicon.max_words())
                .take_while(|t| t.word().is_some())
                .count();

            let mut matched = None;
            for len in (1..=run).rev() {
                let phrase = normalize_phrase(
                    &tokens[i..i + len]
                        .iter()
                        .filter_map(Token::word)
                        .collect::<Vec<_>>()
                        .join(" "),
                );
                if phrase.is_empty() {
                    continue;
                }
                let Some(found) = self.lexicon.lookup(&phrase) else {
                    continue;
                };
                if len == 1
                    && self.lexicon.is_stop_word(&phrase)
                    && !matches!(found, PhraseMatch::Cue(_))
                {
                    break;
                }
                matched = Some((found, len, phrase));
                break;
            }

            match matched {
                Some((PhraseMatch::Cue(Cue::Write), len, phrase)) => {
                    items.push(Item::Write(phrase));
                    i += len;
                }
                Some((PhraseMatch::Cue(cue), len, _)) => {
                    items.push(Item::Cue(cue));
                    i += len;
                }
                Some((PhraseMatch::Entities(entities), len, phrase)) => {
                    items.push(entity_item(choose_entity(&phrase, entities)?));
                    i += len;
                }
                Some((PhraseMatch::Value(values), len, phrase)) => {
                    items.push(value_item(&phrase, values)?);
                    i += len;
                }
                None => {
                    let word = token.word().unwrap_or_default();
                    if self.lexicon.is_stop_word(word) {
                        // nothing to do
                    } else if let Some((entities, score)) = self.lexicon.fuzzy(word) {
                        debug!("Fuzzy match '{}' -> {:?} ({:.2})", word, entities, score);
                        items.push(entity_item(choose_entity(word, entities)?));
                    } else if token.capitalized && i > 0 {
                        return Err(EngineError::UnresolvedReference(token.text.clone()));
                    } else {
                        debug!("Ignoring unmatched word '{}'", word);
                    }
                    i += 1;
                }
            }
        }

        Ok(items)
    }

    fn assemble(&self, items: &[Item]) -> Result<Resolution> {
        let mut draft = Draft::default();

        for (idx, item) in items.iter().enumerate() {
            let awaiting_limit = std::mem::take(&mut draft.awaiting_limit);
            match item {
                Item::Write(word) => {
                    draft.write_request.get_or_insert_with(|| word.clone());
                }
                Item::Cue(Cue::Aggregate(kind)) => {
                    if let Some(outer) = draft.pending_aggregate {
                        return Err(EngineError::UnsupportedIntent(format!(
                            "nested aggregation ({} of {}) is not supported",
                            outer.sql_name(),
                            kind.sql_name()
                        )));
                    }
                    draft.pending_aggregate = Some(*kind);
                }
                Item::Cue(Cue::Write) => {}
                Item::Cue(Cue::Compare(op)) => draft.pending_compare = Some(*op),
                Item::Cue(Cue::Group) => draft.pending = Pending::Group,
                Item::Cue(Cue::Order) => draft.pending = Pending::Order,
                Item::Cue(Cue::By) => {
                    draft.pending =
                        if draft.pending_aggregate.is_some() || !draft.aggregations.is_empty() {
                            Pending::Group
                        } else {
                            Pending::Order
                        };
                }
                Item::Cue(Cue::Limit(order)) => {
                    draft.limit_order = Some(*order);
                    draft.awaiting_limit = true;
                }
                Item::Cue(Cue::Direction(direction)) => {
                    draft.explicit_direction = true;
                    match draft.order_by.last_mut() {
                        Some(last) => last.direction = *direction,
                        None => draft.direction = Some(*direction),
                    }
                }
                Item::Table(table) => self.on_table(&mut draft, table)?,
                Item::Column(column) => self.on_column(&mut draft, column),
                Item::Filter {
                    column,
                    operator,
                    literal,
                } => {
                    let operator = operator
                        .or_else(|| draft.pending_compare.take())
                        .unwrap_or(Operator::Eq);
                    draft.touch(&column.table);
                    draft.predicates.push(Predicate {
                        column: column.clone(),
                        operator,
                        value: literal.clone(),
                    });
                }
                Item::Literal { literal, text } => {
                    if awaiting_limit {
                        match literal {
                            Literal::Integer(n) if *n > 0 => draft.limit = Some(*n as u64),
                            _ => {
                                return Err(EngineError::UnsupportedIntent(format!(
                                    "row limit '{}' must be a positive whole number",
                                    text
                                )))
                            }
                        }
                        continue;
                    }
                    let operator = draft.pending_compare.take();
                    let column = match operator {
                        Some(_) => draft
                            .last_column
                            .clone()
                            .or_else(|| next_column(&items[idx + 1..])),
                        None if idx > 0 && matches!(items[idx - 1], Item::Column(_)) => {
                            draft.last_column.clone()
                        }
                        None => None,
                    };
                    let Some(column) = column else {
                        return Err(EngineError::UnresolvedReference(text.clone()));
                    };
                    draft.touch(&column.table);
                    draft.predicates.push(Predicate {
                        column,
                        operator: operator.unwrap_or(Operator::Eq),
                        value: literal.clone(),
                    });
                }
            }
        }

        self.finish(draft)
    }

    fn on_table(&self, draft: &mut Draft, table: &str) -> Result<()> {
        draft.touch(table);
        match std::mem::take(&mut draft.pending) {
            Pending::Group => {
                let column = self.display_column(table)?;
                if !draft.group_by.contains(&column) {
                    draft.group_by.push(column);
                }
            }
            Pending::Order => {
                let column = self.display_column(table)?;
                let direction = draft.next_direction();
                draft.order_by.push(OrderBy { column, direction });
            }
            Pending::Nothing => match draft.pending_aggregate.take() {
                Some(AggregateKind::Count) => {
                    draft.aggregations.push(Aggregation {
                        kind: AggregateKind::Count,
                        target: AggregateTarget::Rows {
                            table: table.to_string(),
                        },
                    });
                    draft.counted_table.get_or_insert_with(|| table.to_string());
                }
                Some(kind) => {
                    return Err(EngineError::UnsupportedIntent(format!(
                        "cannot compute {} of table {}; name a column",
                        kind.sql_name(),
                        table
                    )))
                }
                None => {
                    if !draft.subjects.iter().any(|t| t == table) {
                        draft.subjects.push(table.to_string());
                    }
                }
            },
        }
        Ok(())
    }

    fn on_column(&self, draft: &mut Draft, column: &ColumnRef) {
        draft.touch(&column.table);
        match std::mem::take(&mut draft.pending) {
            Pending::Group => {
                if !draft.group_by.contains(column) {
                    draft.group_by.push(column.clone());
                }
            }
            Pending::Order => {
                let direction = draft.next_direction();
                draft.order_by.push(OrderBy {
                    column: column.clone(),
                    direction,
                });
            }
            Pending::Nothing => match draft.pending_aggregate.take() {
                Some(kind) => draft.aggregations.push(Aggregation {
                    kind,
                    target: AggregateTarget::Column {
                        column: column.clone(),
                    },
                }),
                None => draft.projection.push(column.clone()),
            },
        }
        draft.last_column = Some(column.clone());
    }

    fn display_column(&self, table: &str) -> Result<ColumnRef> {
        let model = self
            .catalog
            .table(table)
            .ok_or_else(|| EngineError::UnresolvedReference(table.to_string()))?;
        model
            .display_column()
            .map(|c| ColumnRef::new(model.name.clone(), c.name.clone()))
            .ok_or_else(|| {
                EngineError::UnsupportedIntent(format!(
                    "table {} has no column to group or order by",
                    table
                ))
            })
    }

    fn finish(&self, mut draft: Draft) -> Result<Resolution> {
        if draft.touched.is_empty() {
            if let Some(word) = draft.write_request {
                return Err(EngineError::UnsupportedIntent(format!(
                    "'{}' asks to change data; only read-only questions are supported",
                    word
                )));
            }
            return Ok(Resolution::NoEntities);
        }

        let aggregated_tables: Vec<String> = draft
            .aggregations
            .iter()
            .map(|a| match &a.target {
                AggregateTarget::Rows { table } => table.clone(),
                AggregateTarget::Column { column } => column.table.clone(),
            })
            .collect();

        let base = draft
            .counted_table
            .clone()
            .or_else(|| aggregated_tables.first().cloned())
            .or_else(|| draft.subjects.first().cloned())
            .or_else(|| draft.touched.first().cloned())
            .ok_or_else(|| EngineError::UnresolvedReference(String::new()))?;

        match draft.pending_aggregate.take() {
            Some(AggregateKind::Count) => draft.aggregations.push(Aggregation {
                kind: AggregateKind::Count,
                target: AggregateTarget::Rows {
                    table: base.clone(),
                },
            }),
            Some(kind) => {
                return Err(EngineError::UnsupportedIntent(format!(
                    "{} needs a column to aggregate",
                    kind.sql_name()
                )))
            }
            None => {}
        }

        let filtered: Vec<ColumnRef> = draft.predicates.iter().map(|p| p.column.clone()).collect();
        draft.projection.retain(|c| !filtered.contains(c));

        if draft.aggregations.is_empty() {
            // Grouping without an aggregate lists rows in group order.
            for column in std::mem::take(&mut draft.group_by) {
                if !draft.order_by.iter().any(|o| o.column == column) {
                    draft.order_by.push(OrderBy {
                        column,
                        direction: Direction::Asc,
                    });
                }
            }
            self.apply_limit_order(&mut draft);
        } else {
            for column in std::mem::take(&mut draft.projection) {
                if !draft.group_by.contains(&column) {
                    draft.group_by.push(column);
                }
            }
            if draft.group_by.is_empty() {
                // "average salary in each of the departments" style: a table
                // named on its own next to an aggregate is the grouping.
                for table in &draft.subjects {
                    if !aggregated_tables.iter().any(|t| t == table) {
                        draft.group_by.push(self.display_column(table)?);
                    }
                }
            }
            let group_by = draft.group_by.clone();
            draft.order_by.retain(|o| group_by.contains(&o.column));
        }

        let mut intent = QueryIntent::new(base.clone());
        intent.tables = draft.touched.clone();
        intent.projection = draft.projection;
        intent.predicates = draft.predicates;
        intent.aggregations = draft.aggregations;
        intent.group_by = draft.group_by;
        intent.order_by = draft.order_by;
        intent.limit = draft.limit;
        intent.write_request = draft.write_request;
        intent.normalize();

        for table in &intent.tables {
            if self.catalog.join_path(&base, table).is_none() {
                return Err(EngineError::UnresolvedJoinPath {
                    from: base.clone(),
                    to: table.clone(),
                });
            }
        }

        Ok(Resolution::Intent(intent))
    }

    /// "top 5 ..." without an explicit ordering sorts on the last ordered
    /// column mentioned.
    fn apply_limit_order(&self, draft: &mut Draft) {
        let direction = match draft.limit_order {
            Some(LimitOrder::Highest) => Direction::Desc,
            Some(LimitOrder::Lowest) => Direction::Asc,
            _ => return,
        };
        if let Some(first) = draft.order_by.first_mut() {
            if !draft.explicit_direction {
                first.direction = direction;
            }
            return;
        }
        let Some(column) = draft.last_column.clone() else {
            return;
        };
        let ordered = self
            .catalog
            .column(&column)
            .map_or(false, |c| c.canonical_type.is_ordered());
        if ordered {
            draft.order_by.push(OrderBy { column, direction });
        }
    }
}

#[derive(Debug, Default)]
struct Draft {
    /// Every table the question touches, in first-mention order.
    touched: Vec<String>,
    /// Tables named on their own, not as a grouping or counting target.
    subjects: Vec<String>,
    counted_table: Option<String>,
    projection: Vec<ColumnRef>,
    predicates: Vec<Predicate>,
    aggregations: Vec<Aggregation>,
    group_by: Vec<ColumnRef>,
    order_by: Vec<OrderBy>,
    limit: Option<u64>,
    write_request: Option<String>,
    last_column: Option<ColumnRef>,
    pending: Pending,
    pending_aggregate: Option<AggregateKind>,
    pending_compare: Option<Operator>,
    limit_order: Option<LimitOrder>,
    awaiting_limit: bool,
    direction: Option<Direction>,
    explicit_direction: bool,
}

impl Draft {
    fn touch(&mut self, table: &str) {
        if !self.touched.iter().any(|t| t == table) {
            self.touched.push(table.to_string());
        }
    }

    fn next_direction(&mut self) -> Direction {
        if let Some(direction) = self.direction.take() {
            return direction;
        }
        match self.limit_order {
            Some(LimitOrder::Highest) => Direction::Desc,
            _ => Direction::Asc,
        }
    }
}

fn entity_item(entity: Entity) -> Item {
    match entity {
        Entity::Table(table) => Item::Table(table),
        Entity::Column(column) => Item::Column(column),
        Entity::Filter {
            column,
            operator,
            value,
        } => Item::Filter {
            column,
            operator: Some(operator),
            literal: Literal::Text(value),
        },
    }
}

fn value_item(term: &str, mut values: Vec<(ColumnRef, String)>) -> Result<Item> {
    if values.len() > 1 {
        let mut candidates: Vec<String> = values.iter().map(|(c, _)| c.to_string()).collect();
        candidates.sort();
        return Err(EngineError::AmbiguousReference {
            term: term.to_string(),
            candidates,
        });
    }
    let (column, value) = values
        .pop()
        .ok_or_else(|| EngineError::UnresolvedReference(term.to_string()))?;
    Ok(Item::Filter {
        column,
        operator: None,
        literal: Literal::Text(value),
    })
}

fn next_column(items: &[Item]) -> Option<ColumnRef> {
    items.iter().find_map(|item| match item {
        Item::Column(c) => Some(c.clone()),
        _ => None,
    })
}

/// Content words of a question, used to search documents.
pub fn keywords(question: &str, vocabulary: &Vocabulary) -> Vec<String> {
    let mut seen = Vec::new();
    for token in tokenize(question) {
        let text = match &token.kind {
            TokenKind::Word(w) => w.clone(),
            TokenKind::Quoted(q) => q.to_lowercase(),
            _ => continue,
        };
        for word in normalize_phrase(&text).split_whitespace() {
            if word.len() < 2 || vocabulary.stop_words.iter().any(|s| s == word) {
                continue;
            }
            if !seen.iter().any(|s: &String| s == word) {
                seen.push(word.to_string());
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::builder::tests::{col, employee_schema, table, with_samples};
    use crate::catalog::CatalogBuilder;

    fn resolver() -> EntityResolver {
        let mut catalog = CatalogBuilder::from_raw(employee_schema(), 1);
        with_samples(&mut catalog, "departments", "dept_name", &["Engineering", "Sales", "Research & Development"]);
        EntityResolver::new(Arc::new(catalog), &Vocabulary::default())
    }

    fn intent(question: &str) -> QueryIntent {
        match resolver().resolve(question).unwrap() {
            Resolution::Intent(intent) => intent,
            Resolution::NoEntities => panic!("no entities in '{}'", question),
        }
    }

    #[test]
    fn test_filters_from_values_and_cues() {
        let intent = intent("Show employees in Engineering earning over 100000");
        assert_eq!(intent.base_table, "employees");
        assert_eq!(intent.tables, vec!["departments", "employees"]);
        assert!(intent.projection.is_empty());
        assert_eq!(
            intent.predicates,
            vec![
                Predicate {
                    column: ColumnRef::new("departments", "dept_name"),
                    operator: Operator::Eq,
                    value: Literal::Text("Engineering".into()),
                },
                Predicate {
                    column: ColumnRef::new("employees", "annual_salary"),
                    operator: Operator::Gt,
                    value: Literal::Integer(100000),
                },
            ]
        );
    }

    #[test]
    fn test_paraphrases_share_signature() {
        let a = intent("show employees earning over 100k");
        let b = intent("employees with salary > 100000");
        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn test_grouped_count() {
        let intent = intent("How many employees per department");
        assert_eq!(intent.base_table, "employees");
        assert_eq!(
            intent.aggregations,
            vec![Aggregation {
                kind: AggregateKind::Count,
                target: AggregateTarget::Rows {
                    table: "employees".into()
                },
            }]
        );
        assert_eq!(intent.group_by, vec![ColumnRef::new("departments", "dept_name")]);
    }

    #[test]
    fn test_top_n_orders_descending() {
        let intent = intent("top 5 employees by salary");
        assert_eq!(intent.limit, Some(5));
        assert_eq!(
            intent.order_by,
            vec![OrderBy {
                column: ColumnRef::new("employees", "annual_salary"),
                direction: Direction::Desc,
            }]
        );
    }

    #[test]
    fn test_multi_word_value_and_filter_synonym() {
        let intent = intent("python developers in Research & Development");
        assert!(intent.predicates.contains(&Predicate {
            column: ColumnRef::new("employees", "position"),
            operator: Operator::Contains,
            value: Literal::Text("python".into()),
        }));
        assert!(intent.predicates.contains(&Predicate {
            column: ColumnRef::new("departments", "dept_name"),
            operator: Operator::Eq,
            value: Literal::Text("Research & Development".into()),
        }));
    }

    #[test]
    fn test_fuzzy_table_name() {
        let intent = intent("list all employes hired after 2020-01-01");
        assert_eq!(intent.base_table, "employees");
        assert_eq!(intent.predicates[0].column, ColumnRef::new("employees", "hire_date"));
        assert!(matches!(intent.predicates[0].value, Literal::Date(_)));
    }

    #[test]
    fn test_ambiguous_column() {
        let mut raw = employee_schema();
        raw.tables[0].columns.push(col("location", "TEXT"));
        raw.tables[1].columns.push(col("location", "TEXT"));
        let catalog = CatalogBuilder::from_raw(raw, 1);
        let resolver = EntityResolver::new(Arc::new(catalog), &Vocabulary::default());
        let err = resolver.resolve("employees by location").unwrap_err();
        assert!(matches!(err, EngineError::AmbiguousReference { .. }));
    }

    #[test]
    fn test_unreachable_table() {
        let mut raw = employee_schema();
        raw.tables.push(table(
            "office_supplies",
            "item_id",
            vec![col("item_id", "INTEGER"), col("item_name", "TEXT")],
            vec![],
        ));
        let catalog = CatalogBuilder::from_raw(raw, 1);
        let resolver = EntityResolver::new(Arc::new(catalog), &Vocabulary::default());
        let err = resolver.resolve("employees and office supplies").unwrap_err();
        assert!(matches!(err, EngineError::UnresolvedJoinPath { .. }));
    }

    #[test]
    fn test_unknown_capitalized_word() {
        let err = resolver().resolve("employees in Marketing").unwrap_err();
        assert_eq!(err, EngineError::UnresolvedReference("Marketing".into()));
    }

    #[test]
    fn test_nested_aggregation_rejected() {
        let err = resolver().resolve("average total salary").unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedIntent(_)));
    }

    #[test]
    fn test_write_request_flagged() {
        let intent = intent("delete employees in Sales");
        assert_eq!(intent.write_request.as_deref(), Some("delete"));
    }

    #[test]
    fn test_no_entities() {
        assert_eq!(
            resolver().resolve("what is our remote work policy").unwrap(),
            Resolution::NoEntities
        );
    }

    #[test]
    fn test_keywords() {
        let words = keywords("What is the remote work policy?", &Vocabulary::default());
        assert_eq!(words, vec!["remote", "policy"]);
    }
}
