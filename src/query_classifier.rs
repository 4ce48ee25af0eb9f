//! Query Classifier - routes a free-text question to an intent
//!
//! Rules are tried in a fixed priority order (see [`RULE_PRIORITY`]):
//! visualization, then aggregate, then filter. The first rule that fires wins;
//! a question no rule recognises becomes `FreeForm` and is left to the model.

use crate::column_resolver::{normalize_header, ColumnRoleMap, Role, SynonymTable};
use crate::dataset::DatasetProfile;
use crate::intent::{AggregateOp, AggregateRequest, ChartKind, QueryIntent, VisualizeRequest};
use crate::operators::{Comparison, Predicate};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use strsim::jaro_winkler;
use tracing::debug;

/// Minimum Jaro-Winkler score for a question word to stand in for a header.
const FUZZY_THRESHOLD: f64 = 0.92;

/// Role synonyms that double as query keywords and never count as column mentions.
const KEYWORD_SYNONYMS: [&str; 3] = ["count", "group", "num"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentRule {
    Visualize,
    Aggregate,
    Filter,
}

/// Tie-break order between overlapping keyword families.
pub const RULE_PRIORITY: [IntentRule; 3] = [IntentRule::Visualize, IntentRule::Aggregate, IntentRule::Filter];

lazy_static! {
    static ref CHART_KEYWORDS: Vec<(ChartKind, Regex)> = vec![
        (ChartKind::Pie, word_regex(&["pie"])),
        (ChartKind::Scatter, word_regex(&["scatter", "scatterplot", "scatter plot"])),
        (ChartKind::Line, word_regex(&["line", "lines", "trend"])),
        (ChartKind::Histogram, word_regex(&["histogram", "histograms"])),
        (ChartKind::Bar, word_regex(&["bar", "bars"])),
        (ChartKind::Count, word_regex(&["count", "counts"])),
    ];
    static ref GENERIC_CHART: Regex =
        word_regex(&["chart", "plot", "graph", "visualize", "visualise", "visualization", "visualisation"]);
    static ref AGGREGATE_KEYWORDS: Vec<(AggregateOp, Regex)> = vec![
        (AggregateOp::Correlation, word_regex(&["correlation", "correlate", "correlated", "corr"])),
        (AggregateOp::Average, word_regex(&["average", "avg", "mean"])),
        (AggregateOp::Sum, word_regex(&["sum", "total"])),
        (AggregateOp::Max, word_regex(&["max", "maximum", "highest", "largest", "biggest", "most expensive"])),
        (AggregateOp::Min, word_regex(&["min", "minimum", "lowest", "smallest", "cheapest"])),
    ];
    static ref COUNT_QUESTION: Regex = word_regex(&["how many", "number of"]);
    static ref COMPARISON: Regex = Regex::new(
        r"(?P<op>\b(?:no less than|no more than|more than|greater than|higher than|larger than|bigger than|at least|less than|fewer than|lower than|smaller than|at most|equal to|equals|equal|exactly|above|over|below|under)\b|>=|<=|>|<|=)\s*\$?(?P<num>-?\d[\d,]*(?:\.\d+)?)"
    )
    .expect("comparison pattern is valid");
    /// Text between a number and a later column that ends the number's clause.
    static ref CLAUSE_BREAK: Regex = Regex::new(r"\d|,|;|\band\b|\bor\b|\bwith\b|\bbut\b|[<>=]").expect("clause pattern is valid");
    static ref WORD: Regex = Regex::new(r"[a-z][a-z0-9_]*").expect("word pattern is valid");
    static ref GROUP_PREFIX: Regex =
        Regex::new(r"(?:\bby|\bper|\bfor each|\bacross|\beach)\s+(?:the\s+)?$").expect("group pattern is valid");
}

fn word_regex(words: &[&str]) -> Regex {
    let alternation = words.iter().map(|w| regex::escape(w)).collect::<Vec<_>>().join("|");
    Regex::new(&format!(r"\b(?:{})\b", alternation)).expect("keyword pattern is valid")
}

fn comparison_from(op: &str) -> Comparison {
    match op {
        "more than" | "greater than" | "higher than" | "larger than" | "bigger than" | "above" | "over" | ">" => {
            Comparison::Gt
        }
        "less than" | "fewer than" | "lower than" | "smaller than" | "below" | "under" | "<" => Comparison::Lt,
        "at least" | "no less than" | ">=" => Comparison::Ge,
        "at most" | "no more than" | "<=" => Comparison::Le,
        _ => Comparison::Eq,
    }
}

/// A column referenced in the question and where it first appears.
#[derive(Debug, Clone, PartialEq)]
pub struct Mention {
    pub column: String,
    pub start: usize,
    pub end: usize,
}

/// Parsed view of one question, shared by every rule.
struct Question<'a> {
    lower: String,
    mentions: Vec<Mention>,
    predicates: Vec<Predicate>,
    profile: &'a DatasetProfile,
    roles: &'a ColumnRoleMap,
}

impl Question<'_> {
    fn predicate_columns(&self) -> Vec<&str> {
        self.predicates.iter().map(|p| p.column.as_str()).collect()
    }

    /// Mention introduced by "by", "per", "for each" ...
    fn group_by(&self) -> Option<&Mention> {
        self.mentions
            .iter()
            .find(|m| GROUP_PREFIX.is_match(&self.lower[..m.start]))
    }

    fn aggregate_op(&self) -> Option<AggregateOp> {
        AGGREGATE_KEYWORDS
            .iter()
            .find(|(_, re)| re.is_match(&self.lower))
            .map(|(op, _)| *op)
    }
}

pub struct QueryClassifier {
    synonyms: Arc<SynonymTable>,
}

impl QueryClassifier {
    pub fn new(synonyms: Arc<SynonymTable>) -> Self {
        Self { synonyms }
    }

    pub fn classify(&self, text: &str, roles: &ColumnRoleMap, profile: &DatasetProfile) -> QueryIntent {
        let lower = text.to_lowercase();
        let mentions = self.find_mentions(&lower, roles, profile);
        let predicates = extract_predicates(&lower, &mentions, profile);

        let question = Question {
            lower,
            mentions,
            predicates,
            profile,
            roles,
        };

        for rule in RULE_PRIORITY {
            let intent = match rule {
                IntentRule::Visualize => self.visualize(&question),
                IntentRule::Aggregate => self.aggregate(&question),
                IntentRule::Filter => self.filter(&question),
            };
            if let Some(intent) = intent {
                debug!("Classified {:?} as {}", text, intent.name());
                return intent;
            }
        }

        debug!("Classified {:?} as free_form", text);
        QueryIntent::FreeForm { text: text.to_string() }
    }

    fn visualize(&self, q: &Question<'_>) -> Option<QueryIntent> {
        let kind = CHART_KEYWORDS
            .iter()
            .find(|(_, re)| re.is_match(&q.lower))
            .map(|(kind, _)| *kind)
            .or_else(|| GENERIC_CHART.is_match(&q.lower).then_some(ChartKind::Bar))?;

        let filtered = q.predicate_columns();
        let mut columns: Vec<String> = q
            .mentions
            .iter()
            .filter(|m| !filtered.contains(&m.column.as_str()))
            .map(|m| m.column.clone())
            .collect();

        if columns.is_empty() && kind == ChartKind::Histogram {
            let default = q
                .roles
                .get(Role::Value)
                .filter(|c| q.profile.is_numeric(c))
                .or_else(|| q.profile.numeric_columns().first().copied());
            columns.extend(default.map(str::to_string));
        } else if columns.is_empty() && kind != ChartKind::Scatter {
            let default = q
                .roles
                .get(Role::Category)
                .or_else(|| q.roles.get(Role::Location))
                .or_else(|| q.profile.first_category_like());
            columns.extend(default.map(str::to_string));
        }

        let x = q
            .group_by()
            .map(|m| m.column.clone())
            .filter(|c| !filtered.contains(&c.as_str()));

        Some(QueryIntent::Visualize(VisualizeRequest {
            kind,
            columns,
            x,
            aggregate: q.aggregate_op().filter(|op| *op != AggregateOp::Correlation),
            filters: q.predicates.clone(),
            title: None,
        }))
    }

    fn aggregate(&self, q: &Question<'_>) -> Option<QueryIntent> {
        let group_by = q.group_by().map(|m| m.column.clone());
        let op = match q.aggregate_op() {
            Some(op) => op,
            None if group_by.is_some() && COUNT_QUESTION.is_match(&q.lower) => AggregateOp::Count,
            None => return None,
        };
        if op == AggregateOp::Count {
            return Some(QueryIntent::Aggregate(AggregateRequest {
                op,
                column: None,
                other: None,
                group_by,
                filters: q.predicates.clone(),
            }));
        }

        let filtered = q.predicate_columns();
        let targets: Vec<&str> = q
            .mentions
            .iter()
            .map(|m| m.column.as_str())
            .filter(|c| Some(*c) != group_by.as_deref() && !filtered.contains(c))
            .collect();

        // numeric mentions first, then any mention
        let mut numeric = targets.iter().copied().filter(|c| q.profile.is_numeric(c));
        let column = numeric
            .next()
            .or_else(|| targets.first().copied())
            .or_else(|| q.roles.get(Role::Value))
            .map(str::to_string);
        let other = if op == AggregateOp::Correlation {
            numeric.next().map(str::to_string)
        } else {
            None
        };

        Some(QueryIntent::Aggregate(AggregateRequest {
            op,
            column,
            other,
            group_by,
            filters: q.predicates.clone(),
        }))
    }

    fn filter(&self, q: &Question<'_>) -> Option<QueryIntent> {
        if q.predicates.is_empty() {
            return None;
        }
        Some(QueryIntent::Filter {
            predicates: q.predicates.clone(),
        })
    }

    /// Columns referenced by literal name, by role synonym, or by a close spelling.
    pub fn find_mentions(&self, lower: &str, roles: &ColumnRoleMap, profile: &DatasetProfile) -> Vec<Mention> {
        let mut found: HashMap<String, Mention> = HashMap::new();

        for column in &profile.columns {
            let normalized = normalize_header(&column.name);
            let mut forms = vec![normalized.clone(), normalized.replace('_', " ")];
            forms.dedup();
            for form in forms {
                if let Some(m) = plural_word_regex(&form).and_then(|re| re.find(lower)) {
                    record(&mut found, &column.name, m.start(), m.end());
                }
            }
        }

        for (role, column) in roles.roles() {
            for synonym in self.synonyms.synonyms(role) {
                if KEYWORD_SYNONYMS.contains(&synonym.as_str()) {
                    continue;
                }
                if let Some(m) = plural_word_regex(&synonym.replace('_', " ")).and_then(|re| re.find(lower)) {
                    record(&mut found, column, m.start(), m.end());
                }
            }
        }

        // close spellings ("bedroom" for "bedrooms") of columns not yet seen
        let unseen: Vec<(String, String)> = profile
            .columns
            .iter()
            .map(|c| (c.name.clone(), normalize_header(&c.name)))
            .filter(|(name, _)| !found.contains_key(name))
            .collect();
        for word in WORD.find_iter(lower) {
            if word.as_str().len() < 4 {
                continue;
            }
            let best = unseen
                .iter()
                .map(|(name, normalized)| (name, jaro_winkler(word.as_str(), normalized)))
                .filter(|(_, score)| *score >= FUZZY_THRESHOLD)
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            if let Some((name, _)) = best {
                record(&mut found, name, word.start(), word.end());
            }
        }

        let mut mentions: Vec<Mention> = found.into_values().collect();
        mentions.sort_by_key(|m| m.start);
        mentions
    }
}

fn plural_word_regex(form: &str) -> Option<Regex> {
    Regex::new(&format!(r"\b{}(?:s|es)?\b", regex::escape(form))).ok()
}

/// Keep the earliest position seen for each column.
fn record(found: &mut HashMap<String, Mention>, column: &str, start: usize, end: usize) {
    let entry = found.entry(column.to_string()).or_insert(Mention {
        column: column.to_string(),
        start,
        end,
    });
    if start < entry.start {
        entry.start = start;
        entry.end = end;
    }
}

/// Scan comparison phrases and bind each to the closest numeric column.
///
/// A column right after the number ("more than 3 bedrooms") wins over one
/// before the operator ("price above 200000"), unless another number or a
/// clause word sits between them ("price under 300000 and 3 bedrooms").
fn extract_predicates(lower: &str, mentions: &[Mention], profile: &DatasetProfile) -> Vec<Predicate> {
    let numeric: Vec<&Mention> = mentions
        .iter()
        .filter(|m| profile.is_numeric(&m.column))
        .collect();

    let mut predicates = Vec::new();
    let mut clause_start = 0;
    for caps in COMPARISON.captures_iter(lower) {
        let (Some(op), Some(num)) = (caps.name("op"), caps.name("num")) else {
            continue;
        };
        let Ok(threshold) = num.as_str().replace(',', "").parse::<f64>() else {
            continue;
        };

        let after = numeric
            .iter()
            .find(|m| m.start >= num.end() && m.start <= num.end() + 12)
            .filter(|m| !CLAUSE_BREAK.is_match(&lower[num.end()..m.start]));
        let before = numeric
            .iter()
            .filter(|m| m.end <= op.start() && m.start >= clause_start)
            .last();

        if let Some(mention) = after.or(before) {
            predicates.push(Predicate::new(
                mention.column.clone(),
                comparison_from(op.as_str()),
                threshold,
            ));
        }
        clause_start = num.end();
    }
    predicates
}
