//! Filter trees and their compilation into sample-set fragments.
//!
//! A filter is a recursive boolean tree: leaves are predicates over a single
//! term (a categorical value-set, possibly negated, or a list of numeric
//! ranges), interior nodes combine children with AND/OR. The compiler turns
//! the tree into a chain of named fragments whose last member selects the
//! included samples; AND intersects children, OR unions them. An empty filter
//! is an explicit absence (`None`), not an empty-matches-nothing fragment.

use serde::{Deserialize, Serialize};

use crate::bins;
use crate::error::{PhenoqueryError, Result};
use crate::fragment::{Fragment, ParamSink};
use crate::term::{Term, TermKind, TermRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoolOp {
    And,
    Or,
}

/// One numeric range, independently open/closed at each end and possibly
/// unbounded on one side. When `is_not` is set the clause becomes an OR of
/// "below start" and "above stop" sub-clauses, each flipping its own
/// inclusivity flag; multiple ranges in one leaf are negated independently
/// and then unioned, never jointly De-Morganed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeClause {
    #[serde(default)]
    pub start: Option<f64>,
    #[serde(default)]
    pub stop: Option<f64>,
    #[serde(default)]
    pub start_inclusive: bool,
    #[serde(default)]
    pub stop_inclusive: bool,
    #[serde(default)]
    pub is_not: bool,
}

impl RangeClause {
    fn sql(&self, sink: &mut ParamSink) -> String {
        if !self.is_not {
            let mut parts = Vec::new();
            if let Some(start) = self.start {
                let op = if self.start_inclusive { ">=" } else { ">" };
                parts.push(format!("value {} {}", op, sink.push(start)));
            }
            if let Some(stop) = self.stop {
                let op = if self.stop_inclusive { "<=" } else { "<" };
                parts.push(format!("value {} {}", op, sink.push(stop)));
            }
            if parts.is_empty() {
                // unbounded on both sides matches every annotated sample
                return "1 = 1".to_string();
            }
            return format!("({})", parts.join(" and "));
        }
        // negated: below the start or above the stop, per this clause's own flags
        let mut parts = Vec::new();
        if let Some(start) = self.start {
            let op = if self.start_inclusive { "<" } else { "<=" };
            parts.push(format!("value {} {}", op, sink.push(start)));
        }
        if let Some(stop) = self.stop {
            let op = if self.stop_inclusive { ">" } else { ">=" };
            parts.push(format!("value {} {}", op, sink.push(stop)));
        }
        if parts.is_empty() {
            // negation of "everything" matches nothing
            return "1 = 0".to_string();
        }
        format!("({})", parts.join(" or "))
    }
}

/// Leaf predicate over exactly one term. Exactly one of `values`, `ranges`
/// or `groupset` must be present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterLeaf {
    pub term: String,
    #[serde(default)]
    pub is_not: bool,
    #[serde(default)]
    pub values: Option<Vec<String>>,
    #[serde(default)]
    pub ranges: Option<Vec<RangeClause>>,
    /// Named group-set resolved against the request's active cohort.
    #[serde(default)]
    pub groupset: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Filter {
    Branch { op: BoolOp, children: Vec<Filter> },
    Leaf(FilterLeaf),
}

impl Filter {
    pub fn leaf_count(&self) -> usize {
        match self {
            Filter::Leaf(_) => 1,
            Filter::Branch { children, .. } => children.iter().map(Filter::leaf_count).sum(),
        }
    }
}

/// Fingerprint of a filter tree, used to key per-filter bin caches. The
/// explicit absence of a filter fingerprints to zero.
pub fn filter_fingerprint(filter: Option<&Filter>) -> Result<u64> {
    match filter {
        None => Ok(0),
        Some(f) => {
            let canonical = serde_json::to_string(f)
                .map_err(|e| PhenoqueryError::Invariant(format!("filter serialization: {}", e)))?;
            Ok(bins::fingerprint(canonical.as_bytes()))
        }
    }
}

/// The compiled form of a filter: the fragment chain plus the name of the
/// final fragment selecting the included samples.
#[derive(Debug)]
pub struct CompiledFilter {
    pub ctes: Vec<Fragment>,
    pub sample_cte: String,
}

/// Compile a filter tree. `Ok(None)` represents "no restriction".
pub fn compile(
    filter: Option<&Filter>,
    active_cohort: Option<&str>,
    registry: &TermRegistry,
) -> Result<Option<CompiledFilter>> {
    let Some(filter) = filter else {
        return Ok(None);
    };
    if filter.leaf_count() == 0 {
        return Ok(None);
    }
    let mut compiler = Compiler {
        registry,
        active_cohort,
        ctes: Vec::new(),
        next: 0,
    };
    let sample_cte = compiler.node(filter)?;
    Ok(Some(CompiledFilter {
        ctes: compiler.ctes,
        sample_cte,
    }))
}

struct Compiler<'a> {
    registry: &'a TermRegistry,
    active_cohort: Option<&'a str>,
    ctes: Vec<Fragment>,
    next: usize,
}

impl<'a> Compiler<'a> {
    fn fresh_name(&mut self) -> String {
        let name = format!("flt{}", self.next);
        self.next += 1;
        name
    }

    // Returns the name of the fragment selecting this node's samples.
    fn node(&mut self, filter: &Filter) -> Result<String> {
        match filter {
            Filter::Leaf(leaf) => self.leaf(leaf),
            Filter::Branch { op, children } => {
                if children.is_empty() {
                    return Err(PhenoqueryError::CallerInput(
                        "filter branch with no children".into(),
                    ));
                }
                let child_names = children
                    .iter()
                    .map(|c| self.node(c))
                    .collect::<Result<Vec<_>>>()?;
                let combinator = match op {
                    BoolOp::And => "intersect",
                    BoolOp::Or => "union",
                };
                let sql = child_names
                    .iter()
                    .map(|n| format!("select sample from {}", n))
                    .collect::<Vec<_>>()
                    .join(&format!("\n{}\n", combinator));
                let name = self.fresh_name();
                self.ctes.push(Fragment::new(&name, sql, Vec::new()));
                Ok(name)
            }
        }
    }

    fn leaf(&mut self, leaf: &FilterLeaf) -> Result<String> {
        let term = self.registry.lookup(&leaf.term)?;
        let fragment = match (&leaf.values, &leaf.ranges, &leaf.groupset) {
            (Some(values), None, None) => self.value_set(&term, values, leaf.is_not)?,
            (None, Some(ranges), None) => {
                if leaf.is_not {
                    return Err(PhenoqueryError::CallerInput(format!(
                        "range leaf on term '{}' must negate per range, not per leaf",
                        leaf.term
                    )));
                }
                self.ranges(&term, ranges)?
            }
            (None, None, Some(groupset)) => {
                let cohort = self.active_cohort.ok_or_else(|| {
                    PhenoqueryError::Config(format!(
                        "filter uses group-set '{}' but no active cohort was supplied",
                        groupset
                    ))
                })?;
                let values = term.group_set_values(groupset, cohort)?.to_vec();
                self.value_set(&term, &values, leaf.is_not)?
            }
            _ => {
                return Err(PhenoqueryError::CallerInput(format!(
                    "filter leaf on term '{}' must carry exactly one of values, ranges or groupset",
                    leaf.term
                )));
            }
        };
        let name = fragment.name().to_string();
        self.ctes.push(fragment);
        Ok(name)
    }

    fn value_set(&mut self, term: &Term, values: &[String], is_not: bool) -> Result<Fragment> {
        let name = self.fresh_name();
        if values.is_empty() {
            // empty value-set means "match nothing"; short-circuit rather
            // than silently matching everything
            return Ok(Fragment::new(
                name,
                "select id as sample from samples where 1 = 0",
                Vec::new(),
            ));
        }
        let mut sink = ParamSink::new();
        let sql = match term.kind() {
            TermKind::ConditionDiscrete
            | TermKind::ConditionBinary
            | TermKind::ConditionCuminc
            | TermKind::ConditionCox => {
                let grades = values
                    .iter()
                    .map(|v| {
                        v.parse::<i64>().map_err(|_| {
                            PhenoqueryError::CallerInput(format!(
                                "'{}' is not a grade value for condition term '{}'",
                                v,
                                term.id()
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                let term_mark = sink.push(term.id().to_string());
                let marks = sink.push_list(grades);
                let membership = if is_not { "not in" } else { "in" };
                format!(
                    "select distinct sample from precomputed \
                     where term_id = {} and value_for = 'grade' and max_grade = 1 \
                     and computable = 1 and value {} ({})",
                    term_mark, membership, marks
                )
            }
            _ => {
                let term_mark = sink.push(term.id().to_string());
                let marks = sink.push_list(values.iter().cloned());
                let membership = if is_not { "not in" } else { "in" };
                format!(
                    "select distinct sample from anno_categorical \
                     where term_id = {} and value {} ({})",
                    term_mark, membership, marks
                )
            }
        };
        Ok(Fragment::new(name, sql, sink.into_params()))
    }

    fn ranges(&mut self, term: &Term, ranges: &[RangeClause]) -> Result<Fragment> {
        if ranges.is_empty() {
            return Err(PhenoqueryError::CallerInput(format!(
                "range leaf on term '{}' carries no ranges",
                term.id()
            )));
        }
        let name = self.fresh_name();
        let mut sink = ParamSink::new();
        let term_mark = sink.push(term.id().to_string());
        let mut sql = format!(
            "select distinct sample from anno_float where term_id = {}",
            term_mark
        );
        let uncomputable = term.uncomputable_numbers();
        if !uncomputable.is_empty() {
            let marks = sink.push_list(uncomputable);
            sql.push_str(&format!(" and value not in ({})", marks));
        }
        let clauses = ranges
            .iter()
            .map(|r| r.sql(&mut sink))
            .collect::<Vec<_>>()
            .join(" or ");
        sql.push_str(&format!(" and ({})", clauses));
        Ok(Fragment::new(name, sql, sink.into_params()))
    }
}
