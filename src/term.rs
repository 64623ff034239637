//! Terms, term wrappers and the dataset-level term registry.
//!
//! A [`Term`] is an immutable clinical/phenotype variable definition with a
//! fixed [`TermKind`] and kind-specific metadata. Terms are owned and
//! deduplicated by a [`TermRegistry`] keyed by identifier, enabling canonical
//! sharing through `Arc`. A [`TermWrapper`] pairs a term identifier with the
//! per-request [`QueryModifiers`]; it never mutates the underlying term.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::sync::Arc;

use seahash::SeaHasher;
use serde::{Deserialize, Serialize};

use crate::error::{PhenoqueryError, Result};

/// Samples are identified by integers assigned by the store.
pub type SampleId = i64;

pub type SampleHasher = BuildHasherDefault<SeaHasher>;
pub type KeyHasher = BuildHasherDefault<SeaHasher>;

/// Closed catalogue of term kinds. Fragment generation dispatches on this
/// enum so that adding a kind is a compile error until every match is
/// extended, never a silent fallthrough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TermKind {
    Categorical,
    Continuous,
    Discrete,
    ConditionDiscrete,
    ConditionBinary,
    ConditionCuminc,
    ConditionCox,
    Date,
    SampleList,
    Collection,
}

/// Metadata for one raw categorical value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryMeta {
    pub label: String,
    #[serde(default)]
    pub uncomputable: bool,
}

/// Kind-specific term metadata, stored as JSON in the `terms` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TermMeta {
    /// Raw value -> label map. For numeric terms only the declared
    /// uncomputable sentinel values appear here.
    #[serde(default)]
    pub values: BTreeMap<String, CategoryMeta>,
    /// Preconfigured breakpoints used when the wrapper supplies none.
    #[serde(default)]
    pub default_breaks: Option<Vec<f64>>,
    /// Highest grade a condition term can reach (grade 5 is death,
    /// grade 9 is uncomputable by store convention).
    #[serde(default)]
    pub max_grade: Option<i64>,
    /// Sub-terms of a collection term; all must share one numeric
    /// annotation family.
    #[serde(default)]
    pub sub_terms: Vec<String>,
    /// Named group-sets: group-set name -> cohort -> allowed raw values.
    #[serde(default)]
    pub group_sets: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

/// An immutable variable definition.
#[derive(Debug, Clone)]
pub struct Term {
    id: String,
    name: String,
    kind: TermKind,
    meta: TermMeta,
}

impl Term {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: TermKind, meta: TermMeta) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            meta,
        }
    }
    // Fields are encapsulated behind getters so terms stay truly immutable
    // once kept by the registry.
    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn kind(&self) -> TermKind {
        self.kind
    }
    pub fn meta(&self) -> &TermMeta {
        &self.meta
    }
    /// Raw values declared uncomputable, with their labels.
    pub fn uncomputable_values(&self) -> impl Iterator<Item = (&str, &str)> {
        self.meta
            .values
            .iter()
            .filter(|(_, m)| m.uncomputable)
            .map(|(v, m)| (v.as_str(), m.label.as_str()))
    }
    /// Uncomputable sentinels of a numeric term, parsed to numbers.
    pub fn uncomputable_numbers(&self) -> Vec<f64> {
        self.uncomputable_values()
            .filter_map(|(v, _)| v.parse::<f64>().ok())
            .collect()
    }
    /// Allowed values of `group_set` for `cohort`. A missing mapping for an
    /// active cohort is a hard configuration error, not an empty match.
    pub fn group_set_values(&self, group_set: &str, cohort: &str) -> Result<&[String]> {
        let set = self.meta.group_sets.get(group_set).ok_or_else(|| {
            PhenoqueryError::Config(format!(
                "term '{}' has no group-set named '{}'",
                self.id, group_set
            ))
        })?;
        set.get(cohort).map(|v| v.as_slice()).ok_or_else(|| {
            PhenoqueryError::Config(format!(
                "group-set '{}' of term '{}' has no mapping for cohort '{}'",
                group_set, self.id, cohort
            ))
        })
    }
}

/// Dataset-level registry owning every loaded term.
#[derive(Debug, Default)]
pub struct TermRegistry {
    kept: HashMap<String, Arc<Term>, KeyHasher>,
}

impl TermRegistry {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn keep(&mut self, term: Term) -> (Arc<Term>, bool) {
        let id = term.id().to_owned();
        let previously_kept = self.kept.contains_key(&id);
        if !previously_kept {
            self.kept.insert(id.clone(), Arc::new(term));
        }
        (Arc::clone(&self.kept[&id]), previously_kept)
    }
    pub fn get(&self, id: &str) -> Option<Arc<Term>> {
        self.kept.get(id).cloned()
    }
    /// Lookup that treats an unknown identifier as a configuration error.
    pub fn lookup(&self, id: &str) -> Result<Arc<Term>> {
        self.get(id)
            .ok_or_else(|| PhenoqueryError::Config(format!("unknown term '{}'", id)))
    }
    pub fn len(&self) -> usize {
        self.kept.len()
    }
    pub fn is_empty(&self) -> bool {
        self.kept.is_empty()
    }
}

/// For condition terms, which single grade value per sample is selected:
/// the highest grade, the most recently assessed grade, or the earliest
/// assessed computable grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Restriction {
    MaxGrade,
    MostRecentGrade,
    ComputableGrade,
}

/// Whether a condition term is broken down by grade or by child term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarBy {
    Grade,
    Children,
}

/// One named group of a sample-list term. A trailing group with no explicit
/// samples is the catch-all for everyone not named elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleGroup {
    pub name: String,
    #[serde(default)]
    pub samples: Vec<SampleId>,
}

/// At-query-time overrides. Constructed fresh per request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryModifiers {
    #[serde(default)]
    pub breaks: Option<Vec<f64>>,
    #[serde(default)]
    pub restriction: Option<Restriction>,
    #[serde(default)]
    pub bar_by: Option<BarBy>,
    #[serde(default)]
    pub include_uncomputable: bool,
    /// Optional allow-list restricting which categories are visible.
    #[serde(default)]
    pub value_filter: Option<Vec<String>>,
    /// Named groups of a sample-list term.
    #[serde(default)]
    pub groups: Option<Vec<SampleGroup>>,
}

/// The query view of a term: its identifier plus per-request modifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TermWrapper {
    pub id: String,
    #[serde(default)]
    pub q: QueryModifiers,
}
