//! Query orchestration and matrix assembly.
//!
//! [`get_matrix`] compiles the request filter once, asks each term wrapper's
//! kind generator for its fragment, issues one statement per wrapper joined
//! against the shared included-sample fragment, and reshapes the returned
//! rows into a per-sample, per-term nested result. Samples with zero matching
//! terms across the whole request are omitted; output iteration order is
//! insignificant. Any per-term failure aborts the whole call, since a
//! partially filled matrix would mislead statistical consumers.

use std::collections::{BTreeMap, HashMap};

use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::bins::Bin;
use crate::error::{PhenoqueryError, Result};
use crate::filter::{self, Filter};
use crate::fragment;
use crate::generators::{self, GeneratorContext};
use crate::interface::CancelToken;
use crate::store::Dataset;
use crate::term::{KeyHasher, SampleHasher, SampleId, TermWrapper};

/// One matrix request as handed over by the route layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixRequest {
    pub terms: Vec<TermWrapper>,
    #[serde(default)]
    pub filter: Option<Filter>,
    /// Cohort that group-set filter leaves resolve against.
    #[serde(default)]
    pub active_cohort: Option<String>,
}

/// One term's per-sample result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cell {
    /// Canonical discrete/continuous bucket label.
    pub key: String,
    /// Raw or derived payload (scalar for most kinds, object for the cox and
    /// term-collection kinds).
    pub value: JsonValue,
}

/// Per-term metadata consumers need to interpret the matrix without
/// recomputing bins: bin lists, category label maps, group ordering and
/// event-status labels.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TermReference {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bins: Option<Vec<Bin>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub categories: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_labels: Option<BTreeMap<i64, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<String>>,
}

impl TermReference {
    pub fn is_empty(&self) -> bool {
        self.bins.is_none()
            && self.categories.is_none()
            && self.event_labels.is_none()
            && self.groups.is_none()
    }
}

pub type SampleMatrix = HashMap<SampleId, HashMap<String, Cell, KeyHasher>, SampleHasher>;

/// The assembled matrix plus the parallel references object.
#[derive(Debug, Default, Serialize)]
pub struct MatrixResponse {
    pub samples: SampleMatrix,
    pub references: BTreeMap<String, TermReference>,
}

/// Compile and execute one matrix request against `dataset`.
pub fn get_matrix(
    dataset: &Dataset,
    request: &MatrixRequest,
    cancel: Option<&CancelToken>,
) -> Result<MatrixResponse> {
    let compiled_filter = filter::compile(
        request.filter.as_ref(),
        request.active_cohort.as_deref(),
        dataset.registry(),
    )?;
    let filter_fingerprint = filter::filter_fingerprint(request.filter.as_ref())?;
    debug!(
        terms = request.terms.len(),
        filtered = compiled_filter.is_some(),
        "filter compiled"
    );
    let ctx = GeneratorContext {
        dataset,
        filter: compiled_filter.as_ref(),
        filter_fingerprint,
    };

    let mut response = MatrixResponse::default();
    for (index, wrapper) in request.terms.iter().enumerate() {
        if let Some(token) = cancel {
            if token.is_cancelled() {
                // partial results are discarded with the response under
                // construction
                return Err(PhenoqueryError::Cancelled);
            }
        }
        let term = dataset.registry().lookup(&wrapper.id)?;
        let fragment_name = format!("term{}", index);
        let compiled = generators::fragment_for(&fragment_name, &term, &wrapper.q, &ctx)?;

        // one statement per wrapper, each independently joined to the shared
        // filtered sample set
        let mut ctes: Vec<&fragment::Fragment> = Vec::new();
        let body = match &compiled_filter {
            Some(f) => {
                ctes.extend(f.ctes.iter());
                ctes.push(&compiled.fragment);
                fragment::join_on_sample(&fragment_name, &f.sample_cte)
            }
            None => {
                ctes.push(&compiled.fragment);
                fragment::select_all(&fragment_name)
            }
        };
        let composed = fragment::compose(&ctes, &body, Vec::new());
        let rows = dataset.run_rows(&composed)?;
        debug!(term = %wrapper.id, rows = rows.len(), "term query executed");

        for (sample, key, value) in rows {
            let Some(key) = key_text(key) else {
                continue; // null key: not annotated for this term
            };
            let value = cell_value(value, compiled.value_is_json)?;
            response
                .samples
                .entry(sample)
                .or_default()
                .insert(wrapper.id.clone(), Cell { key, value });
        }
        if !compiled.reference.is_empty() {
            response
                .references
                .insert(wrapper.id.clone(), compiled.reference);
        }
    }
    Ok(response)
}

// Canonical key text for a raw key column value. Null keys drop the row.
fn key_text(value: SqlValue) -> Option<String> {
    match value {
        SqlValue::Null => None,
        SqlValue::Integer(i) => Some(i.to_string()),
        SqlValue::Real(r) => {
            if r.fract() == 0.0 && r.abs() < 1e15 {
                Some(format!("{}", r as i64))
            } else {
                Some(format!("{}", r))
            }
        }
        SqlValue::Text(t) => Some(t),
        SqlValue::Blob(_) => None,
    }
}

fn cell_value(value: SqlValue, value_is_json: bool) -> Result<JsonValue> {
    if value_is_json {
        let SqlValue::Text(text) = value else {
            return Err(PhenoqueryError::Invariant(
                "structured cell value is not JSON text".into(),
            ));
        };
        return serde_json::from_str(&text)
            .map_err(|e| PhenoqueryError::Invariant(format!("structured cell value: {}", e)));
    }
    Ok(match value {
        SqlValue::Null => JsonValue::Null,
        SqlValue::Integer(i) => JsonValue::from(i),
        SqlValue::Real(r) => serde_json::Number::from_f64(r)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        SqlValue::Text(t) => JsonValue::String(t),
        SqlValue::Blob(_) => JsonValue::Null,
    })
}
