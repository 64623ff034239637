//! Binning engine for continuous values.
//!
//! Computes default or explicit bin boundaries for numeric terms. Interval
//! bins partition the computable domain (mutually exclusive, collectively
//! covering); declared uncomputable raw values become synthetic unannotated
//! bins appended after the interval bins, mapped by equality rather than by
//! interval membership. Default bins are cached per
//! `(term id, filter fingerprint)` so that two requests with different
//! filters never observe each other's cached bins.

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Arc;

use seahash::SeaHasher;
use serde::Serialize;

use crate::error::{PhenoqueryError, Result};
use crate::term::KeyHasher;

/// Default bin computations aim for at most this many interval bins.
const DEFAULT_BIN_TARGET: usize = 8;

/// One bucket of a binned numeric partition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Bin {
    /// An interval of the computable domain. `None` bounds are unbounded.
    Interval {
        label: String,
        start: Option<f64>,
        stop: Option<f64>,
        start_inclusive: bool,
        stop_inclusive: bool,
    },
    /// Maps one discrete uncomputable raw value directly to a label.
    Unannotated { value: String, label: String },
}

impl Bin {
    pub fn label(&self) -> &str {
        match self {
            Bin::Interval { label, .. } => label,
            Bin::Unannotated { label, .. } => label,
        }
    }

    /// Interval membership under the bin's own inclusivity flags.
    /// Unannotated bins never match by interval.
    pub fn contains(&self, v: f64) -> bool {
        match self {
            Bin::Unannotated { .. } => false,
            Bin::Interval {
                start,
                stop,
                start_inclusive,
                stop_inclusive,
                ..
            } => {
                let above = match start {
                    None => true,
                    Some(s) if *start_inclusive => v >= *s,
                    Some(s) => v > *s,
                };
                let below = match stop {
                    None => true,
                    Some(s) if *stop_inclusive => v <= *s,
                    Some(s) => v < *s,
                };
                above && below
            }
        }
    }
}

/// Result of a bin computation where "no bins apply" is an expected branch,
/// not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum BinOutcome {
    Bins(Vec<Bin>),
    NotApplicable,
}

fn fmt_num(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

fn interval(start: Option<f64>, stop: Option<f64>) -> Bin {
    let label = match (start, stop) {
        (None, Some(b)) => format!("<{}", fmt_num(b)),
        (Some(a), Some(b)) => format!("{} to <{}", fmt_num(a), fmt_num(b)),
        (Some(a), None) => format!(">={}", fmt_num(a)),
        (None, None) => "any value".to_string(),
    };
    Bin::Interval {
        label,
        start,
        stop,
        // half-open [start, stop) everywhere keeps bins mutually exclusive
        start_inclusive: start.is_some(),
        stop_inclusive: false,
    }
}

/// Exactly `breaks.len() + 1` interval bins from explicit breakpoints:
/// `(-inf, b1), [b1, b2), ..., [bn, +inf)`.
pub fn bins_from_breaks(breaks: &[f64]) -> Result<Vec<Bin>> {
    if breaks.is_empty() {
        return Err(PhenoqueryError::CallerInput(
            "explicit binning requires at least one breakpoint".into(),
        ));
    }
    if breaks.windows(2).any(|w| w[0] >= w[1]) {
        return Err(PhenoqueryError::CallerInput(
            "breakpoints must be strictly increasing".into(),
        ));
    }
    let mut bins = Vec::with_capacity(breaks.len() + 1);
    bins.push(interval(None, Some(breaks[0])));
    for w in breaks.windows(2) {
        bins.push(interval(Some(w[0]), Some(w[1])));
    }
    bins.push(interval(Some(breaks[breaks.len() - 1]), None));
    Ok(bins)
}

// Equal-width bin size rounded up to a 1/2/5 multiple of a power of ten.
fn nice_width(span: f64) -> f64 {
    let raw = span / DEFAULT_BIN_TARGET as f64;
    let magnitude = 10f64.powf(raw.log10().floor());
    for m in [1.0, 2.0, 5.0, 10.0] {
        let width = m * magnitude;
        if span / width <= DEFAULT_BIN_TARGET as f64 {
            return width;
        }
    }
    10.0 * magnitude
}

/// Default partition when no explicit breaks are supplied: equal-width bins
/// with a bounded count, unbounded at both ends so every computable value
/// lands somewhere. Degenerate domains (empty, single value) still yield one
/// bin rather than erroring.
pub fn default_bins(values: &[f64]) -> Vec<Bin> {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for v in values {
        if v.is_finite() {
            min = min.min(*v);
            max = max.max(*v);
        }
    }
    if !min.is_finite() {
        // empty domain
        return vec![interval(None, None)];
    }
    if min == max {
        return vec![Bin::Interval {
            label: fmt_num(min),
            start: Some(min),
            stop: Some(min),
            start_inclusive: true,
            stop_inclusive: true,
        }];
    }
    let width = nice_width(max - min);
    let first_edge = (min / width).floor() * width + width;
    let mut breaks = Vec::new();
    let mut edge = first_edge;
    while edge < max && breaks.len() + 2 <= DEFAULT_BIN_TARGET {
        breaks.push(edge);
        edge += width;
    }
    if breaks.is_empty() {
        breaks.push(first_edge);
    }
    // breaks are strictly increasing by construction
    bins_from_breaks(&breaks).unwrap_or_else(|_| vec![interval(None, None)])
}

/// Synthetic unannotated bins for declared uncomputable raw values, appended
/// after the interval bins.
pub fn append_unannotated<'a>(
    bins: &mut Vec<Bin>,
    uncomputable: impl Iterator<Item = (&'a str, &'a str)>,
) {
    for (value, label) in uncomputable {
        bins.push(Bin::Unannotated {
            value: value.to_string(),
            label: label.to_string(),
        });
    }
}

/// The bin a well-formed value belongs to. Uncomputable exclusion applies
/// before interval matching; zero matches means "not annotated for this
/// term", never an error.
pub fn bin_for<'a>(bins: &'a [Bin], raw: &str, number: f64) -> Option<&'a Bin> {
    for bin in bins {
        if let Bin::Unannotated { value, .. } = bin {
            if value == raw {
                return Some(bin);
            }
        }
    }
    bins.iter()
        .find(|b| matches!(b, Bin::Interval { .. }) && b.contains(number))
}

/// Fingerprint for cache keying; callers feed a canonical serialization of
/// whatever the computation depended on (e.g. the filter tree).
pub fn fingerprint(bytes: &[u8]) -> u64 {
    let mut hasher = SeaHasher::new();
    hasher.write(bytes);
    hasher.finish()
}

/// Explicit cache for computed default bins, keyed by
/// `(term id, filter fingerprint)`. Wrappers carrying explicit breaks or
/// group-sets bypass this cache entirely.
#[derive(Debug, Default)]
pub struct BinCache {
    kept: HashMap<(String, u64), Arc<Vec<Bin>>, KeyHasher>,
}

impl BinCache {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn get(&self, term_id: &str, filter_fingerprint: u64) -> Option<Arc<Vec<Bin>>> {
        self.kept
            .get(&(term_id.to_string(), filter_fingerprint))
            .cloned()
    }
    pub fn keep(&mut self, term_id: &str, filter_fingerprint: u64, bins: Vec<Bin>) -> Arc<Vec<Bin>> {
        let kept = Arc::new(bins);
        self.kept
            .insert((term_id.to_string(), filter_fingerprint), Arc::clone(&kept));
        kept
    }
    pub fn invalidate_term(&mut self, term_id: &str) {
        self.kept.retain(|(id, _), _| id != term_id);
    }
    pub fn len(&self) -> usize {
        self.kept.len()
    }
    pub fn is_empty(&self) -> bool {
        self.kept.is_empty()
    }
}
