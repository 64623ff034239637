//! Fragment generators for the non-condition term kinds.
//!
//! One generator per [`TermKind`], selected by [`fragment_for`] through an
//! explicit match so a newly added kind cannot fall through silently. Every
//! generator compiles a term plus its query modifiers into a named fragment
//! producing `(sample, key, value)` rows; unmet preconditions fail here,
//! before any statement executes. Condition kinds live in
//! [`crate::condition`].

use std::sync::Arc;

use crate::bins::{self, Bin, BinOutcome};
use crate::condition;
use crate::error::{PhenoqueryError, Result};
use crate::filter::CompiledFilter;
use crate::fragment::{Fragment, ParamSink};
use crate::matrix::TermReference;
use crate::store::Dataset;
use crate::term::{QueryModifiers, Term, TermKind};

/// Shared per-request context handed to every generator.
pub struct GeneratorContext<'a> {
    pub dataset: &'a Dataset,
    pub filter: Option<&'a CompiledFilter>,
    pub filter_fingerprint: u64,
}

/// A term fragment together with the metadata consumers need to interpret
/// its rows.
pub struct CompiledTerm {
    pub fragment: Fragment,
    pub reference: TermReference,
    /// Set when the value column carries JSON text (cox, term-collection).
    pub value_is_json: bool,
}

impl CompiledTerm {
    pub(crate) fn plain(fragment: Fragment, reference: TermReference) -> Self {
        Self {
            fragment,
            reference,
            value_is_json: false,
        }
    }
}

/// Compile one term wrapper into its kind's fragment.
pub fn fragment_for(
    name: &str,
    term: &Term,
    q: &QueryModifiers,
    ctx: &GeneratorContext,
) -> Result<CompiledTerm> {
    match term.kind() {
        TermKind::Categorical => categorical(name, term, q),
        TermKind::Continuous => continuous(name, term, q),
        TermKind::Discrete => discrete(name, term, q, ctx),
        TermKind::Date => date(name, term),
        TermKind::SampleList => sample_list(name, term, q),
        TermKind::Collection => collection(name, term, ctx),
        TermKind::ConditionDiscrete => condition::discrete(name, term, q),
        TermKind::ConditionBinary => condition::binary(name, term, q),
        TermKind::ConditionCuminc => condition::cuminc(name, term, q),
        TermKind::ConditionCox => condition::cox(name, term, q),
    }
}

/// Bins for a wrapper over a binnable term. `NotApplicable` is the expected
/// answer for kinds that do not bin; hard errors are reserved for malformed
/// breakpoints.
pub fn bins_for_wrapper(term: &Term, q: &QueryModifiers, ctx: &GeneratorContext) -> Result<BinOutcome> {
    if term.kind() != TermKind::Discrete {
        return Ok(BinOutcome::NotApplicable);
    }
    let mut result: Vec<Bin> = match explicit_breaks(term, q) {
        Some(breaks) => bins::bins_from_breaks(breaks)?,
        None => default_bins_cached(term, ctx)?.as_ref().clone(),
    };
    if q.include_uncomputable {
        bins::append_unannotated(&mut result, term.uncomputable_values());
    }
    Ok(BinOutcome::Bins(result))
}

fn explicit_breaks<'a>(term: &'a Term, q: &'a QueryModifiers) -> Option<&'a [f64]> {
    q.breaks
        .as_deref()
        .filter(|b| !b.is_empty())
        .or_else(|| term.meta().default_breaks.as_deref().filter(|b| !b.is_empty()))
}

// First-touch cached per (term, filter fingerprint); explicit breaks never
// reach this path, so the cache only ever holds default partitions.
fn default_bins_cached(term: &Term, ctx: &GeneratorContext) -> Result<Arc<Vec<Bin>>> {
    if let Some(cached) = ctx
        .dataset
        .cached_default_bins(term.id(), ctx.filter_fingerprint)?
    {
        return Ok(cached);
    }
    let uncomputable = term.uncomputable_numbers();
    let values: Vec<f64> = ctx
        .dataset
        .numeric_values(term, ctx.filter)?
        .into_iter()
        .filter(|v| !uncomputable.contains(v))
        .collect();
    let computed = bins::default_bins(&values);
    ctx.dataset
        .cache_default_bins(term.id(), ctx.filter_fingerprint, computed)
}

fn categorical(name: &str, term: &Term, q: &QueryModifiers) -> Result<CompiledTerm> {
    let mut sink = ParamSink::new();
    let term_mark = sink.push(term.id().to_string());
    let mut sql = format!(
        "select sample, value as key, value as value from anno_categorical where term_id = {}",
        term_mark
    );
    if !q.include_uncomputable {
        let excluded: Vec<String> = term
            .uncomputable_values()
            .map(|(v, _)| v.to_string())
            .collect();
        if !excluded.is_empty() {
            let marks = sink.push_list(excluded);
            sql.push_str(&format!(" and value not in ({})", marks));
        }
    }
    if let Some(allowed) = &q.value_filter {
        let marks = sink.push_list(allowed.iter().cloned());
        sql.push_str(&format!(" and value in ({})", marks));
    }
    let mut reference = TermReference::default();
    if !term.meta().values.is_empty() {
        reference.categories = Some(
            term.meta()
                .values
                .iter()
                .map(|(v, m)| (v.clone(), m.label.clone()))
                .collect(),
        );
    }
    Ok(CompiledTerm::plain(
        Fragment::new(name, sql, sink.into_params()),
        reference,
    ))
}

// Pass-through fragment: key == value, no binning.
fn continuous(name: &str, term: &Term, q: &QueryModifiers) -> Result<CompiledTerm> {
    let mut sink = ParamSink::new();
    let term_mark = sink.push(term.id().to_string());
    let mut sql = format!(
        "select sample, value as key, value as value from anno_float where term_id = {}",
        term_mark
    );
    if !q.include_uncomputable {
        let uncomputable = term.uncomputable_numbers();
        if !uncomputable.is_empty() {
            let marks = sink.push_list(uncomputable);
            sql.push_str(&format!(" and value not in ({})", marks));
        }
    }
    Ok(CompiledTerm::plain(
        Fragment::new(name, sql, sink.into_params()),
        TermReference::default(),
    ))
}

// Dates are not marked uncomputable in this model, so no exclusion predicate.
fn date(name: &str, term: &Term) -> Result<CompiledTerm> {
    let mut sink = ParamSink::new();
    let term_mark = sink.push(term.id().to_string());
    let sql = format!(
        "select sample, value as key, value as value from anno_date where term_id = {}",
        term_mark
    );
    Ok(CompiledTerm::plain(
        Fragment::new(name, sql, sink.into_params()),
        TermReference::default(),
    ))
}

fn discrete(name: &str, term: &Term, q: &QueryModifiers, ctx: &GeneratorContext) -> Result<CompiledTerm> {
    let BinOutcome::Bins(bin_list) = bins_for_wrapper(term, q, ctx)? else {
        return Err(PhenoqueryError::Invariant(format!(
            "discrete term '{}' yielded no bin partition",
            term.id()
        )));
    };
    let mut sink = ParamSink::new();
    let mut arms = String::new();
    // uncomputable equality arms come first so sentinels never match an
    // interval
    for bin in &bin_list {
        if let Bin::Unannotated { value, label } = bin {
            let Ok(number) = value.parse::<f64>() else {
                continue;
            };
            arms.push_str(&format!(
                " when value = {} then {}",
                sink.push(number),
                sink.push(label.clone())
            ));
        }
    }
    for bin in &bin_list {
        let Bin::Interval {
            label,
            start,
            stop,
            start_inclusive,
            stop_inclusive,
        } = bin
        else {
            continue;
        };
        let mut tests = Vec::new();
        if let Some(start) = start {
            let op = if *start_inclusive { ">=" } else { ">" };
            tests.push(format!("value {} {}", op, sink.push(*start)));
        }
        if let Some(stop) = stop {
            let op = if *stop_inclusive { "<=" } else { "<" };
            tests.push(format!("value {} {}", op, sink.push(*stop)));
        }
        let test = if tests.is_empty() {
            "1 = 1".to_string()
        } else {
            tests.join(" and ")
        };
        arms.push_str(&format!(" when {} then {}", test, sink.push(label.clone())));
    }
    let term_mark = sink.push(term.id().to_string());
    let mut inner = format!(
        "select sample, case{} end as key, value as value from anno_float where term_id = {}",
        arms, term_mark
    );
    if !q.include_uncomputable {
        let uncomputable = term.uncomputable_numbers();
        if !uncomputable.is_empty() {
            let marks = sink.push_list(uncomputable);
            inner.push_str(&format!(" and value not in ({})", marks));
        }
    }
    // a value matching zero bins is "not annotated", which the null key drops
    let sql = format!(
        "select sample, key, value from ({}) where key is not null",
        inner
    );
    let reference = TermReference {
        bins: Some(bin_list),
        ..TermReference::default()
    };
    Ok(CompiledTerm::plain(
        Fragment::new(name, sql, sink.into_params()),
        reference,
    ))
}

fn sample_list(name: &str, term: &Term, q: &QueryModifiers) -> Result<CompiledTerm> {
    let groups = q.groups.as_deref().filter(|g| !g.is_empty()).ok_or_else(|| {
        PhenoqueryError::CallerInput(format!(
            "sample-list term '{}' requires named groups",
            term.id()
        ))
    })?;
    let mut sink = ParamSink::new();
    let mut selects = Vec::new();
    let mut named: Vec<i64> = Vec::new();
    for (index, group) in groups.iter().enumerate() {
        let last = index == groups.len() - 1;
        if group.samples.is_empty() {
            if !last {
                return Err(PhenoqueryError::CallerInput(format!(
                    "group '{}' of sample-list term '{}' has no samples and is not the trailing catch-all",
                    group.name,
                    term.id()
                )));
            }
            // catch-all: everyone not named elsewhere, as a set complement
            let key_mark = sink.push(group.name.clone());
            let value_mark = sink.push(group.name.clone());
            let mut sql = format!(
                "select id as sample, {} as key, {} as value from samples",
                key_mark, value_mark
            );
            if !named.is_empty() {
                let marks = sink.push_list(named.iter().copied());
                sql.push_str(&format!(" where id not in ({})", marks));
            }
            selects.push(sql);
        } else {
            named.extend(group.samples.iter().copied());
            let key_mark = sink.push(group.name.clone());
            let value_mark = sink.push(group.name.clone());
            let marks = sink.push_list(group.samples.iter().copied());
            selects.push(format!(
                "select id as sample, {} as key, {} as value from samples where id in ({})",
                key_mark, value_mark, marks
            ));
        }
    }
    let reference = TermReference {
        groups: Some(groups.iter().map(|g| g.name.clone()).collect()),
        ..TermReference::default()
    };
    Ok(CompiledTerm::plain(
        Fragment::new(name, selects.join("\nunion all\n"), sink.into_params()),
        reference,
    ))
}

fn collection(name: &str, term: &Term, ctx: &GeneratorContext) -> Result<CompiledTerm> {
    let sub_terms = &term.meta().sub_terms;
    if sub_terms.is_empty() {
        return Err(PhenoqueryError::Config(format!(
            "collection term '{}' declares no sub-terms",
            term.id()
        )));
    }
    // every sub-term must live in the same numeric annotation family
    for sub_id in sub_terms {
        let sub = ctx.dataset.registry().lookup(sub_id)?;
        if !matches!(sub.kind(), TermKind::Continuous | TermKind::Discrete) {
            return Err(PhenoqueryError::Config(format!(
                "sub-term '{}' of collection '{}' is not a numeric term",
                sub_id,
                term.id()
            )));
        }
    }
    let mut sink = ParamSink::new();
    let key_mark = sink.push(term.id().to_string());
    let marks = sink.push_list(sub_terms.iter().cloned());
    let sql = format!(
        "select sample, {} as key, json_group_object(term_id, value) as value \
         from anno_float where term_id in ({}) group by sample",
        key_mark, marks
    );
    Ok(CompiledTerm {
        fragment: Fragment::new(name, sql, sink.into_params()),
        reference: TermReference::default(),
        value_is_json: true,
    })
}
