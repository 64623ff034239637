//! Fragment generators for time-to-event "condition" terms.
//!
//! Condition terms are graded adverse events: the store keeps a precomputed
//! grade-or-child projection (one row per distinct grade per sample, flagged
//! for the max / most-recent / earliest restriction policies) and the raw
//! chronological event rows used by the cumulative-incidence and Cox
//! variants. Grade 5 is death, grade 9 is uncomputable.

use std::collections::BTreeMap;

use crate::error::{PhenoqueryError, Result};
use crate::fragment::{Fragment, ParamSink};
use crate::generators::CompiledTerm;
use crate::matrix::TermReference;
use crate::term::{BarBy, QueryModifiers, Restriction, Term};

pub const GRADE_DEATH: i64 = 5;
pub const GRADE_UNCOMPUTABLE: i64 = 9;

/// Event status codes shared by the cuminc and cox variants.
pub const STATUS_CENSORED: i64 = 0;
pub const STATUS_EVENT: i64 = 1;
pub const STATUS_COMPETING: i64 = 2;
pub const STATUS_BEFORE_ENTRY: i64 = -1;

// The restriction policy column of the precomputed projection. Each column
// flags exactly one grade row per sample, so a policy never yields more than
// one cell. A missing policy is a caller error for the grade-selecting kinds.
fn policy_column(term: &Term, q: &QueryModifiers) -> Result<&'static str> {
    match q.restriction {
        Some(Restriction::MaxGrade) => Ok("max_grade"),
        Some(Restriction::MostRecentGrade) => Ok("most_recent"),
        Some(Restriction::ComputableGrade) => Ok("earliest"),
        None => Err(PhenoqueryError::CallerInput(format!(
            "condition term '{}' requires a restriction policy",
            term.id()
        ))),
    }
}

// Exactly one breakpoint, used as a grade cutoff by the binary, cuminc and
// cox variants. Checked before any statement executes.
fn single_cutoff(term: &Term, q: &QueryModifiers) -> Result<i64> {
    let breaks = q.breaks.as_deref().unwrap_or(&[]);
    if breaks.len() != 1 {
        return Err(PhenoqueryError::CallerInput(format!(
            "condition term '{}' requires exactly one breakpoint, got {}",
            term.id(),
            breaks.len()
        )));
    }
    let cutoff = breaks[0] as i64;
    if breaks[0].fract() != 0.0 || cutoff < 1 || cutoff > GRADE_DEATH {
        return Err(PhenoqueryError::CallerInput(format!(
            "breakpoint {} of condition term '{}' is not a grade in 1..={}",
            breaks[0],
            term.id(),
            GRADE_DEATH
        )));
    }
    Ok(cutoff)
}

fn max_grade(term: &Term) -> i64 {
    term.meta().max_grade.unwrap_or(GRADE_DEATH)
}

/// Condition term returning one grade (or child) per sample under the
/// requested restriction policy; with breaks, grades are partitioned into
/// named groups instead, one UNION-combined sub-fragment per group.
pub fn discrete(name: &str, term: &Term, q: &QueryModifiers) -> Result<CompiledTerm> {
    if let Some(breaks) = q.breaks.as_deref().filter(|b| !b.is_empty()) {
        if q.bar_by == Some(BarBy::Children) {
            return Err(PhenoqueryError::CallerInput(format!(
                "condition term '{}' cannot group grades while barring by children",
                term.id()
            )));
        }
        return grouped(name, term, q, breaks);
    }
    let policy = policy_column(term, q)?;
    let value_for = match q.bar_by {
        Some(BarBy::Children) => "child",
        _ => "grade",
    };
    let mut sink = ParamSink::new();
    let term_mark = sink.push(term.id().to_string());
    let for_mark = sink.push(value_for.to_string());
    let mut sql = format!(
        "select sample, value as key, value as value from precomputed \
         where term_id = {} and value_for = {} and {} = 1",
        term_mark, for_mark, policy
    );
    if !q.include_uncomputable {
        sql.push_str(" and computable = 1");
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

/// Condition term with exactly two groups split at one grade cutoff.
pub fn binary(name: &str, term: &Term, q: &QueryModifiers) -> Result<CompiledTerm> {
    let cutoff = single_cutoff(term, q)?;
    grouped(name, term, q, &[cutoff as f64])
}

// Grade groups from breakpoints: [0, b1), [b1, b2), ..., [bn, max].
fn grouped(name: &str, term: &Term, q: &QueryModifiers, breaks: &[f64]) -> Result<CompiledTerm> {
    let policy = policy_column(term, q)?;
    let top = max_grade(term);
    let mut cutoffs = Vec::with_capacity(breaks.len());
    for b in breaks {
        let grade = *b as i64;
        if b.fract() != 0.0 || grade < 1 || grade > top {
            return Err(PhenoqueryError::CallerInput(format!(
                "breakpoint {} of condition term '{}' is not a grade in 1..={}",
                b,
                term.id(),
                top
            )));
        }
        cutoffs.push(grade);
    }
    if cutoffs.windows(2).any(|w| w[0] >= w[1]) {
        return Err(PhenoqueryError::CallerInput(format!(
            "breakpoints of condition term '{}' must be strictly increasing",
            term.id()
        )));
    }
    let mut bounds = Vec::with_capacity(cutoffs.len() + 1);
    let mut lo = 0i64;
    for cutoff in &cutoffs {
        bounds.push((lo, cutoff - 1));
        lo = *cutoff;
    }
    bounds.push((lo, top));

    let mut sink = ParamSink::new();
    let mut selects = Vec::new();
    let mut group_names = Vec::new();
    for (lo, hi) in bounds {
        let group_name = if lo == hi {
            format!("Grade {}", lo)
        } else {
            format!("Grade {}-{}", lo, hi)
        };
        group_names.push(group_name.clone());
        let key_mark = sink.push(group_name);
        let term_mark = sink.push(term.id().to_string());
        let lo_mark = sink.push(lo);
        let hi_mark = sink.push(hi);
        selects.push(format!(
            "select sample, {} as key, value as value from precomputed \
             where term_id = {} and value_for = 'grade' and {} = 1 and computable = 1 \
             and value >= {} and value <= {}",
            key_mark, term_mark, policy, lo_mark, hi_mark
        ));
    }
    let reference = TermReference {
        groups: Some(group_names),
        ..TermReference::default()
    };
    Ok(CompiledTerm::plain(
        Fragment::new(name, selects.join("\nunion all\n"), sink.into_params()),
        reference,
    ))
}

/// Cumulative-incidence variant: `(sample, status, years_to_event)` where
/// status 1 is the first event graded at or above the cutoff, 2 is death as
/// the competing risk, and 0 is censoring at the last computable event.
pub fn cuminc(name: &str, term: &Term, q: &QueryModifiers) -> Result<CompiledTerm> {
    let cutoff = single_cutoff(term, q)?;
    let mut sink = ParamSink::new();
    let event_arm = if cutoff == GRADE_DEATH {
        // the cutoff reaches death itself, so there is no competing risk left
        format!(
            "min(case when grade = {} then years_to_event end)",
            sink.push(cutoff)
        )
    } else {
        format!(
            "min(case when grade >= {} and grade < {} then years_to_event end)",
            sink.push(cutoff),
            sink.push(GRADE_DEATH)
        )
    };
    let death_arm = if cutoff == GRADE_DEATH {
        "null".to_string()
    } else {
        format!(
            "min(case when grade = {} then years_to_event end)",
            sink.push(GRADE_DEATH)
        )
    };
    let uncomputable_mark = sink.push(GRADE_UNCOMPUTABLE);
    let term_mark = sink.push(term.id().to_string());
    let sql = format!(
        "select sample, key, value from (\n\
         select sample,\n\
           case when t_event is not null then {event}\n\
                when t_death is not null then {competing}\n\
                else {censored} end as key,\n\
           coalesce(t_event, t_death, t_last) as value\n\
         from (\n\
           select sample,\n\
             {event_arm} as t_event,\n\
             {death_arm} as t_death,\n\
             max(case when grade != {unc} then years_to_event end) as t_last\n\
           from chronicevents where term_id = {term}\n\
           group by sample\n\
         )\n\
        ) where value is not null",
        event = STATUS_EVENT,
        competing = STATUS_COMPETING,
        censored = STATUS_CENSORED,
        event_arm = event_arm,
        death_arm = death_arm,
        unc = uncomputable_mark,
        term = term_mark,
    );
    let grade_label = if cutoff == GRADE_DEATH {
        format!("grade {} (death)", GRADE_DEATH)
    } else {
        format!("grade {}-{}", cutoff, GRADE_DEATH - 1)
    };
    let mut event_labels = BTreeMap::new();
    event_labels.insert(STATUS_CENSORED, "censored".to_string());
    event_labels.insert(STATUS_EVENT, format!("event of interest: {}", grade_label));
    if cutoff != GRADE_DEATH {
        event_labels.insert(STATUS_COMPETING, "death (competing risk)".to_string());
    }
    let reference = TermReference {
        event_labels: Some(event_labels),
        ..TermReference::default()
    };
    Ok(CompiledTerm::plain(
        Fragment::new(name, sql, sink.into_params()),
        reference,
    ))
}

/// Cox variant: `(sample, status, {age_start, age_end})` against the
/// per-sample cohort-entry and last-followup ages. An event graded before
/// cohort entry yields status −1 so consumers can exclude the sample.
pub fn cox(name: &str, term: &Term, q: &QueryModifiers) -> Result<CompiledTerm> {
    let cutoff = single_cutoff(term, q)?;
    let mut sink = ParamSink::new();
    let cutoff_mark = sink.push(cutoff);
    let uncomputable_mark = sink.push(GRADE_UNCOMPUTABLE);
    let term_mark = sink.push(term.id().to_string());
    let sql = format!(
        "select e.sample as sample,\n\
           case when e.age_event is null then {censored}\n\
                when e.age_event < s.age_entry then {before}\n\
                else {event} end as key,\n\
           json_object('age_start', s.age_entry,\n\
                       'age_end', coalesce(e.age_event, s.age_last)) as value\n\
         from (\n\
           select sample,\n\
             min(case when grade >= {cut} and grade != {unc} then age_graded end) as age_event\n\
           from chronicevents where term_id = {term}\n\
           group by sample\n\
         ) e\n\
         join samples s on s.id = e.sample",
        censored = STATUS_CENSORED,
        before = STATUS_BEFORE_ENTRY,
        event = STATUS_EVENT,
        cut = cutoff_mark,
        unc = uncomputable_mark,
        term = term_mark,
    );
    let mut event_labels = BTreeMap::new();
    event_labels.insert(STATUS_CENSORED, "censored".to_string());
    event_labels.insert(
        STATUS_EVENT,
        format!("event of interest: grade {}-{}", cutoff, max_grade(term)),
    );
    event_labels.insert(STATUS_BEFORE_ENTRY, "event before cohort entry".to_string());
    let reference = TermReference {
        event_labels: Some(event_labels),
        ..TermReference::default()
    };
    Ok(CompiledTerm {
        fragment: Fragment::new(name, sql, sink.into_params()),
        reference,
        value_is_json: true,
    })
}
