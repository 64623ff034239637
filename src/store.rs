//! Dataset handle over the relational annotation store.
//!
//! The [`Dataset`] encapsulates schema creation, restoration of the term
//! registry from the `terms` table, seeding helpers used by tests and
//! loaders, and execution of composed term statements. The engine is
//! read-only over annotation data at query time; the seeding helpers exist
//! for dataset construction only. Fixed statements go through
//! `prepare_cached`, per-request statements are composed by the fragment
//! builder.

use std::sync::Mutex;

use chrono::NaiveDate;
use roaring::RoaringTreemap;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, params, params_from_iter};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::bins::{Bin, BinCache};
use crate::condition::GRADE_UNCOMPUTABLE;
use crate::error::{PhenoqueryError, Result};
use crate::filter::CompiledFilter;
use crate::fragment::{self, ComposedQuery};
use crate::term::{SampleId, Term, TermKind, TermMeta, TermRegistry};

pub struct Dataset {
    conn: Connection,
    registry: TermRegistry,
    // default bins per (term, filter fingerprint); see crate::bins
    bin_cache: Mutex<BinCache>,
}

impl Dataset {
    pub fn open(path: &str) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            create table if not exists terms (
                term_id text not null,
                name text not null,
                kind text not null,
                jsondata text not null,
                constraint unique_term primary key (
                    term_id
                )
            );
            create table if not exists samples (
                id integer not null,
                name text not null,
                age_entry real null,
                age_last real null,
                constraint unique_sample primary key (
                    id
                ),
                constraint unique_sample_name unique (
                    name
                )
            );
            create table if not exists anno_categorical (
                sample integer not null,
                term_id text not null,
                value text not null,
                constraint one_category_per_sample primary key (
                    sample, term_id
                )
            );
            create table if not exists anno_float (
                sample integer not null,
                term_id text not null,
                value real not null,
                constraint one_number_per_sample primary key (
                    sample, term_id
                )
            );
            create table if not exists anno_date (
                sample integer not null,
                term_id text not null,
                value text not null,
                constraint one_date_per_sample primary key (
                    sample, term_id
                )
            );
            create table if not exists chronicevents (
                sample integer not null,
                term_id text not null,
                grade integer not null,
                age_graded real not null,
                years_to_event real not null
            );
            create index if not exists chronicevents_by_term
                on chronicevents (term_id, sample);
            create table if not exists precomputed (
                sample integer not null,
                term_id text not null,
                value_for text not null,
                value numeric not null,
                max_grade integer not null default 0,
                most_recent integer not null default 0,
                earliest integer not null default 0,
                computable integer not null default 0
            );
            create index if not exists precomputed_by_term
                on precomputed (term_id, value_for, sample);
            ",
        )?;
        let mut dataset = Self {
            conn,
            registry: TermRegistry::new(),
            bin_cache: Mutex::new(BinCache::new()),
        };
        dataset.restore_terms()?;
        Ok(dataset)
    }

    pub fn registry(&self) -> &TermRegistry {
        &self.registry
    }

    fn restore_terms(&mut self) -> Result<()> {
        let mut statement = self
            .conn
            .prepare_cached("select term_id, name, kind, jsondata from terms")?;
        let rows = statement.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut restored = 0usize;
        for row in rows {
            let (id, name, kind, jsondata) = row?;
            let kind: TermKind = serde_json::from_value(serde_json::Value::String(kind.clone()))
                .map_err(|_| {
                    PhenoqueryError::Config(format!("term '{}' has unknown kind '{}'", id, kind))
                })?;
            let meta: TermMeta = serde_json::from_str(&jsondata).map_err(|e| {
                PhenoqueryError::Config(format!("term '{}' has malformed metadata: {}", id, e))
            })?;
            self.registry.keep(Term::new(id, name, kind, meta));
            restored += 1;
        }
        if restored > 0 {
            info!(terms = restored, "term registry restored");
        }
        Ok(())
    }

    // ------------- Seeding -------------

    pub fn add_term(&mut self, term: Term) -> Result<Arc<Term>> {
        let kind_text = serde_json::to_value(term.kind())
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| PhenoqueryError::Invariant("term kind serialization".into()))?;
        let jsondata = serde_json::to_string(term.meta())
            .map_err(|e| PhenoqueryError::Invariant(format!("term metadata serialization: {}", e)))?;
        self.conn
            .prepare_cached(
                "insert or replace into terms (term_id, name, kind, jsondata) values (?, ?, ?, ?)",
            )?
            .execute(params![term.id(), term.name(), kind_text, jsondata])?;
        let (kept, _) = self.registry.keep(term);
        Ok(kept)
    }

    pub fn add_sample(
        &self,
        name: &str,
        age_entry: Option<f64>,
        age_last: Option<f64>,
    ) -> Result<SampleId> {
        self.conn
            .prepare_cached("insert into samples (name, age_entry, age_last) values (?, ?, ?)")?
            .execute(params![name, age_entry, age_last])?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn annotate_categorical(&self, sample: SampleId, term_id: &str, value: &str) -> Result<()> {
        self.conn
            .prepare_cached(
                "insert or replace into anno_categorical (sample, term_id, value) values (?, ?, ?)",
            )?
            .execute(params![sample, term_id, value])?;
        Ok(())
    }

    pub fn annotate_numeric(&self, sample: SampleId, term_id: &str, value: f64) -> Result<()> {
        self.conn
            .prepare_cached(
                "insert or replace into anno_float (sample, term_id, value) values (?, ?, ?)",
            )?
            .execute(params![sample, term_id, value])?;
        // the write changes the term's value domain, so cached default bins
        // no longer describe it
        self.invalidate_bins(term_id)
    }

    pub fn annotate_date(&self, sample: SampleId, term_id: &str, value: NaiveDate) -> Result<()> {
        self.conn
            .prepare_cached(
                "insert or replace into anno_date (sample, term_id, value) values (?, ?, ?)",
            )?
            .execute(params![sample, term_id, value.format("%Y-%m-%d").to_string()])?;
        Ok(())
    }

    pub fn add_condition_event(
        &self,
        sample: SampleId,
        term_id: &str,
        grade: i64,
        age_graded: f64,
        years_to_event: f64,
    ) -> Result<()> {
        self.conn
            .prepare_cached(
                "insert into chronicevents (sample, term_id, grade, age_graded, years_to_event) \
                 values (?, ?, ?, ?, ?)",
            )?
            .execute(params![sample, term_id, grade, age_graded, years_to_event])?;
        Ok(())
    }

    /// Seed one row of the child projection of a condition term.
    pub fn add_condition_child(
        &self,
        sample: SampleId,
        term_id: &str,
        child: &str,
        max_grade: bool,
        most_recent: bool,
        earliest: bool,
    ) -> Result<()> {
        self.conn
            .prepare_cached(
                "insert into precomputed \
                 (sample, term_id, value_for, value, max_grade, most_recent, earliest, computable) \
                 values (?, ?, 'child', ?, ?, ?, ?, 1)",
            )?
            .execute(params![sample, term_id, child, max_grade, most_recent, earliest])?;
        Ok(())
    }

    /// Rebuild the grade projection from the chronological event rows: one
    /// row per distinct grade per (sample, term), flagged for the max-grade,
    /// most-recent-grade and earliest-grade restriction policies. Each flag
    /// marks exactly one row per sample.
    pub fn precompute_conditions(&self) -> Result<()> {
        self.conn
            .execute("delete from precomputed where value_for = 'grade'", [])?;
        let mut statement = self.conn.prepare_cached(
            "select sample, term_id, grade, age_graded from chronicevents \
             order by term_id, sample, age_graded",
        )?;
        let rows = statement.query_map([], |row| {
            Ok((
                row.get::<_, SampleId>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, f64>(3)?,
            ))
        })?;
        let mut grouped: BTreeMap<(String, SampleId), Vec<(i64, f64)>> = BTreeMap::new();
        for row in rows {
            let (sample, term_id, grade, age) = row?;
            grouped.entry((term_id, sample)).or_default().push((grade, age));
        }
        let mut insert = self.conn.prepare_cached(
            "insert into precomputed \
             (sample, term_id, value_for, value, max_grade, most_recent, earliest, computable) \
             values (?, ?, 'grade', ?, ?, ?, ?, ?)",
        )?;
        for ((term_id, sample), events) in grouped {
            let computable: Vec<&(i64, f64)> = events
                .iter()
                .filter(|(g, _)| *g != GRADE_UNCOMPUTABLE)
                .collect();
            if computable.is_empty() {
                // only uncomputable grades seen; keep one flagged row so the
                // sample is reachable when uncomputables are included
                insert.execute(params![
                    sample,
                    term_id,
                    GRADE_UNCOMPUTABLE,
                    true,
                    true,
                    true,
                    false
                ])?;
                continue;
            }
            let top = computable.iter().map(|(g, _)| *g).max().unwrap_or(0);
            let recent = computable
                .iter()
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(g, _)| *g)
                .unwrap_or(top);
            let first = computable
                .iter()
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(g, _)| *g)
                .unwrap_or(top);
            let mut seen = Vec::new();
            for (grade, _) in &events {
                if seen.contains(grade) {
                    continue;
                }
                seen.push(*grade);
                let is_computable = *grade != GRADE_UNCOMPUTABLE;
                insert.execute(params![
                    sample,
                    term_id,
                    grade,
                    is_computable && *grade == top,
                    is_computable && *grade == recent,
                    is_computable && *grade == first,
                    is_computable
                ])?;
            }
        }
        Ok(())
    }

    // ------------- Query execution -------------

    /// Execute a composed term statement, returning raw
    /// `(sample, key, value)` rows.
    pub fn run_rows(&self, query: &ComposedQuery) -> Result<Vec<(SampleId, SqlValue, SqlValue)>> {
        let mut statement = self.conn.prepare(&query.sql)?;
        let rows = statement.query_map(params_from_iter(query.params.iter()), |row| {
            Ok((
                row.get::<_, SampleId>(0)?,
                row.get::<_, SqlValue>(1)?,
                row.get::<_, SqlValue>(2)?,
            ))
        })?;
        let mut collected = Vec::new();
        for row in rows {
            collected.push(row?);
        }
        Ok(collected)
    }

    /// Raw numeric annotation values of one term, optionally restricted to a
    /// compiled filter's included samples.
    pub fn numeric_values(&self, term: &Term, filter: Option<&CompiledFilter>) -> Result<Vec<f64>> {
        let composed = match filter {
            None => ComposedQuery {
                sql: "select value from anno_float where term_id = ?".to_string(),
                params: vec![SqlValue::from(term.id().to_string())],
            },
            Some(f) => {
                let ctes: Vec<&fragment::Fragment> = f.ctes.iter().collect();
                fragment::compose(
                    &ctes,
                    &format!(
                        "select a.value from anno_float a \
                         join {flt} on {flt}.sample = a.sample where a.term_id = ?",
                        flt = f.sample_cte
                    ),
                    vec![SqlValue::from(term.id().to_string())],
                )
            }
        };
        let mut statement = self.conn.prepare(&composed.sql)?;
        let rows = statement.query_map(params_from_iter(composed.params.iter()), |row| {
            row.get::<_, f64>(0)
        })?;
        let mut values = Vec::new();
        for row in rows {
            values.push(row?);
        }
        Ok(values)
    }

    pub fn all_samples(&self) -> Result<RoaringTreemap> {
        let mut statement = self.conn.prepare_cached("select id from samples")?;
        let rows = statement.query_map([], |row| row.get::<_, SampleId>(0))?;
        let mut set = RoaringTreemap::new();
        for row in rows {
            set.insert(row? as u64);
        }
        Ok(set)
    }

    /// Materialize a compiled filter's included-sample set.
    pub fn included_samples(&self, filter: &CompiledFilter) -> Result<RoaringTreemap> {
        let ctes: Vec<&fragment::Fragment> = filter.ctes.iter().collect();
        let composed = fragment::compose(
            &ctes,
            &format!("select sample from {}", filter.sample_cte),
            Vec::new(),
        );
        let mut statement = self.conn.prepare(&composed.sql)?;
        let rows = statement.query_map(params_from_iter(composed.params.iter()), |row| {
            row.get::<_, SampleId>(0)
        })?;
        let mut set = RoaringTreemap::new();
        for row in rows {
            set.insert(row? as u64);
        }
        Ok(set)
    }

    // ------------- Bin cache -------------

    pub fn cached_default_bins(
        &self,
        term_id: &str,
        filter_fingerprint: u64,
    ) -> Result<Option<Arc<Vec<Bin>>>> {
        let cache = self
            .bin_cache
            .lock()
            .map_err(|e| PhenoqueryError::Lock(e.to_string()))?;
        Ok(cache.get(term_id, filter_fingerprint))
    }

    pub fn cache_default_bins(
        &self,
        term_id: &str,
        filter_fingerprint: u64,
        bins: Vec<Bin>,
    ) -> Result<Arc<Vec<Bin>>> {
        let mut cache = self
            .bin_cache
            .lock()
            .map_err(|e| PhenoqueryError::Lock(e.to_string()))?;
        Ok(cache.keep(term_id, filter_fingerprint, bins))
    }

    /// Drop any cached bins for a term, e.g. after its annotations change.
    pub fn invalidate_bins(&self, term_id: &str) -> Result<()> {
        let mut cache = self
            .bin_cache
            .lock()
            .map_err(|e| PhenoqueryError::Lock(e.to_string()))?;
        cache.invalidate_term(term_id);
        Ok(())
    }
}
