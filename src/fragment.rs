//! Structured query fragments.
//!
//! A [`Fragment`] is a named unit of query text plus the positional parameter
//! values it requires, always producing rows shaped `(sample, key, value)`
//! (filter fragments produce bare `sample` rows). Fragments compose into one
//! statement through [`compose`], which lays them out as a WITH clause and
//! chains their parameters in text order. Caller-influenced values never end
//! up in query text, only in the parameter vector.

use rusqlite::types::Value as SqlValue;

/// One named, parameterized query unit.
#[derive(Debug, Clone)]
pub struct Fragment {
    name: String,
    sql: String,
    params: Vec<SqlValue>,
}

impl Fragment {
    pub fn new(name: impl Into<String>, sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
            params,
        }
    }
    // Immutable after construction, exposed through getters only.
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn sql(&self) -> &str {
        &self.sql
    }
    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }
}

/// Collects positional parameter values while query text is being built.
///
/// Each `push` hands back the `?` placeholder so the call site can splice it
/// into the text at exactly the position the value will bind to.
#[derive(Debug, Default)]
pub struct ParamSink {
    values: Vec<SqlValue>,
}

impl ParamSink {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn push(&mut self, value: impl Into<SqlValue>) -> &'static str {
        self.values.push(value.into());
        "?"
    }
    /// Placeholder list for an `in (...)` predicate, one `?` per value.
    pub fn push_list<I, V>(&mut self, values: I) -> String
    where
        I: IntoIterator<Item = V>,
        V: Into<SqlValue>,
    {
        let mut marks = Vec::new();
        for value in values {
            marks.push(self.push(value));
        }
        marks.join(", ")
    }
    pub fn len(&self) -> usize {
        self.values.len()
    }
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
    pub fn into_params(self) -> Vec<SqlValue> {
        self.values
    }
}

/// A fully composed statement ready for execution.
#[derive(Debug)]
pub struct ComposedQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// Lay fragments out as a WITH clause followed by `body`.
///
/// Parameter vectors are chained in the same order the fragment texts appear,
/// which is what positional binding requires. `body_params` bind last. With
/// no fragments the body stands alone.
pub fn compose(ctes: &[&Fragment], body: &str, body_params: Vec<SqlValue>) -> ComposedQuery {
    if ctes.is_empty() {
        return ComposedQuery {
            sql: body.to_string(),
            params: body_params,
        };
    }
    let mut clauses = Vec::with_capacity(ctes.len());
    let mut params = Vec::new();
    for fragment in ctes {
        clauses.push(format!("{} as (\n{}\n)", fragment.name(), fragment.sql()));
        params.extend(fragment.params().iter().cloned());
    }
    params.extend(body_params);
    ComposedQuery {
        sql: format!("with {}\n{}", clauses.join(",\n"), body),
        params,
    }
}

/// Body selecting a term fragment's rows restricted to a filtered sample set.
pub fn join_on_sample(term_cte: &str, filter_cte: &str) -> String {
    format!(
        "select {t}.sample, {t}.key, {t}.value from {t} join {f} on {f}.sample = {t}.sample",
        t = term_cte,
        f = filter_cte
    )
}

/// Body selecting a term fragment's rows with no sample restriction.
pub fn select_all(term_cte: &str) -> String {
    format!("select sample, key, value from {}", term_cte)
}
