//! Phenoquery – a term-oriented query compilation engine.
//!
//! Phenoquery translates a declarative description of clinical/phenotype
//! variables ("terms"), their requested transformations (binning, grouping,
//! restriction), and a boolean filter tree into executable relational
//! queries against a normalized annotation store, then assembles the
//! per-term results into a single sample-keyed matrix.
//!
//! * A [`term::Term`] is an immutable variable definition with a fixed
//!   [`term::TermKind`] (categorical, continuous, discrete, four condition
//!   variants, date, sample-list, term-collection).
//! * A [`term::TermWrapper`] pairs a term with per-request
//!   [`term::QueryModifiers`].
//! * A [`fragment::Fragment`] is a named, parameterized query unit producing
//!   `(sample, key, value)` rows; fragments for different terms are
//!   independent and join purely by sample identity.
//! * [`matrix::get_matrix`] compiles the filter once, emits one fragment per
//!   term, executes one statement per term joined to the shared
//!   included-sample set, and reshapes rows into the
//!   [`matrix::MatrixResponse`].
//!
//! ## Modules
//! * [`term`] – terms, wrappers, modifiers and the dataset-level registry.
//! * [`bins`] – the binning engine and its per-filter-fingerprint cache.
//! * [`fragment`] – structured `(text, params)` fragment builder.
//! * [`filter`] – the boolean filter tree and its compiler.
//! * [`generators`] – fragment generators for the non-condition kinds.
//! * [`condition`] – grade/time-to-event condition kind generators.
//! * [`matrix`] – query orchestration and matrix assembly.
//! * [`store`] – SQLite dataset handle, schema and seeding helpers.
//! * [`interface`] – threaded request runner with cooperative cancellation.
//!
//! ## Quick Start
//! ```
//! use phenoquery::matrix::{self, MatrixRequest};
//! use phenoquery::store::Dataset;
//! use phenoquery::term::{Term, TermKind, TermMeta, TermWrapper, QueryModifiers};
//!
//! let mut dataset = Dataset::open_in_memory().unwrap();
//! dataset
//!     .add_term(Term::new("sex", "Sex", TermKind::Categorical, TermMeta::default()))
//!     .unwrap();
//! let sample = dataset.add_sample("s1", None, None).unwrap();
//! dataset.annotate_categorical(sample, "sex", "F").unwrap();
//! let request = MatrixRequest {
//!     terms: vec![TermWrapper { id: "sex".into(), q: QueryModifiers::default() }],
//!     filter: None,
//!     active_cohort: None,
//! };
//! let response = matrix::get_matrix(&dataset, &request, None).unwrap();
//! assert_eq!(response.samples[&sample]["sex"].key, "F");
//! ```

pub mod bins;
pub mod condition;
pub mod error;
pub mod filter;
pub mod fragment;
pub mod generators;
pub mod interface;
pub mod matrix;
pub mod store;
pub mod term;
