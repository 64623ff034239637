//! Thin command-line front end: reads configuration, opens the dataset and
//! executes one matrix request from a JSON file, printing the matrix and its
//! references as JSON. The HTTP/route layer is an external collaborator; this
//! binary exists for local inspection and dataset debugging.

use std::env;
use std::fs;

use tracing_subscriber::EnvFilter;

use phenoquery::matrix::{self, MatrixRequest};
use phenoquery::store::Dataset;

fn main() {
    if let Err(e) = run() {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name("phenoquery").required(false))
        .add_source(config::Environment::with_prefix("PHENOQUERY"))
        .build()?;
    let log_level = settings
        .get_string("log_level")
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let Some(request_path) = env::args().nth(1) else {
        eprintln!("usage: phenoquery <request.json>");
        std::process::exit(2);
    };
    let database = settings
        .get_string("database")
        .unwrap_or_else(|_| ":memory:".to_string());
    let dataset = if database == ":memory:" {
        Dataset::open_in_memory()?
    } else {
        Dataset::open(&database)?
    };
    tracing::info!(database = %database, terms = dataset.registry().len(), "dataset opened");

    let request: MatrixRequest = serde_json::from_str(&fs::read_to_string(&request_path)?)?;
    let response = matrix::get_matrix(&dataset, &request, None)?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
