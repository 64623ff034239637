use roaring::RoaringTreemap;
use serde_json::json;

use phenoquery::error::PhenoqueryError;
use phenoquery::filter::{self, Filter};
use phenoquery::store::Dataset;
use phenoquery::term::{SampleId, Term, TermKind, TermMeta};

fn setup() -> (Dataset, Vec<SampleId>) {
    let mut dataset = Dataset::open_in_memory().expect("dataset");
    dataset
        .add_term(Term::new(
            "sex",
            "Sex",
            TermKind::Categorical,
            serde_json::from_value(json!({
                "values": {
                    "F": { "label": "Female" },
                    "M": { "label": "Male" }
                },
                "group_sets": {
                    "by_exposure": {
                        "survivors": ["F"]
                    }
                }
            }))
            .expect("meta"),
        ))
        .expect("term");
    dataset
        .add_term(Term::new("age", "Age", TermKind::Continuous, TermMeta::default()))
        .expect("term");
    let mut samples = Vec::new();
    for (name, sex, age) in [
        ("s1", "F", 10.0),
        ("s2", "F", 20.0),
        ("s3", "M", 30.0),
        ("s4", "M", 40.0),
    ] {
        let id = dataset.add_sample(name, None, None).expect("sample");
        dataset.annotate_categorical(id, "sex", sex).expect("anno");
        dataset.annotate_numeric(id, "age", age).expect("anno");
        samples.push(id);
    }
    (dataset, samples)
}

fn included(dataset: &Dataset, filter: &Filter) -> RoaringTreemap {
    let compiled = filter::compile(Some(filter), Some("survivors"), dataset.registry())
        .expect("compile")
        .expect("restriction present");
    dataset.included_samples(&compiled).expect("execute")
}

fn leaf(value: serde_json::Value) -> Filter {
    serde_json::from_value(value).expect("filter json")
}

#[test]
fn and_is_intersection_or_is_union() {
    let (dataset, s) = setup();
    let females = leaf(json!({ "term": "sex", "values": ["F"] }));
    let young = leaf(json!({ "term": "age", "ranges": [{ "stop": 25.0 }] }));
    let set_f = included(&dataset, &females);
    let set_y = included(&dataset, &young);
    assert_eq!(set_f.iter().collect::<Vec<_>>(), vec![s[0] as u64, s[1] as u64]);
    assert_eq!(
        set_y.iter().collect::<Vec<_>>(),
        vec![s[0] as u64, s[1] as u64],
        "ages 10 and 20 are below 25"
    );

    let both = leaf(json!({ "op": "and", "children": [
        { "term": "sex", "values": ["F"] },
        { "term": "age", "ranges": [{ "start": 15.0 }] }
    ]}));
    let either = leaf(json!({ "op": "or", "children": [
        { "term": "sex", "values": ["F"] },
        { "term": "age", "ranges": [{ "start": 35.0 }] }
    ]}));
    let olders = included(&dataset, &leaf(json!({ "term": "age", "ranges": [{ "start": 15.0 }] })));
    let oldest = included(&dataset, &leaf(json!({ "term": "age", "ranges": [{ "start": 35.0 }] })));
    assert_eq!(included(&dataset, &both), &set_f & &olders, "AND intersects children");
    assert_eq!(included(&dataset, &either), &set_f | &oldest, "OR unions children");
}

#[test]
fn filtering_is_idempotent() {
    let (dataset, _) = setup();
    let filter = leaf(json!({ "op": "and", "children": [
        { "term": "sex", "values": ["M"] },
        { "term": "age", "ranges": [{ "start": 25.0, "stop": 35.0, "stop_inclusive": true }] }
    ]}));
    let first = included(&dataset, &filter);
    let second = included(&dataset, &filter);
    assert_eq!(first, second, "same filter over same state yields same samples");
}

#[test]
fn negated_value_set_is_the_complement_within_the_pool() {
    let (dataset, _) = setup();
    let positive = included(&dataset, &leaf(json!({ "term": "sex", "values": ["F"] })));
    let negative = included(
        &dataset,
        &leaf(json!({ "term": "sex", "values": ["F"], "is_not": true })),
    );
    let pool = dataset.all_samples().expect("samples");
    assert_eq!(&positive | &negative, pool, "positive and negative partition the pool");
    assert!((&positive & &negative).is_empty(), "no sample matches both");
}

#[test]
fn empty_value_set_matches_nothing() {
    let (dataset, _) = setup();
    let none = included(&dataset, &leaf(json!({ "term": "sex", "values": [] })));
    assert!(none.is_empty(), "empty value-set short-circuits to no samples");
}

#[test]
fn empty_filter_is_an_explicit_absence() {
    let (dataset, _) = setup();
    let compiled = filter::compile(None, None, dataset.registry()).expect("compile");
    assert!(compiled.is_none(), "no filter means no restriction");
    let hollow = leaf(json!({ "op": "and", "children": [] }));
    let compiled = filter::compile(Some(&hollow), None, dataset.registry()).expect("compile");
    assert!(compiled.is_none(), "a tree without leaves means no restriction");
}

#[test]
fn negated_range_clause_splits_around_the_range() {
    let (dataset, s) = setup();
    let outside = included(
        &dataset,
        &leaf(json!({ "term": "age", "ranges": [
            { "start": 15.0, "stop": 35.0, "start_inclusive": true, "stop_inclusive": true, "is_not": true }
        ]})),
    );
    assert_eq!(
        outside.iter().collect::<Vec<_>>(),
        vec![s[0] as u64, s[3] as u64],
        "only ages 10 and 40 fall outside [15, 35]"
    );
}

#[test]
fn group_set_requires_the_active_cohort_mapping() {
    let (dataset, s) = setup();
    let filter = leaf(json!({ "term": "sex", "groupset": "by_exposure" }));
    let resolved = included(&dataset, &filter);
    assert_eq!(resolved.iter().collect::<Vec<_>>(), vec![s[0] as u64, s[1] as u64]);

    let missing = filter::compile(Some(&filter), Some("controls"), dataset.registry());
    assert!(
        matches!(missing, Err(PhenoqueryError::Config(_))),
        "a missing cohort mapping is a hard configuration error"
    );
    let absent = filter::compile(Some(&filter), None, dataset.registry());
    assert!(matches!(absent, Err(PhenoqueryError::Config(_))));
}

#[test]
fn fingerprints_distinguish_filters() {
    let a = leaf(json!({ "term": "sex", "values": ["F"] }));
    let b = leaf(json!({ "term": "sex", "values": ["M"] }));
    let fp_none = filter::filter_fingerprint(None).expect("fingerprint");
    let fp_a = filter::filter_fingerprint(Some(&a)).expect("fingerprint");
    let fp_b = filter::filter_fingerprint(Some(&b)).expect("fingerprint");
    assert_eq!(fp_none, 0);
    assert_ne!(fp_a, fp_b, "different filters fingerprint differently");
    assert_eq!(
        fp_a,
        filter::filter_fingerprint(Some(&a)).expect("fingerprint"),
        "fingerprinting is stable"
    );
}
