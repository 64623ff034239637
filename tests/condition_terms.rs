use serde_json::json;

use phenoquery::error::PhenoqueryError;
use phenoquery::matrix::{self, MatrixRequest};
use phenoquery::store::Dataset;
use phenoquery::term::{
    BarBy, QueryModifiers, Restriction, SampleId, Term, TermKind, TermWrapper,
};

// s1 peaks at grade 2, s2 peaks at grade 4 (most recent is grade 1),
// s3 only ever reports the uncomputable grade 9.
fn setup(kind: TermKind) -> (Dataset, Vec<SampleId>) {
    let mut dataset = Dataset::open_in_memory().expect("dataset");
    dataset
        .add_term(Term::new(
            "cardiomyopathy",
            "Cardiomyopathy",
            kind,
            serde_json::from_value(json!({ "max_grade": 5 })).expect("meta"),
        ))
        .expect("term");
    let s1 = dataset.add_sample("s1", Some(5.0), Some(20.0)).expect("sample");
    let s2 = dataset.add_sample("s2", Some(6.0), Some(25.0)).expect("sample");
    let s3 = dataset.add_sample("s3", Some(7.0), Some(22.0)).expect("sample");
    for (sample, grade, age, years) in [
        (s1, 1, 8.0, 3.0),
        (s1, 2, 12.0, 7.0),
        (s2, 4, 10.0, 4.0),
        (s2, 1, 15.0, 9.0),
        (s3, 9, 9.0, 2.0),
    ] {
        dataset
            .add_condition_event(sample, "cardiomyopathy", grade, age, years)
            .expect("event");
    }
    dataset.precompute_conditions().expect("precompute");
    (dataset, vec![s1, s2, s3])
}

fn request(q: QueryModifiers) -> MatrixRequest {
    MatrixRequest {
        terms: vec![TermWrapper {
            id: "cardiomyopathy".into(),
            q,
        }],
        filter: None,
        active_cohort: None,
    }
}

#[test]
fn max_grade_selects_the_peak_grade() {
    let (dataset, s) = setup(TermKind::ConditionDiscrete);
    let response = matrix::get_matrix(
        &dataset,
        &request(QueryModifiers {
            restriction: Some(Restriction::MaxGrade),
            ..QueryModifiers::default()
        }),
        None,
    )
    .expect("matrix");
    assert_eq!(response.samples[&s[0]]["cardiomyopathy"].key, "2");
    assert_eq!(response.samples[&s[1]]["cardiomyopathy"].key, "4");
    assert!(
        !response.samples.contains_key(&s[2]),
        "an all-uncomputable sample is excluded by default"
    );
}

#[test]
fn most_recent_grade_selects_by_age() {
    let (dataset, s) = setup(TermKind::ConditionDiscrete);
    let response = matrix::get_matrix(
        &dataset,
        &request(QueryModifiers {
            restriction: Some(Restriction::MostRecentGrade),
            ..QueryModifiers::default()
        }),
        None,
    )
    .expect("matrix");
    assert_eq!(response.samples[&s[0]]["cardiomyopathy"].key, "2");
    assert_eq!(
        response.samples[&s[1]]["cardiomyopathy"].key, "1",
        "the grade-1 event at age 15 postdates the grade-4 event at age 10"
    );
}

#[test]
fn computable_grade_selects_the_earliest_assessed_grade() {
    let (dataset, s) = setup(TermKind::ConditionDiscrete);
    let response = matrix::get_matrix(
        &dataset,
        &request(QueryModifiers {
            restriction: Some(Restriction::ComputableGrade),
            ..QueryModifiers::default()
        }),
        None,
    )
    .expect("matrix");
    // exactly one grade per sample, the one assessed first, regardless of
    // the order the projection rows come back in
    assert_eq!(
        response.samples[&s[0]]["cardiomyopathy"].key, "1",
        "s1's first assessment at age 8 was grade 1"
    );
    assert_eq!(
        response.samples[&s[1]]["cardiomyopathy"].key, "4",
        "s2's first assessment at age 10 was grade 4"
    );
    assert!(!response.samples.contains_key(&s[2]));
}

#[test]
fn include_uncomputable_reaches_the_grade_9_sample() {
    let (dataset, s) = setup(TermKind::ConditionDiscrete);
    let response = matrix::get_matrix(
        &dataset,
        &request(QueryModifiers {
            restriction: Some(Restriction::MaxGrade),
            include_uncomputable: true,
            ..QueryModifiers::default()
        }),
        None,
    )
    .expect("matrix");
    assert_eq!(response.samples[&s[2]]["cardiomyopathy"].key, "9");
}

#[test]
fn a_missing_restriction_policy_fails_fast() {
    let (dataset, _) = setup(TermKind::ConditionDiscrete);
    let outcome = matrix::get_matrix(&dataset, &request(QueryModifiers::default()), None);
    assert!(matches!(outcome, Err(PhenoqueryError::CallerInput(_))));
}

#[test]
fn breaks_partition_grades_into_named_groups() {
    let (dataset, s) = setup(TermKind::ConditionDiscrete);
    let response = matrix::get_matrix(
        &dataset,
        &request(QueryModifiers {
            restriction: Some(Restriction::MaxGrade),
            breaks: Some(vec![2.0]),
            ..QueryModifiers::default()
        }),
        None,
    )
    .expect("matrix");
    assert_eq!(response.samples[&s[0]]["cardiomyopathy"].key, "Grade 2-5");
    assert_eq!(response.samples[&s[1]]["cardiomyopathy"].key, "Grade 2-5");
    let groups = response.references["cardiomyopathy"]
        .groups
        .as_ref()
        .expect("group names");
    assert_eq!(groups, &["Grade 0-1".to_string(), "Grade 2-5".to_string()]);
}

#[test]
fn grouping_rejects_breaks_combined_with_children() {
    let (dataset, _) = setup(TermKind::ConditionDiscrete);
    let outcome = matrix::get_matrix(
        &dataset,
        &request(QueryModifiers {
            restriction: Some(Restriction::MaxGrade),
            breaks: Some(vec![2.0]),
            bar_by: Some(BarBy::Children),
            ..QueryModifiers::default()
        }),
        None,
    );
    assert!(matches!(outcome, Err(PhenoqueryError::CallerInput(_))));
}

#[test]
fn bar_by_children_reads_the_child_projection() {
    let (dataset, s) = setup(TermKind::ConditionDiscrete);
    dataset
        .add_condition_child(s[0], "cardiomyopathy", "dilated", true, true, true)
        .expect("child");
    dataset
        .add_condition_child(s[1], "cardiomyopathy", "restrictive", true, true, true)
        .expect("child");
    let response = matrix::get_matrix(
        &dataset,
        &request(QueryModifiers {
            restriction: Some(Restriction::MaxGrade),
            bar_by: Some(BarBy::Children),
            ..QueryModifiers::default()
        }),
        None,
    )
    .expect("matrix");
    assert_eq!(response.samples[&s[0]]["cardiomyopathy"].key, "dilated");
    assert_eq!(response.samples[&s[1]]["cardiomyopathy"].key, "restrictive");
    assert!(!response.samples.contains_key(&s[2]));
}

#[test]
fn binary_splits_at_a_single_grade_cutoff() {
    let (dataset, s) = setup(TermKind::ConditionBinary);
    let response = matrix::get_matrix(
        &dataset,
        &request(QueryModifiers {
            restriction: Some(Restriction::MaxGrade),
            breaks: Some(vec![3.0]),
            ..QueryModifiers::default()
        }),
        None,
    )
    .expect("matrix");
    assert_eq!(response.samples[&s[0]]["cardiomyopathy"].key, "Grade 0-2");
    assert_eq!(response.samples[&s[1]]["cardiomyopathy"].key, "Grade 3-5");
}

#[test]
fn binary_requires_exactly_one_integer_grade_break() {
    let (dataset, _) = setup(TermKind::ConditionBinary);
    for breaks in [vec![], vec![2.0, 4.0], vec![2.5], vec![0.0], vec![6.0]] {
        let outcome = matrix::get_matrix(
            &dataset,
            &request(QueryModifiers {
                restriction: Some(Restriction::MaxGrade),
                breaks: Some(breaks.clone()),
                ..QueryModifiers::default()
            }),
            None,
        );
        assert!(
            matches!(outcome, Err(PhenoqueryError::CallerInput(_))),
            "breaks {:?} must be rejected",
            breaks
        );
    }
}
