use serde_json::json;

use phenoquery::error::PhenoqueryError;
use phenoquery::matrix::{self, MatrixRequest};
use phenoquery::store::Dataset;
use phenoquery::term::{QueryModifiers, SampleId, Term, TermKind, TermWrapper};

// s1 has a qualifying event, s2 only low grades (censored), s3 dies without
// a qualifying event, s4 only reports the uncomputable grade 9.
fn setup(kind: TermKind) -> (Dataset, Vec<SampleId>) {
    let mut dataset = Dataset::open_in_memory().expect("dataset");
    dataset
        .add_term(Term::new(
            "heart_failure",
            "Heart failure",
            kind,
            serde_json::from_value(json!({ "max_grade": 5 })).expect("meta"),
        ))
        .expect("term");
    let s1 = dataset.add_sample("s1", Some(5.0), Some(20.0)).expect("sample");
    let s2 = dataset.add_sample("s2", Some(6.0), Some(18.0)).expect("sample");
    let s3 = dataset.add_sample("s3", Some(8.0), Some(25.0)).expect("sample");
    let s4 = dataset.add_sample("s4", Some(7.0), Some(22.0)).expect("sample");
    for (sample, grade, age, years) in [
        (s1, 1, 8.0, 1.0),
        (s1, 3, 12.0, 2.0),
        (s2, 1, 10.0, 1.5),
        (s2, 2, 14.0, 3.0),
        (s3, 5, 16.0, 4.0),
        (s4, 9, 9.0, 2.0),
    ] {
        dataset
            .add_condition_event(sample, "heart_failure", grade, age, years)
            .expect("event");
    }
    (dataset, vec![s1, s2, s3, s4])
}

fn request(breaks: Vec<f64>) -> MatrixRequest {
    MatrixRequest {
        terms: vec![TermWrapper {
            id: "heart_failure".into(),
            q: QueryModifiers {
                breaks: Some(breaks),
                ..QueryModifiers::default()
            },
        }],
        filter: None,
        active_cohort: None,
    }
}

#[test]
fn cuminc_assigns_event_competing_and_censored_statuses() {
    let (dataset, s) = setup(TermKind::ConditionCuminc);
    let response = matrix::get_matrix(&dataset, &request(vec![3.0]), None).expect("matrix");

    // s1: first grade >= 3 event at 2.0 years
    assert_eq!(response.samples[&s[0]]["heart_failure"].key, "1");
    assert_eq!(response.samples[&s[0]]["heart_failure"].value, json!(2.0));
    // s2: never reaches grade 3, censored at the last computable event
    assert_eq!(response.samples[&s[1]]["heart_failure"].key, "0");
    assert_eq!(response.samples[&s[1]]["heart_failure"].value, json!(3.0));
    // s3: dies without a qualifying event, the competing risk
    assert_eq!(response.samples[&s[2]]["heart_failure"].key, "2");
    assert_eq!(response.samples[&s[2]]["heart_failure"].value, json!(4.0));
    // s4: no computable event time at all
    assert!(!response.samples.contains_key(&s[3]));

    let labels = response.references["heart_failure"]
        .event_labels
        .as_ref()
        .expect("event labels");
    assert_eq!(labels[&0], "censored");
    assert!(labels[&1].contains("grade 3-4"));
    assert_eq!(labels[&2], "death (competing risk)");
}

#[test]
fn cuminc_at_the_death_cutoff_has_no_competing_risk() {
    let (dataset, s) = setup(TermKind::ConditionCuminc);
    let response = matrix::get_matrix(&dataset, &request(vec![5.0]), None).expect("matrix");
    // death itself is now the event of interest
    assert_eq!(response.samples[&s[2]]["heart_failure"].key, "1");
    assert_eq!(response.samples[&s[2]]["heart_failure"].value, json!(4.0));
    // a grade-3 event no longer qualifies
    assert_eq!(response.samples[&s[0]]["heart_failure"].key, "0");
    let labels = response.references["heart_failure"]
        .event_labels
        .as_ref()
        .expect("event labels");
    assert!(
        !labels.contains_key(&2),
        "no competing-risk status when the cutoff is death"
    );
}

#[test]
fn cuminc_requires_a_single_grade_cutoff() {
    let (dataset, _) = setup(TermKind::ConditionCuminc);
    for breaks in [vec![], vec![2.0, 4.0], vec![3.5]] {
        let outcome = matrix::get_matrix(&dataset, &request(breaks.clone()), None);
        assert!(
            matches!(outcome, Err(PhenoqueryError::CallerInput(_))),
            "breaks {:?} must be rejected",
            breaks
        );
    }
}

#[test]
fn cox_reports_follow_up_windows_against_cohort_ages() {
    let (dataset, s) = setup(TermKind::ConditionCox);
    let response = matrix::get_matrix(&dataset, &request(vec![3.0]), None).expect("matrix");

    // s1: qualifying event at age 12, inside the follow-up window
    assert_eq!(response.samples[&s[0]]["heart_failure"].key, "1");
    assert_eq!(
        response.samples[&s[0]]["heart_failure"].value,
        json!({ "age_start": 5.0, "age_end": 12.0 })
    );
    // s2: no qualifying event, censored at last follow-up
    assert_eq!(response.samples[&s[1]]["heart_failure"].key, "0");
    assert_eq!(
        response.samples[&s[1]]["heart_failure"].value,
        json!({ "age_start": 6.0, "age_end": 18.0 })
    );
    // s3: death at 16 qualifies as an event
    assert_eq!(response.samples[&s[2]]["heart_failure"].key, "1");
    // s4: grade 9 never qualifies, censored
    assert_eq!(response.samples[&s[3]]["heart_failure"].key, "0");

    let labels = response.references["heart_failure"]
        .event_labels
        .as_ref()
        .expect("event labels");
    assert_eq!(labels[&0], "censored");
    assert!(labels[&1].contains("grade 3-5"));
    assert_eq!(labels[&-1], "event before cohort entry");
}

#[test]
fn cox_flags_events_before_cohort_entry() {
    let (dataset, _) = setup(TermKind::ConditionCox);
    let early = dataset.add_sample("s5", Some(10.0), Some(30.0)).expect("sample");
    dataset
        .add_condition_event(early, "heart_failure", 4, 6.0, 1.0)
        .expect("event");
    let response = matrix::get_matrix(&dataset, &request(vec![3.0]), None).expect("matrix");
    assert_eq!(
        response.samples[&early]["heart_failure"].key, "-1",
        "an event graded before cohort entry is flagged, not silently dropped"
    );
}
