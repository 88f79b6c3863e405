use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{GradingError, Result};
use crate::models::{
    EvaluationRecord, EvaluationType, Semester, StudentAnnualResult, Subject, SubjectYearAverage,
};

/// Weight applied to each evaluation type inside a semester average.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationWeights {
    pub devoir1: f64,
    pub devoir2: f64,
    pub composition: f64,
    /// Used for tags the table does not know.
    pub other: f64,
}

impl Default for EvaluationWeights {
    fn default() -> Self {
        Self {
            devoir1: 1.0,
            devoir2: 1.0,
            composition: 2.0,
            other: 1.0,
        }
    }
}

impl EvaluationWeights {
    /// Every weight must be a finite number >= 0.
    pub fn validate(&self) -> Result<()> {
        let entries = [
            ("devoir1", self.devoir1),
            ("devoir2", self.devoir2),
            ("composition", self.composition),
            ("other", self.other),
        ];
        for (name, weight) in entries {
            if !weight.is_finite() || weight < 0.0 {
                return Err(GradingError::InvalidRule(format!(
                    "weight `{name}` is {weight}, expected a finite value >= 0"
                )));
            }
        }
        Ok(())
    }

    pub fn weight_for(&self, evaluation_type: &EvaluationType) -> f64 {
        match evaluation_type {
            EvaluationType::Devoir1 => self.devoir1,
            EvaluationType::Devoir2 => self.devoir2,
            EvaluationType::Composition => self.composition,
            EvaluationType::Other(_) => self.other,
        }
    }
}

impl fmt::Display for EvaluationWeights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "devoir1 {}, devoir2 {}, composition {}, other {}",
            self.devoir1, self.devoir2, self.composition, self.other
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SemesterTally {
    pub graded: usize,
    pub missing: usize,
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Weighted mean of one student's records for one subject and semester.
///
/// Records scored 0 are absences and are skipped. Returns `None` when
/// nothing gradable remains.
pub fn compute_semester_average(
    records: &[EvaluationRecord],
    weights: &EvaluationWeights,
) -> Option<f64> {
    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;

    for record in records.iter().filter(|record| record.is_graded()) {
        let weight = weights.weight_for(&record.evaluation_type) * record.record_coefficient;
        weighted_sum += record.score * weight;
        total_weight += weight;
    }

    if total_weight > 0.0 {
        Some(weighted_sum / total_weight).filter(|average| average.is_finite())
    } else {
        None
    }
}

pub fn semester_tally(records: &[EvaluationRecord]) -> SemesterTally {
    records
        .iter()
        .fold(SemesterTally::default(), |mut tally, record| {
            if record.is_graded() {
                tally.graded += 1;
            } else {
                tally.missing += 1;
            }
            tally
        })
}

/// Semesters weigh equally; a lone semester carries over unchanged.
pub fn compute_annual_subject_average(s1: Option<f64>, s2: Option<f64>) -> Option<f64> {
    match (s1, s2) {
        (Some(a), Some(b)) => Some((a + b) / 2.0),
        (Some(a), None) | (None, Some(a)) => Some(a),
        (None, None) => None,
    }
}

pub fn compute_general_average(subject_averages: &[SubjectYearAverage]) -> Option<f64> {
    let mut weighted_sum = 0.0;
    let mut total_coefficient = 0.0;

    for subject in subject_averages {
        let Some(average) = subject.annual_average else {
            continue;
        };
        if !average.is_finite() || !subject.coefficient.is_finite() || subject.coefficient <= 0.0 {
            continue;
        }
        weighted_sum += average * subject.coefficient;
        total_coefficient += subject.coefficient;
    }

    if total_coefficient > 0.0 {
        Some(round2(weighted_sum / total_coefficient))
    } else {
        None
    }
}

pub fn subject_year_average(
    subject: &Subject,
    records: &[EvaluationRecord],
    weights: &EvaluationWeights,
) -> SubjectYearAverage {
    let (first, second): (Vec<EvaluationRecord>, Vec<EvaluationRecord>) = records
        .iter()
        .cloned()
        .partition(|record| record.semester == Semester::First);

    let semester1 = compute_semester_average(&first, weights);
    let semester2 = compute_semester_average(&second, weights);
    let annual = compute_annual_subject_average(semester1, semester2);

    SubjectYearAverage {
        subject_id: subject.id,
        subject_name: subject.name.clone(),
        coefficient: subject.coefficient,
        semester1_average: semester1.map(round2),
        semester2_average: semester2.map(round2),
        annual_average: annual.map(round2),
    }
}

/// Builds a student's year result from their raw records and the subject
/// catalog. Every catalog subject is listed; subjects graded but absent from
/// the catalog are appended with coefficient 1.
pub fn build_annual_result(
    student_id: i64,
    school_year_id: i64,
    records: &[EvaluationRecord],
    subjects: &[Subject],
    weights: &EvaluationWeights,
) -> StudentAnnualResult {
    let mut by_subject: BTreeMap<i64, Vec<EvaluationRecord>> = BTreeMap::new();
    for record in records {
        if record.student_id != student_id || record.school_year_id != school_year_id {
            continue;
        }
        by_subject
            .entry(record.subject_id)
            .or_default()
            .push(record.clone());
    }

    let mut subject_averages = Vec::with_capacity(subjects.len());
    for subject in subjects {
        let subject_records = by_subject.remove(&subject.id).unwrap_or_default();
        subject_averages.push(subject_year_average(subject, &subject_records, weights));
    }

    for (subject_id, subject_records) in by_subject {
        warn!(student_id, subject_id, "evaluations reference a subject missing from the catalog");
        let placeholder = Subject {
            id: subject_id,
            name: format!("Subject #{subject_id}"),
            coefficient: 1.0,
        };
        subject_averages.push(subject_year_average(&placeholder, &subject_records, weights));
    }

    let general_average = compute_general_average(&subject_averages);
    debug!(student_id, school_year_id, ?general_average, "computed annual result");

    StudentAnnualResult {
        student_id,
        school_year_id,
        subject_averages,
        general_average,
    }
}

/// One result per school year the records cover, oldest first. No records,
/// no results.
pub fn annual_results(
    student_id: i64,
    records: &[EvaluationRecord],
    subjects: &[Subject],
    weights: &EvaluationWeights,
) -> Vec<StudentAnnualResult> {
    let years: BTreeSet<i64> = records
        .iter()
        .filter(|record| record.student_id == student_id)
        .map(|record| record.school_year_id)
        .collect();

    years
        .into_iter()
        .map(|school_year_id| {
            build_annual_result(student_id, school_year_id, records, subjects, weights)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(
        subject_id: i64,
        semester: Semester,
        evaluation_type: EvaluationType,
        score: f64,
    ) -> EvaluationRecord {
        EvaluationRecord {
            student_id: 1,
            subject_id,
            course_id: 10,
            school_year_id: 2025,
            semester,
            evaluation_type,
            score,
            record_coefficient: 1.0,
        }
    }

    fn subject(id: i64, name: &str, coefficient: f64) -> Subject {
        Subject {
            id,
            name: name.to_string(),
            coefficient,
        }
    }

    fn year_average(annual: Option<f64>, coefficient: f64) -> SubjectYearAverage {
        SubjectYearAverage {
            subject_id: 1,
            subject_name: "Maths".to_string(),
            coefficient,
            semester1_average: annual,
            semester2_average: None,
            annual_average: annual,
        }
    }

    #[test]
    fn composition_weighs_double() {
        let records = vec![
            record(1, Semester::First, EvaluationType::Devoir1, 10.0),
            record(1, Semester::First, EvaluationType::Devoir2, 12.0),
            record(1, Semester::First, EvaluationType::Composition, 14.0),
        ];
        let average = compute_semester_average(&records, &EvaluationWeights::default()).unwrap();
        assert!((average - 12.5).abs() < 1e-9);
    }

    #[test]
    fn semester_average_ignores_input_order() {
        let mut records = vec![
            record(1, Semester::First, EvaluationType::Devoir1, 7.25),
            record(1, Semester::First, EvaluationType::Composition, 18.5),
            record(1, Semester::First, EvaluationType::Devoir2, 11.0),
        ];
        let weights = EvaluationWeights::default();
        let forward = compute_semester_average(&records, &weights).unwrap();
        assert_eq!(compute_semester_average(&records, &weights), Some(forward));
        records.reverse();
        let reversed = compute_semester_average(&records, &weights).unwrap();
        assert!((forward - reversed).abs() < 1e-9);
    }

    #[test]
    fn zero_scores_never_average_to_zero() {
        let records = vec![
            record(1, Semester::First, EvaluationType::Devoir1, 0.0),
            record(1, Semester::First, EvaluationType::Composition, 0.0),
        ];
        assert_eq!(compute_semester_average(&records, &EvaluationWeights::default()), None);
        assert_eq!(compute_semester_average(&[], &EvaluationWeights::default()), None);
    }

    #[test]
    fn zero_scores_are_excluded_from_the_mean() {
        let records = vec![
            record(1, Semester::First, EvaluationType::Devoir1, 0.0),
            record(1, Semester::First, EvaluationType::Devoir2, 14.0),
        ];
        assert_eq!(
            compute_semester_average(&records, &EvaluationWeights::default()),
            Some(14.0)
        );
        assert_eq!(
            semester_tally(&records),
            SemesterTally {
                graded: 1,
                missing: 1
            }
        );
    }

    #[test]
    fn unknown_types_and_record_coefficients_combine() {
        let mut quiz = record(1, Semester::First, EvaluationType::Other("interro".into()), 8.0);
        quiz.record_coefficient = 3.0;
        let exam = record(1, Semester::First, EvaluationType::Composition, 18.0);
        let average =
            compute_semester_average(&[quiz, exam], &EvaluationWeights::default()).unwrap();
        // (8*3 + 18*2) / 5
        assert!((average - 12.0).abs() < 1e-9);
    }

    #[test]
    fn zero_weight_records_yield_none() {
        let mut only = record(1, Semester::First, EvaluationType::Devoir1, 12.0);
        only.record_coefficient = 0.0;
        assert_eq!(compute_semester_average(&[only], &EvaluationWeights::default()), None);
    }

    #[test]
    fn huge_coefficients_stay_finite() {
        let mut heavy = record(1, Semester::First, EvaluationType::Devoir1, 3.0);
        heavy.record_coefficient = 1e300;
        let light = record(1, Semester::First, EvaluationType::Composition, 18.0);
        let average =
            compute_semester_average(&[heavy, light], &EvaluationWeights::default()).unwrap();
        assert!(average.is_finite());
        assert!((average - 3.0).abs() < 1e-9);
    }

    #[test]
    fn infinite_weight_cannot_produce_nan_average() {
        let mut broken = record(1, Semester::First, EvaluationType::Devoir1, 3.0);
        broken.record_coefficient = f64::INFINITY;
        assert_eq!(
            compute_semester_average(&[broken], &EvaluationWeights::default()),
            None
        );
    }

    #[test]
    fn non_finite_subject_coefficients_are_skipped() {
        let subjects = vec![
            year_average(Some(3.0), f64::INFINITY),
            year_average(Some(12.0), 2.0),
            year_average(Some(f64::NAN), 1.0),
        ];
        assert_eq!(compute_general_average(&subjects), Some(12.0));
        assert_eq!(
            compute_general_average(&[year_average(Some(3.0), f64::INFINITY)]),
            None
        );
    }

    #[test]
    fn weight_table_rejects_non_finite_or_negative_weights() {
        assert!(EvaluationWeights::default().validate().is_ok());
        for bad in [f64::INFINITY, f64::NAN, -2.0] {
            let weights = EvaluationWeights {
                composition: bad,
                ..EvaluationWeights::default()
            };
            assert!(matches!(weights.validate(), Err(GradingError::InvalidRule(_))));
        }
    }

    #[test]
    fn annual_results_cover_only_graded_years() {
        let mut older = record(1, Semester::First, EvaluationType::Devoir1, 9.0);
        older.school_year_id = 2024;
        let records = vec![
            record(1, Semester::First, EvaluationType::Devoir1, 12.0),
            older,
        ];
        let subjects = [subject(1, "Maths", 4.0)];
        let weights = EvaluationWeights::default();

        let results = annual_results(1, &records, &subjects, &weights);
        let years: Vec<i64> = results.iter().map(|result| result.school_year_id).collect();
        assert_eq!(years, vec![2024, 2025]);
        assert_eq!(results[0].general_average, Some(9.0));

        assert!(annual_results(1, &[], &subjects, &weights).is_empty());
        assert!(annual_results(2, &records, &subjects, &weights).is_empty());
    }

    #[test]
    fn duplicates_all_count() {
        let records = vec![
            record(1, Semester::First, EvaluationType::Devoir1, 10.0),
            record(1, Semester::First, EvaluationType::Devoir1, 16.0),
            record(1, Semester::First, EvaluationType::Devoir1, 16.0),
        ];
        assert_eq!(
            compute_semester_average(&records, &EvaluationWeights::default()),
            Some(14.0)
        );
    }

    #[test]
    fn annual_subject_average_rules() {
        assert_eq!(compute_annual_subject_average(Some(12.0), None), Some(12.0));
        assert_eq!(compute_annual_subject_average(None, Some(9.5)), Some(9.5));
        assert_eq!(compute_annual_subject_average(Some(10.0), Some(14.0)), Some(12.0));
        assert_eq!(compute_annual_subject_average(None, None), None);
    }

    #[test]
    fn general_average_is_coefficient_weighted() {
        let subjects = vec![year_average(Some(16.0), 4.0), year_average(Some(10.0), 2.0)];
        assert_eq!(compute_general_average(&subjects), Some(14.0));
    }

    #[test]
    fn general_average_skips_ungraded_and_zero_coefficient_subjects() {
        let subjects = vec![
            year_average(Some(11.0), 3.0),
            year_average(None, 5.0),
            year_average(Some(2.0), 0.0),
        ];
        assert_eq!(compute_general_average(&subjects), Some(11.0));
        assert_eq!(compute_general_average(&[year_average(None, 2.0)]), None);
        assert_eq!(compute_general_average(&[]), None);
    }

    #[test]
    fn general_average_rounds_to_two_decimals() {
        let subjects = vec![year_average(Some(10.0), 1.0), year_average(Some(11.0), 2.0)];
        assert_eq!(compute_general_average(&subjects), Some(10.67));
    }

    #[test]
    fn math_with_only_first_semester_devoirs() {
        let records = vec![
            record(1, Semester::First, EvaluationType::Devoir1, 16.0),
            record(1, Semester::First, EvaluationType::Devoir2, 14.0),
        ];
        let result = build_annual_result(
            1,
            2025,
            &records,
            &[subject(1, "Maths", 4.0)],
            &EvaluationWeights::default(),
        );
        let maths = &result.subject_averages[0];
        assert_eq!(maths.semester1_average, Some(15.0));
        assert_eq!(maths.semester2_average, None);
        assert_eq!(maths.annual_average, Some(15.0));
        assert_eq!(result.general_average, Some(15.0));
    }

    #[test]
    fn annual_result_filters_foreign_rows_and_keeps_unknown_subjects() {
        let mut other_student = record(1, Semester::First, EvaluationType::Devoir1, 2.0);
        other_student.student_id = 99;
        let mut other_year = record(1, Semester::Second, EvaluationType::Devoir1, 2.0);
        other_year.school_year_id = 2024;

        let records = vec![
            record(1, Semester::First, EvaluationType::Devoir1, 12.0),
            record(1, Semester::Second, EvaluationType::Devoir1, 14.0),
            record(5, Semester::First, EvaluationType::Devoir1, 8.0),
            other_student,
            other_year,
        ];
        let result = build_annual_result(
            1,
            2025,
            &records,
            &[subject(1, "Maths", 3.0), subject(2, "Histoire", 2.0)],
            &EvaluationWeights::default(),
        );

        assert_eq!(result.subject_averages.len(), 3);
        assert_eq!(result.subject_averages[0].annual_average, Some(13.0));
        assert_eq!(result.subject_averages[1].annual_average, None);
        assert_eq!(result.subject_averages[2].subject_name, "Subject #5");
        // (13*3 + 8*1) / 4
        assert_eq!(result.general_average, Some(11.75));
    }

    #[test]
    fn student_without_grades_has_no_general_average() {
        let records = vec![record(1, Semester::First, EvaluationType::Devoir1, 0.0)];
        let result = build_annual_result(
            1,
            2025,
            &records,
            &[subject(1, "Maths", 4.0)],
            &EvaluationWeights::default(),
        );
        assert_eq!(result.general_average, None);
    }
}
