use serde::Serialize;
use tracing::debug;

use crate::models::{ClassInfo, EnrollmentStatus, Level, PromotionRule, StudentAnnualResult};

/// Registry snapshot the evaluator places a promoted student with.
#[derive(Debug, Clone, Copy)]
pub struct Placement<'a> {
    pub current_class: &'a ClassInfo,
    /// Every class open for the target year, in registry order.
    pub classes: &'a [ClassInfo],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Destination {
    Class(ClassInfo),
    /// The current level has no successor.
    Graduation,
    /// Promoted, but nowhere to place the student. Needs manual intervention.
    NoDestinationClass { next_level: Option<Level> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HoldReason {
    BelowMinimum { minimum: f64 },
    EnrollmentStatus {
        actual: EnrollmentStatus,
        required: EnrollmentStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PromotionDecision {
    Promoted {
        general_average: f64,
        destination: Destination,
    },
    HeldBack {
        general_average: f64,
        reason: HoldReason,
    },
    /// No gradable evaluations at all. Distinct from being held back.
    NotEvaluable,
}

impl PromotionDecision {
    pub fn label(&self) -> &'static str {
        match self {
            PromotionDecision::Promoted { .. } => "promoted",
            PromotionDecision::HeldBack { .. } => "held back",
            PromotionDecision::NotEvaluable => "not evaluable",
        }
    }

    pub fn destination_class(&self) -> Option<&ClassInfo> {
        match self {
            PromotionDecision::Promoted {
                destination: Destination::Class(class),
                ..
            } => Some(class),
            _ => None,
        }
    }

    pub fn needs_manual_intervention(&self) -> bool {
        matches!(
            self,
            PromotionDecision::Promoted {
                destination: Destination::NoDestinationClass { .. },
                ..
            }
        )
    }
}

pub fn evaluate_promotion(
    result: &StudentAnnualResult,
    enrollment_status: EnrollmentStatus,
    rule: &PromotionRule,
    placement: &Placement<'_>,
) -> PromotionDecision {
    let Some(general_average) = result.general_average.filter(|average| average.is_finite())
    else {
        return PromotionDecision::NotEvaluable;
    };

    if general_average < rule.minimum_average {
        return PromotionDecision::HeldBack {
            general_average,
            reason: HoldReason::BelowMinimum {
                minimum: rule.minimum_average,
            },
        };
    }

    if enrollment_status != rule.required_enrollment_status {
        return PromotionDecision::HeldBack {
            general_average,
            reason: HoldReason::EnrollmentStatus {
                actual: enrollment_status,
                required: rule.required_enrollment_status,
            },
        };
    }

    let destination = resolve_destination(placement, rule.direct_transfer);
    debug!(
        student_id = result.student_id,
        general_average,
        ?destination,
        "student promoted"
    );

    PromotionDecision::Promoted {
        general_average,
        destination,
    }
}

/// Trailing whitespace-delimited token of a class name, "A" in "6ème A".
pub fn section_letter(class_name: &str) -> Option<&str> {
    let mut tokens = class_name.split_whitespace();
    let last = tokens.next_back()?;
    // A single-token name carries no section.
    tokens.next_back().map(|_| last)
}

/// With `direct_transfer`, a next-level class matches when one of its
/// whitespace-separated name tokens equals the section letter (ignoring case).
pub fn resolve_destination(placement: &Placement<'_>, direct_transfer: bool) -> Destination {
    let Some(level) = placement.current_class.parsed_level() else {
        return Destination::NoDestinationClass { next_level: None };
    };
    let Some(next_level) = level.next() else {
        return Destination::Graduation;
    };

    let candidates: Vec<&ClassInfo> = placement
        .classes
        .iter()
        .filter(|class| class.parsed_level() == Some(next_level))
        .collect();

    let Some(first) = candidates.first() else {
        return Destination::NoDestinationClass {
            next_level: Some(next_level),
        };
    };

    // Redistribution currently takes the first open class.
    let mut chosen = *first;
    if direct_transfer {
        if let Some(section) = section_letter(&placement.current_class.name) {
            let matching = candidates.iter().find(|class| {
                class
                    .name
                    .split_whitespace()
                    .any(|token| token.eq_ignore_ascii_case(section))
            });
            if let Some(class) = matching {
                chosen = *class;
            }
        }
    }

    Destination::Class(chosen.clone())
}

/// One roster line handed to [`evaluate_class`].
#[derive(Debug, Clone)]
pub struct RosterEntry {
    pub student_id: i64,
    pub student_name: String,
    pub enrollment_id: i64,
    pub status: EnrollmentStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentOutcome {
    pub student_id: i64,
    pub student_name: String,
    pub enrollment_id: i64,
    pub result: StudentAnnualResult,
    pub decision: PromotionDecision,
}

/// Evaluates a whole class roster, one student after the other.
pub fn evaluate_class<F>(
    roster: &[RosterEntry],
    rule: &PromotionRule,
    placement: &Placement<'_>,
    mut annual_result: F,
) -> Vec<StudentOutcome>
where
    F: FnMut(&RosterEntry) -> StudentAnnualResult,
{
    roster
        .iter()
        .map(|entry| {
            let result = annual_result(entry);
            let decision = evaluate_promotion(&result, entry.status, rule, placement);
            StudentOutcome {
                student_id: entry.student_id,
                student_name: entry.student_name.clone(),
                enrollment_id: entry.enrollment_id,
                result,
                decision,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PromotionSummary {
    pub promoted: usize,
    pub held_back: usize,
    pub not_evaluable: usize,
    pub manual_intervention: usize,
}

impl PromotionSummary {
    pub fn tally(outcomes: &[StudentOutcome]) -> Self {
        let mut summary = Self::default();
        for outcome in outcomes {
            match &outcome.decision {
                PromotionDecision::Promoted { .. } => summary.promoted += 1,
                PromotionDecision::HeldBack { .. } => summary.held_back += 1,
                PromotionDecision::NotEvaluable => summary.not_evaluable += 1,
            }
            if outcome.decision.needs_manual_intervention() {
                summary.manual_intervention += 1;
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(id: i64, name: &str, level: &str) -> ClassInfo {
        ClassInfo {
            id,
            name: name.to_string(),
            level: level.to_string(),
        }
    }

    fn result_with(general_average: Option<f64>) -> StudentAnnualResult {
        StudentAnnualResult {
            student_id: 42,
            school_year_id: 2025,
            subject_averages: Vec::new(),
            general_average,
        }
    }

    fn next_year_classes() -> Vec<ClassInfo> {
        vec![
            class(10, "5ème A", "5ème"),
            class(11, "5ème B", "5ème"),
            class(12, "4ème A", "4ème"),
        ]
    }

    #[test]
    fn boundary_average_is_promoted() {
        let current = class(1, "6ème A", "6ème");
        let classes = next_year_classes();
        let placement = Placement {
            current_class: &current,
            classes: &classes,
        };
        let decision = evaluate_promotion(
            &result_with(Some(8.0)),
            EnrollmentStatus::Enrolled,
            &PromotionRule::default(),
            &placement,
        );
        assert_eq!(decision.label(), "promoted");
    }

    #[test]
    fn nan_average_is_never_promoted() {
        let current = class(1, "6ème A", "6ème");
        let classes = next_year_classes();
        let placement = Placement {
            current_class: &current,
            classes: &classes,
        };
        for average in [f64::NAN, f64::INFINITY] {
            let decision = evaluate_promotion(
                &result_with(Some(average)),
                EnrollmentStatus::Enrolled,
                &PromotionRule::default(),
                &placement,
            );
            assert_eq!(decision, PromotionDecision::NotEvaluable);
        }
    }

    #[test]
    fn infinite_coefficient_row_cannot_reach_a_promotion() {
        use crate::averaging::{build_annual_result, EvaluationWeights};
        use crate::models::{EvaluationRecord, RawEvaluation, Subject};

        let raw = RawEvaluation {
            student_id: 42,
            subject_id: 1,
            course_id: 1,
            school_year_id: 2025,
            semester: 1,
            evaluation_type: "devoir1".to_string(),
            score: 3.0,
            coefficient: Some(f64::INFINITY),
        };
        assert!(EvaluationRecord::try_from(raw).is_err());

        // Even if such a record slipped in unvalidated, the student stays unpromoted.
        let record = EvaluationRecord {
            student_id: 42,
            subject_id: 1,
            course_id: 1,
            school_year_id: 2025,
            semester: crate::models::Semester::First,
            evaluation_type: crate::models::EvaluationType::Devoir1,
            score: 3.0,
            record_coefficient: f64::INFINITY,
        };
        let subjects = [Subject::new(1, "Maths", 4.0).unwrap()];
        let result =
            build_annual_result(42, 2025, &[record], &subjects, &EvaluationWeights::default());
        assert_eq!(result.general_average, None);

        let current = class(1, "6ème A", "6ème");
        let classes = next_year_classes();
        let placement = Placement {
            current_class: &current,
            classes: &classes,
        };
        let decision = evaluate_promotion(
            &result,
            EnrollmentStatus::Enrolled,
            &PromotionRule::default(),
            &placement,
        );
        assert_eq!(decision, PromotionDecision::NotEvaluable);
    }

    #[test]
    fn section_match_is_token_based() {
        let current = class(1, "6ème A", "6ème");
        let classes = vec![class(11, "5ème Arts", "5ème"), class(10, "5ème a", "5ème")];
        let placement = Placement {
            current_class: &current,
            classes: &classes,
        };
        assert_eq!(
            resolve_destination(&placement, true),
            Destination::Class(class(10, "5ème a", "5ème"))
        );
    }

    #[test]
    fn missing_grades_are_not_evaluable() {
        let current = class(1, "6ème A", "6ème");
        let placement = Placement {
            current_class: &current,
            classes: &[],
        };
        let decision = evaluate_promotion(
            &result_with(None),
            EnrollmentStatus::Enrolled,
            &PromotionRule::default(),
            &placement,
        );
        assert_eq!(decision, PromotionDecision::NotEvaluable);
    }

    #[test]
    fn below_minimum_is_held_back_without_destination() {
        let current = class(1, "6ème A", "6ème");
        let classes = next_year_classes();
        let placement = Placement {
            current_class: &current,
            classes: &classes,
        };
        let decision = evaluate_promotion(
            &result_with(Some(7.5)),
            EnrollmentStatus::Enrolled,
            &PromotionRule::default(),
            &placement,
        );
        assert_eq!(
            decision,
            PromotionDecision::HeldBack {
                general_average: 7.5,
                reason: HoldReason::BelowMinimum { minimum: 8.0 },
            }
        );
        assert_eq!(decision.destination_class(), None);
    }

    #[test]
    fn wrong_enrollment_status_is_held_back() {
        let current = class(1, "6ème A", "6ème");
        let classes = next_year_classes();
        let placement = Placement {
            current_class: &current,
            classes: &classes,
        };
        let decision = evaluate_promotion(
            &result_with(Some(15.0)),
            EnrollmentStatus::Transferred,
            &PromotionRule::default(),
            &placement,
        );
        assert!(matches!(
            decision,
            PromotionDecision::HeldBack {
                reason: HoldReason::EnrollmentStatus {
                    actual: EnrollmentStatus::Transferred,
                    required: EnrollmentStatus::Enrolled,
                },
                ..
            }
        ));
    }

    #[test]
    fn direct_transfer_keeps_the_section_letter() {
        let current = class(1, "6ème B", "6ème");
        let classes = next_year_classes();
        let placement = Placement {
            current_class: &current,
            classes: &classes,
        };
        let decision = evaluate_promotion(
            &result_with(Some(12.0)),
            EnrollmentStatus::Enrolled,
            &PromotionRule::default(),
            &placement,
        );
        assert_eq!(decision.destination_class().map(|c| c.name.as_str()), Some("5ème B"));
    }

    #[test]
    fn direct_transfer_matches_letter_a() {
        let current = class(1, "6ème A", "6ème");
        let classes = vec![class(11, "5ème B", "5ème"), class(10, "5ème A", "5ème")];
        let placement = Placement {
            current_class: &current,
            classes: &classes,
        };
        assert_eq!(
            resolve_destination(&placement, true),
            Destination::Class(class(10, "5ème A", "5ème"))
        );
    }

    #[test]
    fn unmatched_section_falls_back_to_first_class() {
        let current = class(1, "6ème C", "6ème");
        let classes = next_year_classes();
        let placement = Placement {
            current_class: &current,
            classes: &classes,
        };
        assert_eq!(
            resolve_destination(&placement, true),
            Destination::Class(class(10, "5ème A", "5ème"))
        );
    }

    #[test]
    fn redistribution_takes_first_open_class() {
        let current = class(1, "6ème B", "6ème");
        let classes = next_year_classes();
        let placement = Placement {
            current_class: &current,
            classes: &classes,
        };
        assert_eq!(
            resolve_destination(&placement, false),
            Destination::Class(class(10, "5ème A", "5ème"))
        );
    }

    #[test]
    fn terminal_level_graduates() {
        let current = class(1, "Terminale D", "Terminale");
        let classes = next_year_classes();
        let placement = Placement {
            current_class: &current,
            classes: &classes,
        };
        assert_eq!(resolve_destination(&placement, true), Destination::Graduation);
    }

    #[test]
    fn missing_next_level_needs_manual_intervention() {
        let current = class(1, "3ème A", "3ème");
        let classes = next_year_classes();
        let placement = Placement {
            current_class: &current,
            classes: &classes,
        };
        let decision = evaluate_promotion(
            &result_with(Some(11.0)),
            EnrollmentStatus::Enrolled,
            &PromotionRule::default(),
            &placement,
        );
        assert_eq!(
            decision,
            PromotionDecision::Promoted {
                general_average: 11.0,
                destination: Destination::NoDestinationClass {
                    next_level: Some(Level::Seconde)
                },
            }
        );
        assert!(decision.needs_manual_intervention());
    }

    #[test]
    fn unknown_current_level_has_no_destination() {
        let current = class(1, "CM2 A", "CM2");
        let classes = next_year_classes();
        let placement = Placement {
            current_class: &current,
            classes: &classes,
        };
        assert_eq!(
            resolve_destination(&placement, true),
            Destination::NoDestinationClass { next_level: None }
        );
    }

    #[test]
    fn section_letter_needs_two_tokens() {
        assert_eq!(section_letter("6ème A"), Some("A"));
        assert_eq!(section_letter("  2nde  C1 "), Some("C1"));
        assert_eq!(section_letter("Terminale"), None);
        assert_eq!(section_letter(""), None);
    }

    #[test]
    fn class_evaluation_tallies_outcomes() {
        let current = class(1, "6ème A", "6ème");
        let classes = vec![class(10, "5ème A", "5ème")];
        let placement = Placement {
            current_class: &current,
            classes: &classes,
        };
        let roster: Vec<RosterEntry> = [1, 2, 3]
            .iter()
            .map(|&id| RosterEntry {
                student_id: id,
                student_name: format!("Student {id}"),
                enrollment_id: 100 + id,
                status: EnrollmentStatus::Enrolled,
            })
            .collect();
        let averages = [(1, Some(12.0)), (2, Some(6.0)), (3, None)];

        let outcomes = evaluate_class(&roster, &PromotionRule::default(), &placement, |entry| {
            let average = averages
                .iter()
                .find(|(id, _)| *id == entry.student_id)
                .and_then(|(_, average)| *average);
            StudentAnnualResult {
                student_id: entry.student_id,
                school_year_id: 2025,
                subject_averages: Vec::new(),
                general_average: average,
            }
        });

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].decision.destination_class().map(|c| c.id), Some(10));
        assert_eq!(
            PromotionSummary::tally(&outcomes),
            PromotionSummary {
                promoted: 1,
                held_back: 1,
                not_evaluable: 1,
                manual_intervention: 0,
            }
        );
    }
}
