use std::fmt::Write;

use chrono::NaiveDate;

use gradebook_promotion::models::{ActiveRule, ClassInfo};
use gradebook_promotion::promotion::{
    Destination, HoldReason, PromotionDecision, PromotionSummary, StudentOutcome,
};

pub fn format_average(value: Option<f64>) -> String {
    value
        .map(|average| format!("{average:.2}"))
        .unwrap_or_else(|| "-".to_string())
}

pub fn describe_decision(decision: &PromotionDecision) -> String {
    match decision {
        PromotionDecision::Promoted { destination, .. } => match destination {
            Destination::Class(class) => format!("promoted to {}", class.name),
            Destination::Graduation => "promoted, final level completed".to_string(),
            Destination::NoDestinationClass {
                next_level: Some(level),
            } => format!("promoted, no {level} class available (manual intervention required)"),
            Destination::NoDestinationClass { next_level: None } => {
                "promoted, current level unknown (manual intervention required)".to_string()
            }
        },
        PromotionDecision::HeldBack { reason, .. } => match reason {
            HoldReason::BelowMinimum { minimum } => {
                format!("held back, below minimum average {minimum:.2}")
            }
            HoldReason::EnrollmentStatus { actual, required } => {
                format!("held back, enrollment status {actual} (requires {required})")
            }
        },
        PromotionDecision::NotEvaluable => "not evaluable, no graded evaluations".to_string(),
    }
}

pub fn build_report(
    class: &ClassInfo,
    school_year_id: i64,
    generated_on: NaiveDate,
    active: &ActiveRule,
    outcomes: &[StudentOutcome],
) -> String {
    let summary = PromotionSummary::tally(outcomes);
    let mut output = String::new();

    let _ = writeln!(output, "# Class Bulletin: {}", class.name);
    let _ = writeln!(
        output,
        "School year {} (generated {})",
        school_year_id, generated_on
    );
    let _ = writeln!(
        output,
        "Promotion rule: minimum average {:.2}, requires {} status ({})",
        active.rule.minimum_average, active.rule.required_enrollment_status, active.provenance
    );
    let _ = writeln!(
        output,
        "Evaluation weights: {} ({})",
        active.weights, active.weights_provenance
    );
    if let Some(path) = &active.ignored_rule_file {
        let _ = writeln!(
            output,
            "Rule fields of {} were ignored in favour of the {}",
            path.display(),
            active.provenance
        );
    }
    let _ = writeln!(output);
    let _ = writeln!(output, "## Decision Mix");
    let _ = writeln!(output, "- promoted: {}", summary.promoted);
    let _ = writeln!(output, "- held back: {}", summary.held_back);
    let _ = writeln!(output, "- not evaluable: {}", summary.not_evaluable);
    let _ = writeln!(
        output,
        "- manual intervention required: {}",
        summary.manual_intervention
    );

    let _ = writeln!(output);
    let _ = writeln!(output, "## Students");

    if outcomes.is_empty() {
        let _ = writeln!(output, "No active enrollments for this class.");
    }

    for outcome in outcomes {
        let _ = writeln!(output);
        let _ = writeln!(
            output,
            "### {} (general average {})",
            outcome.student_name,
            format_average(outcome.result.general_average)
        );
        let _ = writeln!(output, "{}", describe_decision(&outcome.decision));
        let _ = writeln!(output);
        let _ = writeln!(output, "| Subject | Coef | S1 | S2 | Annual |");
        let _ = writeln!(output, "|---|---|---|---|---|");
        for subject in &outcome.result.subject_averages {
            let _ = writeln!(
                output,
                "| {} | {} | {} | {} | {} |",
                subject.subject_name,
                subject.coefficient,
                format_average(subject.semester1_average),
                format_average(subject.semester2_average),
                format_average(subject.annual_average)
            );
        }
    }

    let manual: Vec<&StudentOutcome> = outcomes
        .iter()
        .filter(|outcome| outcome.decision.needs_manual_intervention())
        .collect();

    if !manual.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Manual Intervention");
        for outcome in manual {
            let _ = writeln!(
                output,
                "- {} (student {}): {}",
                outcome.student_name,
                outcome.student_id,
                describe_decision(&outcome.decision)
            );
        }
    }

    output
}
