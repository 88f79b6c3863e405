use thiserror::Error;

/// Errors raised while loading grading data or promotion rules.
///
/// Missing grades are not errors: they surface as `None` averages and end
/// up as `PromotionDecision::NotEvaluable`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GradingError {
    #[error("invalid promotion rule: {0}")]
    InvalidRule(String),

    #[error("unknown enrollment status `{0}`")]
    UnknownEnrollmentStatus(String),

    #[error("semester must be 1 or 2, got {0}")]
    InvalidSemester(i32),

    #[error("score {score} for student {student_id} is outside 0..=20")]
    ScoreOutOfRange { student_id: i64, score: f64 },

    #[error("coefficient {coefficient} for student {student_id} is negative")]
    NegativeCoefficient { student_id: i64, coefficient: f64 },

    #[error("coefficient {coefficient} for student {student_id} is not a finite number")]
    NonFiniteCoefficient { student_id: i64, coefficient: f64 },

    #[error("subject {subject_id} has coefficient {coefficient}, expected a finite value >= 0")]
    InvalidSubjectCoefficient { subject_id: i64, coefficient: f64 },
}

pub type Result<T> = std::result::Result<T, GradingError>;
