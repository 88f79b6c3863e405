use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::averaging::EvaluationWeights;
use crate::error::GradingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Semester {
    First,
    Second,
}

impl TryFrom<i32> for Semester {
    type Error = GradingError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Semester::First),
            2 => Ok(Semester::Second),
            other => Err(GradingError::InvalidSemester(other)),
        }
    }
}

impl Semester {
    pub fn number(self) -> i32 {
        match self {
            Semester::First => 1,
            Semester::Second => 2,
        }
    }
}

/// Kind of assessment. Drives the weight used in semester averaging.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationType {
    Devoir1,
    Devoir2,
    /// Also covers `examen`.
    Composition,
    Other(String),
}

impl EvaluationType {
    pub fn parse(tag: &str) -> Self {
        let normalized: String = tag
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| !matches!(c, ' ' | '_' | '-'))
            .collect();

        match normalized.as_str() {
            "devoir1" => EvaluationType::Devoir1,
            "devoir2" => EvaluationType::Devoir2,
            "composition" | "examen" | "exam" => EvaluationType::Composition,
            _ => EvaluationType::Other(tag.trim().to_string()),
        }
    }
}

impl fmt::Display for EvaluationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvaluationType::Devoir1 => write!(f, "devoir1"),
            EvaluationType::Devoir2 => write!(f, "devoir2"),
            EvaluationType::Composition => write!(f, "composition"),
            EvaluationType::Other(tag) => write!(f, "{tag}"),
        }
    }
}

/// One graded assessment. Read-only input to the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationRecord {
    pub student_id: i64,
    pub subject_id: i64,
    pub course_id: i64,
    pub school_year_id: i64,
    pub semester: Semester,
    pub evaluation_type: EvaluationType,
    /// 0 means absent or not yet graded.
    pub score: f64,
    pub record_coefficient: f64,
}

impl EvaluationRecord {
    pub fn is_graded(&self) -> bool {
        self.score != 0.0
    }
}

/// Evaluation row as it arrives from the record store or a CSV file.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvaluation {
    pub student_id: i64,
    pub subject_id: i64,
    pub course_id: i64,
    pub school_year_id: i64,
    pub semester: i32,
    pub evaluation_type: String,
    pub score: f64,
    pub coefficient: Option<f64>,
}

impl TryFrom<RawEvaluation> for EvaluationRecord {
    type Error = GradingError;

    fn try_from(raw: RawEvaluation) -> Result<Self, Self::Error> {
        let semester = Semester::try_from(raw.semester)?;

        if !(0.0..=20.0).contains(&raw.score) {
            return Err(GradingError::ScoreOutOfRange {
                student_id: raw.student_id,
                score: raw.score,
            });
        }

        let record_coefficient = raw.coefficient.unwrap_or(1.0);
        if !record_coefficient.is_finite() {
            return Err(GradingError::NonFiniteCoefficient {
                student_id: raw.student_id,
                coefficient: record_coefficient,
            });
        }
        if record_coefficient < 0.0 {
            return Err(GradingError::NegativeCoefficient {
                student_id: raw.student_id,
                coefficient: record_coefficient,
            });
        }

        Ok(EvaluationRecord {
            student_id: raw.student_id,
            subject_id: raw.subject_id,
            course_id: raw.course_id,
            school_year_id: raw.school_year_id,
            semester,
            evaluation_type: EvaluationType::parse(&raw.evaluation_type),
            score: raw.score,
            record_coefficient,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subject {
    pub id: i64,
    pub name: String,
    pub coefficient: f64,
}

impl Subject {
    /// Catalog entry with a finite, non-negative coefficient.
    pub fn new(id: i64, name: impl Into<String>, coefficient: f64) -> Result<Self, GradingError> {
        if !coefficient.is_finite() || coefficient < 0.0 {
            return Err(GradingError::InvalidSubjectCoefficient {
                subject_id: id,
                coefficient,
            });
        }
        Ok(Self {
            id,
            name: name.into(),
            coefficient,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectYearAverage {
    pub subject_id: i64,
    pub subject_name: String,
    pub coefficient: f64,
    pub semester1_average: Option<f64>,
    pub semester2_average: Option<f64>,
    pub annual_average: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentAnnualResult {
    pub student_id: i64,
    pub school_year_id: i64,
    pub subject_averages: Vec<SubjectYearAverage>,
    pub general_average: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrollmentStatus {
    Enrolled,
    Unenrolled,
    Transferred,
    Completed,
}

impl EnrollmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EnrollmentStatus::Enrolled => "enrolled",
            EnrollmentStatus::Unenrolled => "unenrolled",
            EnrollmentStatus::Transferred => "transferred",
            EnrollmentStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnrollmentStatus {
    type Err = GradingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "enrolled" | "inscrit" => Ok(EnrollmentStatus::Enrolled),
            "unenrolled" | "desinscrit" | "désinscrit" => Ok(EnrollmentStatus::Unenrolled),
            "transferred" | "transfere" | "transféré" => Ok(EnrollmentStatus::Transferred),
            "completed" | "termine" | "terminé" => Ok(EnrollmentStatus::Completed),
            _ => Err(GradingError::UnknownEnrollmentStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromotionRule {
    pub minimum_average: f64,
    pub required_enrollment_status: EnrollmentStatus,
    pub direct_transfer: bool,
    pub disable_year_after_transfer: bool,
}

impl PromotionRule {
    pub const DEFAULT_MINIMUM_AVERAGE: f64 = 8.0;
}

impl Default for PromotionRule {
    fn default() -> Self {
        Self {
            minimum_average: Self::DEFAULT_MINIMUM_AVERAGE,
            required_enrollment_status: EnrollmentStatus::Enrolled,
            direct_transfer: true,
            disable_year_after_transfer: true,
        }
    }
}

/// Where the rule in effect came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum RuleProvenance {
    Stored { rule_id: i64 },
    File { path: PathBuf },
    BuiltInDefault,
}

impl fmt::Display for RuleProvenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleProvenance::Stored { rule_id } => write!(f, "stored rule #{rule_id}"),
            RuleProvenance::File { path } => write!(f, "rule file {}", path.display()),
            RuleProvenance::BuiltInDefault => write!(f, "built-in default"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveRule {
    pub rule: PromotionRule,
    pub provenance: RuleProvenance,
    pub weights: EvaluationWeights,
    pub weights_provenance: RuleProvenance,
    /// Rule file whose rule fields lost to a stored rule.
    pub ignored_rule_file: Option<PathBuf>,
}

/// School levels in succession order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Level {
    Sixieme,
    Cinquieme,
    Quatrieme,
    Troisieme,
    Seconde,
    Premiere,
    Terminale,
}

impl Level {
    /// `None` for the terminal level.
    pub fn next(self) -> Option<Level> {
        match self {
            Level::Sixieme => Some(Level::Cinquieme),
            Level::Cinquieme => Some(Level::Quatrieme),
            Level::Quatrieme => Some(Level::Troisieme),
            Level::Troisieme => Some(Level::Seconde),
            Level::Seconde => Some(Level::Premiere),
            Level::Premiere => Some(Level::Terminale),
            Level::Terminale => None,
        }
    }

    pub fn parse(label: &str) -> Option<Level> {
        let normalized: String = label
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| match c {
                'è' | 'é' | 'ê' => 'e',
                other => other,
            })
            .collect();

        match normalized.as_str() {
            "6eme" | "6e" | "6" | "sixieme" => Some(Level::Sixieme),
            "5eme" | "5e" | "5" | "cinquieme" => Some(Level::Cinquieme),
            "4eme" | "4e" | "4" | "quatrieme" => Some(Level::Quatrieme),
            "3eme" | "3e" | "3" | "troisieme" => Some(Level::Troisieme),
            "2nde" | "2de" | "seconde" => Some(Level::Seconde),
            "1ere" | "1re" | "premiere" => Some(Level::Premiere),
            "terminale" | "tle" | "term" => Some(Level::Terminale),
            _ => None,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Level::Sixieme => "6ème",
            Level::Cinquieme => "5ème",
            Level::Quatrieme => "4ème",
            Level::Troisieme => "3ème",
            Level::Seconde => "2nde",
            Level::Premiere => "1ère",
            Level::Terminale => "Terminale",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassInfo {
    pub id: i64,
    pub name: String,
    pub level: String,
}

impl ClassInfo {
    pub fn parsed_level(&self) -> Option<Level> {
        Level::parse(&self.level)
    }
}
