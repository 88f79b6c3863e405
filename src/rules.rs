use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{info, warn};

use crate::averaging::EvaluationWeights;
use crate::error::{GradingError, Result};
use crate::models::{ActiveRule, EnrollmentStatus, PromotionRule, RuleProvenance};

/// Promotion rule as stored or written in a rule file. Missing fields take
/// the built-in defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPromotionRule {
    pub minimum_average: Option<f64>,
    pub required_enrollment_status: Option<String>,
    pub direct_transfer: Option<bool>,
    pub disable_year_after_transfer: Option<bool>,
}

impl TryFrom<RawPromotionRule> for PromotionRule {
    type Error = GradingError;

    fn try_from(raw: RawPromotionRule) -> Result<Self> {
        let defaults = PromotionRule::default();
        let required_enrollment_status = match raw.required_enrollment_status {
            Some(tag) => tag.parse::<EnrollmentStatus>()?,
            None => defaults.required_enrollment_status,
        };

        let rule = PromotionRule {
            minimum_average: raw.minimum_average.unwrap_or(defaults.minimum_average),
            required_enrollment_status,
            direct_transfer: raw.direct_transfer.unwrap_or(defaults.direct_transfer),
            disable_year_after_transfer: raw
                .disable_year_after_transfer
                .unwrap_or(defaults.disable_year_after_transfer),
        };
        rule.validate()?;
        Ok(rule)
    }
}

impl PromotionRule {
    /// Rejects thresholds outside the 0..=20 grading scale. Never clamps.
    pub fn validate(&self) -> Result<()> {
        if !self.minimum_average.is_finite() || !(0.0..=20.0).contains(&self.minimum_average) {
            return Err(GradingError::InvalidRule(format!(
                "minimum average {} is outside 0..=20",
                self.minimum_average
            )));
        }
        Ok(())
    }
}

/// Contents of a `--rules` JSON file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleFile {
    #[serde(flatten)]
    pub rule: RawPromotionRule,
    #[serde(default)]
    pub weights: Option<EvaluationWeights>,
}

impl RuleFile {
    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Weights from the rule file when it has a `weights` table, otherwise the
/// built-in table. Both come back validated, with their provenance.
pub fn resolve_weights(
    file: Option<(&Path, &RuleFile)>,
) -> Result<(EvaluationWeights, RuleProvenance)> {
    let from_file = file.and_then(|(path, rule_file)| {
        rule_file.weights.clone().map(|weights| {
            let provenance = RuleProvenance::File {
                path: PathBuf::from(path),
            };
            (weights, provenance)
        })
    });
    let (weights, provenance) = from_file
        .unwrap_or_else(|| (EvaluationWeights::default(), RuleProvenance::BuiltInDefault));
    weights.validate()?;
    Ok((weights, provenance))
}

/// Picks the rule in effect: stored rule first, then a rule file, then the
/// built-in default. Weights resolve separately and carry their own
/// provenance. A rule file shadowed by a stored rule is logged and kept on
/// the result so callers can show it.
pub fn resolve_active_rule(
    stored: Option<(i64, RawPromotionRule)>,
    file: Option<(&Path, RuleFile)>,
) -> Result<ActiveRule> {
    let (weights, weights_provenance) =
        resolve_weights(file.as_ref().map(|(path, rule_file)| (*path, rule_file)))?;

    if let Some((rule_id, raw)) = stored {
        let rule = PromotionRule::try_from(raw)?;
        info!(rule_id, minimum_average = rule.minimum_average, "using stored promotion rule");

        let ignored_rule_file = file.map(|(path, _)| PathBuf::from(path));
        if let Some(path) = &ignored_rule_file {
            warn!(
                rule_id,
                path = %path.display(),
                "stored promotion rule overrides the rule fields of the rule file"
            );
        }

        return Ok(ActiveRule {
            rule,
            provenance: RuleProvenance::Stored { rule_id },
            weights,
            weights_provenance,
            ignored_rule_file,
        });
    }

    if let Some((path, rule_file)) = file {
        let rule = PromotionRule::try_from(rule_file.rule)?;
        info!(
            path = %path.display(),
            minimum_average = rule.minimum_average,
            "using promotion rule file"
        );
        return Ok(ActiveRule {
            rule,
            provenance: RuleProvenance::File {
                path: PathBuf::from(path),
            },
            weights,
            weights_provenance,
            ignored_rule_file: None,
        });
    }

    let rule = PromotionRule::default();
    warn!(
        minimum_average = rule.minimum_average,
        "no promotion rule configured, falling back to the built-in default"
    );
    Ok(ActiveRule {
        rule,
        provenance: RuleProvenance::BuiltInDefault,
        weights,
        weights_provenance,
        ignored_rule_file: None,
    })
}
