//! Named value transforms
//!
//! Transforms normalize an extracted value before aggregation. The set is
//! closed: a config names one of the [`Transform`] variants, and new spellings
//! are added by registering aliases on a [`TransformRegistry`]. A transform
//! that cannot interpret its input returns `None`; it never errors.

use crate::error::{CoreError, Result};
use crate::types::{is_non_blank, FieldValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Literals shared by the in-process transforms and the pushdown renderer.
pub mod thresholds {
    /// Values strictly below this classify as low
    pub const LOW_CUTOFF: f64 = 11.5;
    /// Upper (exclusive) edge of the mid band starting at [`LOW_CUTOFF`]
    pub const BAND_UPPER: f64 = 12.5;
    /// Lower-cased, space-trimmed texts read as "yes"
    pub const YES_VALUES: &[&str] = &["yes", "1", "true"];
    /// Lower-cased, space-trimmed texts read as male
    pub const MALE_VALUES: &[&str] = &["male", "m", "man", "boy"];
    /// Lower-cased, space-trimmed texts read as female
    pub const FEMALE_VALUES: &[&str] = &["female", "f", "woman", "girl"];
}

/// Closed set of transforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    /// "yes"/"1"/"true" (case-insensitive) => 1
    YesFlag,
    /// Value coerces to a number => 1
    NumericValidity,
    /// Numeric coercion to float
    Numeric,
    /// Male synonym => 1
    GenderMale,
    /// Female synonym => 1
    GenderFemale,
    /// Text has a character outside ASCII space => 1
    NonBlank,
    /// Number below [`thresholds::LOW_CUTOFF`] => 1
    BelowCutoff,
    /// Number in `[LOW_CUTOFF, BAND_UPPER)` => 1
    WithinBand,
}

impl Transform {
    /// Every transform, in declaration order
    pub const ALL: [Transform; 8] = [
        Transform::YesFlag,
        Transform::NumericValidity,
        Transform::Numeric,
        Transform::GenderMale,
        Transform::GenderFemale,
        Transform::NonBlank,
        Transform::BelowCutoff,
        Transform::WithinBand,
    ];

    /// Canonical name used in configs
    pub fn name(&self) -> &'static str {
        match self {
            Transform::YesFlag => "yes_flag",
            Transform::NumericValidity => "numeric_validity",
            Transform::Numeric => "numeric",
            Transform::GenderMale => "gender_male",
            Transform::GenderFemale => "gender_female",
            Transform::NonBlank => "non_blank",
            Transform::BelowCutoff => "below_cutoff",
            Transform::WithinBand => "within_band",
        }
    }

    /// Apply to a present value
    pub fn apply(&self, raw: &FieldValue) -> Option<FieldValue> {
        let result = match self {
            Transform::YesFlag => flag(matches_any(raw, thresholds::YES_VALUES)),
            Transform::GenderMale => flag(matches_any(raw, thresholds::MALE_VALUES)),
            Transform::GenderFemale => flag(matches_any(raw, thresholds::FEMALE_VALUES)),
            Transform::NonBlank => flag(is_non_blank(&raw.to_text())),
            Transform::NumericValidity => flag(raw.coerce_f64().is_some()),
            Transform::Numeric => raw.coerce_f64().map(FieldValue::Float),
            Transform::BelowCutoff => {
                flag(raw.coerce_f64().is_some_and(|v| v < thresholds::LOW_CUTOFF))
            }
            Transform::WithinBand => flag(raw.coerce_f64().is_some_and(|v| {
                v >= thresholds::LOW_CUTOFF && v < thresholds::BAND_UPPER
            })),
        };

        if result.is_none() && self.is_numeric() && raw.coerce_f64().is_none() {
            debug!(transform = self.name(), value = %raw.to_text(), "value not numeric, treating as absent");
        }
        result
    }

    /// Apply to a possibly absent value
    pub fn apply_opt(&self, raw: Option<&FieldValue>) -> Option<FieldValue> {
        raw.and_then(|value| self.apply(value))
    }

    fn is_numeric(&self) -> bool {
        matches!(
            self,
            Transform::NumericValidity
                | Transform::Numeric
                | Transform::BelowCutoff
                | Transform::WithinBand
        )
    }
}

/// Normalized text used by the categorical transforms
pub fn normalized_text(value: &FieldValue) -> String {
    value.to_text().trim_matches(' ').to_lowercase()
}

fn matches_any(value: &FieldValue, candidates: &[&str]) -> bool {
    let text = normalized_text(value);
    candidates.iter().any(|candidate| *candidate == text)
}

fn flag(hit: bool) -> Option<FieldValue> {
    hit.then_some(FieldValue::Integer(1))
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Transform {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_lowercase();
        Transform::ALL
            .into_iter()
            .find(|t| t.name() == lower)
            .ok_or_else(|| CoreError::UnknownTransform(s.to_string()))
    }
}

/// Resolves transform names and registered aliases to [`Transform`]s
#[derive(Debug, Clone)]
pub struct TransformRegistry {
    names: HashMap<String, Transform>,
}

impl TransformRegistry {
    /// Registry holding the canonical names only
    pub fn new() -> Self {
        let names = Transform::ALL
            .into_iter()
            .map(|t| (t.name().to_string(), t))
            .collect();
        Self { names }
    }

    /// Bind an additional name to an existing transform
    pub fn register(&mut self, alias: &str, transform: Transform) -> Result<()> {
        let key = alias.trim().to_lowercase();
        match self.names.get(&key) {
            Some(existing) if *existing != transform => Err(CoreError::AliasConflict {
                alias: alias.to_string(),
                existing: existing.name().to_string(),
            }),
            _ => {
                self.names.insert(key, transform);
                Ok(())
            }
        }
    }

    /// Resolve a name or alias
    pub fn resolve(&self, name: &str) -> Result<Transform> {
        self.names
            .get(&name.trim().to_lowercase())
            .copied()
            .ok_or_else(|| CoreError::UnknownTransform(name.to_string()))
    }

    /// Apply a transform by name. Unknown names and uninterpretable values both yield `None`.
    pub fn apply(&self, name: &str, raw: Option<&FieldValue>) -> Option<FieldValue> {
        match self.resolve(name) {
            Ok(transform) => transform.apply_opt(raw),
            Err(e) => {
                debug!(error = %e, "transform lookup failed");
                None
            }
        }
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::new()
    }
}
