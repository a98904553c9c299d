use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigIssue, ConfigWarning};

/// Detection thresholds. Passed by value into every detection run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// DFW rate at or above which a term counts as high.
    pub high_dfw_threshold: f64,
    /// Consecutive most-recent high-DFW terms needed for a persistence flag.
    pub persistent_min_terms: usize,
    /// Number of trailing terms examined for a worsening trend.
    pub trend_window: usize,
    /// Minimum first-to-last rise across the trend window.
    pub trend_min_delta: f64,
    /// Minimum excess over the trailing average for a spike.
    pub spike_delta: f64,
    pub high_repeat_threshold: f64,
    /// Course-terms with fewer total enrollments are ignored; 0 disables.
    pub min_enrollment: u64,
    /// Drop flags for courses last offered this many terms before the newest
    /// term in the data; 0 disables.
    pub recency_terms: usize,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            high_dfw_threshold: 0.30,
            persistent_min_terms: 3,
            trend_window: 3,
            trend_min_delta: 0.05,
            spike_delta: 0.15,
            high_repeat_threshold: 0.10,
            min_enrollment: 0,
            recency_terms: 0,
        }
    }
}

impl ThresholdConfig {
    pub fn get(&self, name: &str) -> Option<f64> {
        let value = match name {
            "high_dfw_threshold" => self.high_dfw_threshold,
            "persistent_min_terms" => self.persistent_min_terms as f64,
            "trend_window" => self.trend_window as f64,
            "trend_min_delta" => self.trend_min_delta,
            "spike_delta" => self.spike_delta,
            "high_repeat_threshold" => self.high_repeat_threshold,
            "min_enrollment" => self.min_enrollment as f64,
            "recency_terms" => self.recency_terms as f64,
            _ => return None,
        };
        Some(value)
    }

    /// Applies one named override. Unusable values leave the current value in
    /// place and are reported; count parameters are floored.
    pub fn apply(&mut self, name: &str, raw: &str) -> Option<ConfigWarning> {
        let name = name.trim();
        let Some(current) = self.get(name) else {
            return Some(ConfigWarning {
                parameter: name.to_string(),
                value: raw.to_string(),
                issue: ConfigIssue::UnknownParameter,
                fallback: None,
            });
        };

        let value = match coerce(raw) {
            Ok(value) => value,
            Err(issue) => {
                return Some(ConfigWarning {
                    parameter: name.to_string(),
                    value: raw.to_string(),
                    issue,
                    fallback: Some(current),
                })
            }
        };

        match name {
            "high_dfw_threshold" => self.high_dfw_threshold = value,
            "persistent_min_terms" => self.persistent_min_terms = value.floor() as usize,
            "trend_window" => self.trend_window = value.floor() as usize,
            "trend_min_delta" => self.trend_min_delta = value,
            "spike_delta" => self.spike_delta = value,
            "high_repeat_threshold" => self.high_repeat_threshold = value,
            "min_enrollment" => self.min_enrollment = value.floor() as u64,
            "recency_terms" => self.recency_terms = value.floor() as usize,
            _ => unreachable!("parameter names are checked by get"),
        }
        None
    }

    /// Applies overrides in order on top of `self`.
    pub fn with_overrides<I, K, V>(mut self, pairs: I) -> (Self, Vec<ConfigWarning>)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut warnings = Vec::new();
        for (name, raw) in pairs {
            if let Some(warning) = self.apply(name.as_ref(), raw.as_ref()) {
                warn!("threshold override {warning}");
                warnings.push(warning);
            }
        }
        (self, warnings)
    }

    pub fn from_named<I, K, V>(pairs: I) -> (Self, Vec<ConfigWarning>)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        Self::default().with_overrides(pairs)
    }

    /// Reads a TOML table of thresholds; every key is optional and goes
    /// through the same coercion as command-line overrides.
    pub fn from_toml_str(contents: &str) -> anyhow::Result<(Self, Vec<ConfigWarning>)> {
        let table: toml::Table = toml::from_str(contents).context("invalid thresholds TOML")?;
        let pairs: Vec<(String, String)> = table
            .into_iter()
            .map(|(name, value)| {
                let raw = match value {
                    toml::Value::String(text) => text,
                    toml::Value::Integer(number) => number.to_string(),
                    toml::Value::Float(number) => number.to_string(),
                    other => other.type_str().to_string(),
                };
                (name, raw)
            })
            .collect();
        Ok(Self::from_named(pairs))
    }

    pub fn load_file(path: &Path) -> anyhow::Result<(Self, Vec<ConfigWarning>)> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read thresholds file {}", path.display()))?;
        Self::from_toml_str(&contents)
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string(self)?)
    }
}

fn coerce(raw: &str) -> Result<f64, ConfigIssue> {
    let value: f64 = raw.trim().parse().map_err(|_| ConfigIssue::NotNumeric)?;
    if !value.is_finite() {
        return Err(ConfigIssue::NotFinite);
    }
    if value < 0.0 {
        return Err(ConfigIssue::Negative);
    }
    Ok(value)
}

/// clap parser for `name=value`.
pub fn parse_override(input: &str) -> Result<(String, String), String> {
    match input.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got `{input}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ThresholdConfig::default();
        assert_eq!(config.high_dfw_threshold, 0.30);
        assert_eq!(config.persistent_min_terms, 3);
        assert_eq!(config.trend_window, 3);
        assert_eq!(config.trend_min_delta, 0.05);
        assert_eq!(config.spike_delta, 0.15);
        assert_eq!(config.high_repeat_threshold, 0.10);
        for name in [
            "high_dfw_threshold",
            "persistent_min_terms",
            "trend_window",
            "trend_min_delta",
            "spike_delta",
            "high_repeat_threshold",
            "min_enrollment",
            "recency_terms",
        ] {
            assert!(config.get(name).is_some(), "{name} has no getter");
        }
    }

    #[test]
    fn numeric_overrides_are_applied() {
        let (config, warnings) = ThresholdConfig::from_named([
            ("high_dfw_threshold", "0.25"),
            ("persistent_min_terms", "4.8"),
            ("spike_delta", " 2 "),
        ]);
        assert!(warnings.is_empty());
        assert_eq!(config.high_dfw_threshold, 0.25);
        assert_eq!(config.persistent_min_terms, 4);
        assert_eq!(config.spike_delta, 2.0);
    }

    #[test]
    fn bad_values_fall_back_to_last_known_good() {
        let (config, warnings) = ThresholdConfig::from_named([
            ("spike_delta", "0.2"),
            ("spike_delta", "high"),
            ("trend_min_delta", "-0.1"),
            ("high_dfw_threshold", "inf"),
        ]);
        assert_eq!(config.spike_delta, 0.2);
        assert_eq!(config.trend_min_delta, 0.05);
        assert_eq!(config.high_dfw_threshold, 0.30);

        let issues: Vec<ConfigIssue> = warnings.iter().map(|w| w.issue).collect();
        assert_eq!(
            issues,
            vec![ConfigIssue::NotNumeric, ConfigIssue::Negative, ConfigIssue::NotFinite]
        );
        assert_eq!(warnings[0].fallback, Some(0.2));
    }

    #[test]
    fn unknown_parameters_are_reported_and_ignored() {
        let (config, warnings) = ThresholdConfig::from_named([("lookback", "6")]);
        assert_eq!(config, ThresholdConfig::default());
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].issue, ConfigIssue::UnknownParameter);
        assert_eq!(warnings[0].fallback, None);
    }

    #[test]
    fn toml_values_are_coerced() {
        let (config, warnings) = ThresholdConfig::from_toml_str(
            r#"
            high_dfw_threshold = 0.2
            trend_window = 4
            spike_delta = "0.1"
            high_repeat_threshold = true
            "#,
        )
        .unwrap();
        assert_eq!(config.high_dfw_threshold, 0.2);
        assert_eq!(config.trend_window, 4);
        assert_eq!(config.spike_delta, 0.1);
        assert_eq!(config.high_repeat_threshold, 0.10);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].parameter, "high_repeat_threshold");
    }

    #[test]
    fn toml_output_loads_back() {
        let config = ThresholdConfig {
            trend_window: 5,
            ..ThresholdConfig::default()
        };
        let text = config.to_toml().unwrap();
        let (loaded, warnings) = ThresholdConfig::from_toml_str(&text).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(loaded, config);
    }

    #[test]
    fn override_syntax() {
        assert_eq!(
            parse_override("spike_delta = 0.2"),
            Ok(("spike_delta".to_string(), "0.2".to_string()))
        );
        assert!(parse_override("spike_delta").is_err());
        assert!(parse_override("=3").is_err());
    }
}
