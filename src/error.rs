use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Structural problems with an uploaded sheet. Fatal to the run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("worksheet `{sheet}` not found in {location}")]
    MissingSheet { sheet: String, location: String },
    #[error("missing required column(s): {}", .columns.join(", "))]
    MissingColumns { columns: Vec<String> },
    #[error("worksheet `{sheet}` has no header row")]
    EmptySheet { sheet: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowIssue {
    Blank,
    NotNumeric,
    Negative,
    NotWholeNumber,
    TooLarge,
    DfwExceedsGraded,
}

impl fmt::Display for RowIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RowIssue::Blank => "blank value",
            RowIssue::NotNumeric => "not a number",
            RowIssue::Negative => "negative count",
            RowIssue::NotWholeNumber => "not a whole number",
            RowIssue::TooLarge => "count too large",
            RowIssue::DfwExceedsGraded => "DFW count exceeds graded count",
        };
        f.write_str(text)
    }
}

/// A candidate row that was dropped because a required field was unusable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowWarning {
    /// 1-based sheet row, counting the header as row 1.
    pub row: usize,
    pub field: String,
    pub value: String,
    pub issue: RowIssue,
}

impl fmt::Display for RowWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "row {}: {} `{}` ({})",
            self.row, self.field, self.value, self.issue
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigIssue {
    NotNumeric,
    NotFinite,
    Negative,
    UnknownParameter,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConfigIssue::NotNumeric => "not a number",
            ConfigIssue::NotFinite => "not a finite number",
            ConfigIssue::Negative => "negative value",
            ConfigIssue::UnknownParameter => "unknown parameter",
        };
        f.write_str(text)
    }
}

/// A threshold override that could not be applied as given.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigWarning {
    pub parameter: String,
    pub value: String,
    pub issue: ConfigIssue,
    /// Value kept instead, if the parameter exists.
    pub fallback: Option<f64>,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.fallback {
            Some(fallback) => write!(
                f,
                "{} = `{}` ignored ({}); keeping {}",
                self.parameter, self.value, self.issue, fallback
            ),
            None => write!(
                f,
                "{} = `{}` ignored ({})",
                self.parameter, self.value, self.issue
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_columns_message_names_every_column() {
        let err = SchemaError::MissingColumns {
            columns: vec!["Dropped".to_string(), "Subject".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "missing required column(s): Dropped, Subject"
        );
    }

    #[test]
    fn config_warning_mentions_fallback() {
        let warning = ConfigWarning {
            parameter: "spike_delta".to_string(),
            value: "lots".to_string(),
            issue: ConfigIssue::NotNumeric,
            fallback: Some(0.15),
        };
        assert_eq!(
            warning.to_string(),
            "spike_delta = `lots` ignored (not a number); keeping 0.15"
        );
    }
}
