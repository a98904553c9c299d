use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::error::RowWarning;
use crate::term::Term;

#[derive(Debug, Clone, PartialEq)]
pub struct SectionRecord {
    pub term: Term,
    pub subject: String,
    pub catalog_number: String,
    pub section_number: String,
    pub enrollment: u64,
    pub graded: u64,
    pub dfw: u64,
    pub dropped: u64,
    pub repeats: u64,
    pub incomplete: u64,
    pub extended_incomplete: u64,
    pub permanent_incomplete: u64,
    pub lapsed_incomplete: u64,
}

impl SectionRecord {
    pub fn course_key(&self) -> CourseKey {
        CourseKey::new(self.subject.clone(), self.catalog_number.clone())
    }

    /// I + EI + PI + @F.
    pub fn incomplete_family(&self) -> u64 {
        self.incomplete
            .saturating_add(self.extended_incomplete)
            .saturating_add(self.permanent_incomplete)
            .saturating_add(self.lapsed_incomplete)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CourseKey {
    pub subject: String,
    pub catalog_number: String,
}

impl CourseKey {
    pub fn new(subject: impl Into<String>, catalog_number: impl Into<String>) -> Self {
        CourseKey {
            subject: subject.into(),
            catalog_number: catalog_number.into(),
        }
    }
}

impl fmt::Display for CourseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.subject, self.catalog_number)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CourseTermMetrics {
    pub course: CourseKey,
    pub term: Term,
    pub num_sections: usize,
    pub enrollment: u64,
    pub graded: u64,
    pub dfw: u64,
    pub dropped: u64,
    pub repeats: u64,
    pub incomplete: u64,
    pub lapsed: u64,
    pub dfw_rate: f64,
    pub drop_rate: f64,
    pub incomplete_rate: f64,
    pub repeat_rate: f64,
    pub lapsed_rate: f64,
}

impl CourseTermMetrics {
    pub fn rate(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Dfw => self.dfw_rate,
            Metric::Drop => self.drop_rate,
            Metric::Incomplete => self.incomplete_rate,
            Metric::Repeat => self.repeat_rate,
        }
    }
}

/// Chronological course-term history per course, courses in key order.
pub type CourseMetrics = BTreeMap<CourseKey, Vec<CourseTermMetrics>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Dfw,
    Drop,
    Incomplete,
    Repeat,
}

impl Metric {
    pub fn label(self) -> &'static str {
        match self {
            Metric::Dfw => "DFW rate",
            Metric::Drop => "drop rate",
            Metric::Incomplete => "incomplete rate",
            Metric::Repeat => "repeat rate",
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Metric::Dfw => "dfw",
            Metric::Drop => "drop",
            Metric::Incomplete => "incomplete",
            Metric::Repeat => "repeat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    PersistentHighDfw,
    WorseningTrend,
    Spike,
    HighRepeat,
    CoOccurring,
}

impl PatternKind {
    pub fn label(self) -> &'static str {
        match self {
            PatternKind::PersistentHighDfw => "Persistent high DFW",
            PatternKind::WorseningTrend => "Worsening trend",
            PatternKind::Spike => "Spike",
            PatternKind::HighRepeat => "High repeat",
            PatternKind::CoOccurring => "Co-occurring issues",
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            PatternKind::PersistentHighDfw => "persistent_high_dfw",
            PatternKind::WorseningTrend => "worsening_trend",
            PatternKind::Spike => "spike",
            PatternKind::HighRepeat => "high_repeat",
            PatternKind::CoOccurring => "co_occurring",
        }
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TermRate {
    pub term: Term,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Flag {
    pub course: CourseKey,
    pub kind: PatternKind,
    pub metric: Option<Metric>,
    pub evidence: Vec<TermRate>,
    pub magnitude: f64,
    pub detail: String,
}

impl Flag {
    pub fn covers(&self, term: &Term) -> bool {
        self.evidence.iter().any(|entry| &entry.term == term)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    pub rows_read: usize,
    /// Includes `sum_rollup_rows`.
    pub rollup_rows: usize,
    pub sum_rollup_rows: usize,
    pub invalid_rows: usize,
    pub rows_kept: usize,
    pub missing_optional: Vec<String>,
    pub warnings: Vec<RowWarning>,
}
