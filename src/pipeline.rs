use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::ThresholdConfig;
use crate::error::SchemaError;
use crate::loader::{self, ColumnMap, NormalizeOptions};
use crate::metrics;
use crate::models::{CourseMetrics, Diagnostics, Flag, SectionRecord};
use crate::patterns;
use crate::sheet::RawTable;

/// One uploaded sheet, normalized and aggregated. Detection can be re-run
/// against it with different thresholds without repeating the upstream work.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub sheet: String,
    pub diagnostics: Diagnostics,
    pub sections: Vec<SectionRecord>,
    pub courses: CourseMetrics,
}

impl Analysis {
    pub fn from_table(
        table: &RawTable,
        columns: &ColumnMap,
        options: &NormalizeOptions,
    ) -> Result<Self, SchemaError> {
        let normalized = loader::normalize(table, columns, options)?;
        let courses = metrics::aggregate(&normalized.records);
        Ok(Analysis {
            run_id: Uuid::new_v4(),
            generated_at: Utc::now(),
            sheet: table.sheet.clone(),
            diagnostics: normalized.diagnostics,
            sections: normalized.records,
            courses,
        })
    }

    pub fn detect(&self, thresholds: &ThresholdConfig) -> Vec<Flag> {
        patterns::detect(&self.courses, thresholds)
    }

    pub fn course_term_count(&self) -> usize {
        self.courses.values().map(Vec::len).sum()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CourseKey, PatternKind};

    fn analysis() -> Analysis {
        Analysis::from_table(
            &fixtures::sample_table(),
            &ColumnMap::default(),
            &NormalizeOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn end_to_end_diagnostics() {
        let analysis = analysis();
        assert_eq!(analysis.diagnostics.rows_read, 13);
        assert_eq!(analysis.diagnostics.rollup_rows, 2);
        assert_eq!(analysis.diagnostics.invalid_rows, 1);
        assert_eq!(analysis.diagnostics.rows_kept, 10);
        assert_eq!(analysis.sections.len(), 10);
        assert_eq!(analysis.courses.len(), 2);
        assert_eq!(analysis.course_term_count(), 8);
    }

    #[test]
    fn end_to_end_flags_math_only() {
        let flags = analysis().detect(&ThresholdConfig::default());
        assert!(!flags.is_empty());
        assert!(flags.iter().all(|f| f.course == CourseKey::new("MATH", "101")));
        assert!(flags.iter().any(|f| f.kind == PatternKind::PersistentHighDfw));
    }

    #[test]
    fn rerun_with_new_thresholds_reuses_metrics() {
        let analysis = analysis();
        let strict = ThresholdConfig {
            high_dfw_threshold: 0.9,
            trend_min_delta: 1.0,
            spike_delta: 1.0,
            high_repeat_threshold: 1.0,
            ..ThresholdConfig::default()
        };
        assert!(analysis.detect(&strict).is_empty());
        assert!(!analysis.detect(&ThresholdConfig::default()).is_empty());
    }

    #[test]
    fn missing_required_column_stops_before_aggregation() {
        let csv = fixtures::sample_csv().replacen(",Dropped,", ",Drops,", 1);
        let table = RawTable::from_reader("Export", csv.as_bytes()).unwrap();
        let err = Analysis::from_table(&table, &ColumnMap::default(), &NormalizeOptions::default())
            .unwrap_err();
        assert_eq!(
            err,
            SchemaError::MissingColumns {
                columns: vec!["Dropped".to_string()]
            }
        );
    }

    #[test]
    fn runs_are_isolated() {
        assert_ne!(analysis().run_id, analysis().run_id);
    }
}
