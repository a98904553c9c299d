use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Serialize;
use serde_json::json;

use crate::config::ThresholdConfig;
use crate::error::ConfigWarning;
use crate::models::{CourseTermMetrics, Flag, SectionRecord};
use crate::pipeline::Analysis;

pub const METRICS_FILE: &str = "course_term_metrics.csv";
pub const FLAGS_FILE: &str = "flags.csv";
pub const SECTIONS_FILE: &str = "sections.csv";

#[derive(Debug, Serialize)]
pub struct CourseTermRow<'a> {
    pub subject: &'a str,
    pub catalog_number: &'a str,
    pub term: &'a str,
    pub num_sections: usize,
    pub enrollment: u64,
    pub graded: u64,
    pub dfw_count: u64,
    pub dropped: u64,
    pub repeats: u64,
    pub incomplete_count: u64,
    pub lapsed_count: u64,
    pub dfw_rate: f64,
    pub drop_rate: f64,
    pub incomplete_rate: f64,
    pub repeat_rate: f64,
    pub lapsed_rate: f64,
}

impl<'a> From<&'a CourseTermMetrics> for CourseTermRow<'a> {
    fn from(m: &'a CourseTermMetrics) -> Self {
        CourseTermRow {
            subject: &m.course.subject,
            catalog_number: &m.course.catalog_number,
            term: m.term.label(),
            num_sections: m.num_sections,
            enrollment: m.enrollment,
            graded: m.graded,
            dfw_count: m.dfw,
            dropped: m.dropped,
            repeats: m.repeats,
            incomplete_count: m.incomplete,
            lapsed_count: m.lapsed,
            dfw_rate: m.dfw_rate,
            drop_rate: m.drop_rate,
            incomplete_rate: m.incomplete_rate,
            repeat_rate: m.repeat_rate,
            lapsed_rate: m.lapsed_rate,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FlagRow<'a> {
    pub subject: &'a str,
    pub catalog_number: &'a str,
    pub pattern: &'static str,
    pub metric: &'static str,
    pub evidence_terms: String,
    pub evidence_rates: String,
    pub magnitude: f64,
    pub detail: &'a str,
}

impl<'a> From<&'a Flag> for FlagRow<'a> {
    fn from(flag: &'a Flag) -> Self {
        let terms: Vec<&str> = flag.evidence.iter().map(|e| e.term.label()).collect();
        let rates: Vec<String> = flag
            .evidence
            .iter()
            .map(|e| format!("{:.4}", e.rate))
            .collect();
        FlagRow {
            subject: &flag.course.subject,
            catalog_number: &flag.course.catalog_number,
            pattern: flag.kind.code(),
            metric: flag.metric.map(|m| m.code()).unwrap_or(""),
            evidence_terms: terms.join("; "),
            evidence_rates: rates.join("; "),
            magnitude: flag.magnitude,
            detail: &flag.detail,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SectionRow<'a> {
    pub term: &'a str,
    pub subject: &'a str,
    pub catalog_number: &'a str,
    pub section_number: &'a str,
    pub enrollment: u64,
    pub graded: u64,
    pub dfw_count: u64,
    pub dropped: u64,
    pub repeats: u64,
    pub incomplete: u64,
    pub extended_incomplete: u64,
    pub permanent_incomplete: u64,
    pub lapsed_incomplete: u64,
    pub dfw_rate: f64,
    pub drop_rate: f64,
    pub incomplete_rate: f64,
    pub repeat_rate: f64,
}

impl<'a> From<&'a SectionRecord> for SectionRow<'a> {
    fn from(r: &'a SectionRecord) -> Self {
        SectionRow {
            term: r.term.label(),
            subject: &r.subject,
            catalog_number: &r.catalog_number,
            section_number: &r.section_number,
            enrollment: r.enrollment,
            graded: r.graded,
            dfw_count: r.dfw,
            dropped: r.dropped,
            repeats: r.repeats,
            incomplete: r.incomplete,
            extended_incomplete: r.extended_incomplete,
            permanent_incomplete: r.permanent_incomplete,
            lapsed_incomplete: r.lapsed_incomplete,
            dfw_rate: r.dfw_rate(),
            drop_rate: r.drop_rate(),
            incomplete_rate: r.incomplete_rate(),
            repeat_rate: r.repeat_rate(),
        }
    }
}

pub fn write_csv<W, T, I>(writer: W, rows: I) -> anyhow::Result<()>
where
    W: Write,
    T: Serialize,
    I: IntoIterator<Item = T>,
{
    let mut writer = csv::Writer::from_writer(writer);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes the three drill-down tables into `out_dir`, returning their paths.
pub fn write_all(out_dir: &Path, analysis: &Analysis, flags: &[Flag]) -> anyhow::Result<Vec<PathBuf>> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;

    let metrics_path = out_dir.join(METRICS_FILE);
    let rows = analysis.courses.values().flatten().map(CourseTermRow::from);
    write_csv(create(&metrics_path)?, rows)?;

    let flags_path = out_dir.join(FLAGS_FILE);
    write_csv(create(&flags_path)?, flags.iter().map(FlagRow::from))?;

    let sections_path = out_dir.join(SECTIONS_FILE);
    write_csv(
        create(&sections_path)?,
        analysis.sections.iter().map(SectionRow::from),
    )?;

    Ok(vec![metrics_path, flags_path, sections_path])
}

fn create(path: &Path) -> anyhow::Result<fs::File> {
    fs::File::create(path).with_context(|| format!("failed to create {}", path.display()))
}

pub fn flags_json(
    analysis: &Analysis,
    thresholds: &ThresholdConfig,
    config_warnings: &[ConfigWarning],
    flags: &[Flag],
) -> serde_json::Value {
    json!({
        "run_id": analysis.run_id,
        "generated_at": analysis.generated_at,
        "sheet": analysis.sheet,
        "thresholds": thresholds,
        "config_warnings": config_warnings,
        "diagnostics": analysis.diagnostics,
        "flags": flags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{ColumnMap, NormalizeOptions};
    use crate::pipeline::fixtures;

    fn analysis() -> Analysis {
        Analysis::from_table(
            &fixtures::sample_table(),
            &ColumnMap::default(),
            &NormalizeOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn metrics_csv_has_stable_header() {
        let analysis = analysis();
        let mut buffer = Vec::new();
        write_csv(
            &mut buffer,
            analysis.courses.values().flatten().map(CourseTermRow::from),
        )
        .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let header = text.lines().next().unwrap();
        assert_eq!(
            header,
            "subject,catalog_number,term,num_sections,enrollment,graded,dfw_count,dropped,\
repeats,incomplete_count,lapsed_count,dfw_rate,drop_rate,incomplete_rate,repeat_rate,lapsed_rate"
        );
        assert_eq!(text.lines().count(), 1 + analysis.course_term_count());
    }

    #[test]
    fn flag_rows_join_evidence() {
        let analysis = analysis();
        let flags = analysis.detect(&ThresholdConfig::default());
        let persistent = flags
            .iter()
            .find(|f| f.kind == crate::models::PatternKind::PersistentHighDfw)
            .unwrap();
        let row = FlagRow::from(persistent);
        assert_eq!(row.pattern, "persistent_high_dfw");
        assert_eq!(row.metric, "dfw");
        assert_eq!(row.evidence_terms, "Fall 2022; Spring 2023; Fall 2023");
        assert_eq!(row.evidence_rates, "0.3500; 0.3250; 0.3500");
    }

    #[test]
    fn write_all_creates_three_files() {
        let dir = tempfile::tempdir().unwrap();
        let analysis = analysis();
        let flags = analysis.detect(&ThresholdConfig::default());
        let paths = write_all(&dir.path().join("out"), &analysis, &flags).unwrap();
        assert_eq!(paths.len(), 3);

        let sections = fs::read_to_string(dir.path().join("out").join(SECTIONS_FILE)).unwrap();
        assert_eq!(sections.lines().count(), 1 + analysis.sections.len());
        assert!(sections.starts_with("term,subject,catalog_number,section_number,"));

        let flag_lines = fs::read_to_string(dir.path().join("out").join(FLAGS_FILE)).unwrap();
        assert_eq!(flag_lines.lines().count(), 1 + flags.len());
    }

    #[test]
    fn json_output_carries_run_metadata() {
        let analysis = analysis();
        let thresholds = ThresholdConfig::default();
        let flags = analysis.detect(&thresholds);
        let value = flags_json(&analysis, &thresholds, &[], &flags);
        assert_eq!(value["run_id"], analysis.run_id.to_string());
        assert_eq!(value["config_warnings"].as_array().unwrap().len(), 0);
        assert_eq!(value["diagnostics"]["rows_kept"], 10);
        assert_eq!(value["thresholds"]["persistent_min_terms"], 3);
        assert_eq!(value["flags"].as_array().unwrap().len(), flags.len());
        assert_eq!(value["flags"][0]["kind"], "persistent_high_dfw");
    }

    #[test]
    fn json_output_carries_threshold_warnings() {
        let analysis = analysis();
        let (thresholds, warnings) =
            ThresholdConfig::from_named([("spike_delta", "lots"), ("lookback", "4")]);
        let flags = analysis.detect(&thresholds);
        let value = flags_json(&analysis, &thresholds, &warnings, &flags);
        let reported = value["config_warnings"].as_array().unwrap();
        assert_eq!(reported.len(), 2);
        assert_eq!(reported[0]["parameter"], "spike_delta");
        assert_eq!(reported[0]["issue"], "not_numeric");
        assert_eq!(reported[0]["fallback"], 0.15);
        assert_eq!(reported[1]["issue"], "unknown_parameter");
    }
}
