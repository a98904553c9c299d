use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

use crate::config::ThresholdConfig;
use crate::error::ConfigWarning;
use crate::models::{CourseKey, CourseTermMetrics, Flag, PatternKind};
use crate::pipeline::Analysis;

const SECTION_SPREAD_LIMIT: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Immediate,
    Moderate,
    Watch,
}

impl Severity {
    pub fn heading(self) -> &'static str {
        match self {
            Severity::Immediate => "Act Now",
            Severity::Moderate => "Monitor Closely",
            Severity::Watch => "Awareness",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CourseFinding<'a> {
    pub course: &'a CourseKey,
    pub severity: Severity,
    pub kinds: BTreeSet<PatternKind>,
    pub latest: &'a CourseTermMetrics,
    pub headline: String,
    pub action: &'static str,
    pub section_spread: Option<(f64, f64)>,
    pub flags: Vec<&'a Flag>,
}

pub fn classify(kinds: &BTreeSet<PatternKind>, latest_dfw: f64, thresholds: &ThresholdConfig) -> Severity {
    if kinds.len() >= 2
        || kinds.contains(&PatternKind::PersistentHighDfw)
        || latest_dfw > thresholds.high_dfw_threshold * 1.5
    {
        Severity::Immediate
    } else if kinds.contains(&PatternKind::WorseningTrend) || kinds.contains(&PatternKind::Spike) {
        Severity::Moderate
    } else {
        Severity::Watch
    }
}

pub fn recommended_action(kinds: &BTreeSet<PatternKind>) -> &'static str {
    let priority = [
        (PatternKind::CoOccurring, "Holistic review with department and advising"),
        (PatternKind::PersistentHighDfw, "Review prerequisites, pedagogy, and grading practices"),
        (PatternKind::WorseningTrend, "Investigate recent changes; engage early-alert systems"),
        (PatternKind::Spike, "Determine cause of spike; monitor next term"),
        (PatternKind::HighRepeat, "Review placement and prerequisite readiness for repeating students"),
    ];
    priority
        .iter()
        .find(|(kind, _)| kinds.contains(kind))
        .map(|(_, action)| *action)
        .unwrap_or("Review course data and discuss with department")
}

fn headline(flags: &[&Flag], latest: &CourseTermMetrics) -> String {
    let rate = format!("{:.0}%", latest.dfw_rate * 100.0);
    let find = |kind: PatternKind| flags.iter().find(|flag| flag.kind == kind);

    if let Some(flag) = find(PatternKind::PersistentHighDfw) {
        return format!("DFW rate at {rate} for {} consecutive terms", flag.evidence.len());
    }
    if let Some(flag) = find(PatternKind::WorseningTrend) {
        let metric = flag.metric.map(|m| m.label()).unwrap_or("DFW rate");
        return format!("{} rising, DFW now at {rate} in {}", capitalize(metric), latest.term);
    }
    if let Some(flag) = find(PatternKind::Spike) {
        let metric = flag.metric.map(|m| m.label()).unwrap_or("DFW rate");
        let term = flag
            .evidence
            .first()
            .map(|entry| entry.term.label())
            .unwrap_or_else(|| latest.term.label());
        return format!("{} spiked in {term}", capitalize(metric));
    }
    if find(PatternKind::HighRepeat).is_some() {
        return format!(
            "Repeat rate at {:.0}% in {}",
            latest.repeat_rate * 100.0,
            latest.term
        );
    }
    format!("DFW rate at {rate} in {}", latest.term)
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Min and max section DFW rate in the course's latest term, when the
/// population standard deviation across sections exceeds 5 points.
fn section_spread(analysis: &Analysis, latest: &CourseTermMetrics) -> Option<(f64, f64)> {
    let rates: Vec<f64> = analysis
        .sections
        .iter()
        .filter(|s| s.term == latest.term && s.course_key() == latest.course)
        .map(|s| s.dfw_rate())
        .collect();
    if rates.len() < 2 {
        return None;
    }
    let mean = rates.iter().sum::<f64>() / rates.len() as f64;
    let variance = rates.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / rates.len() as f64;
    if variance.sqrt() <= SECTION_SPREAD_LIMIT {
        return None;
    }
    let low = rates.iter().copied().fold(f64::INFINITY, f64::min);
    let high = rates.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Some((low, high))
}

pub fn summarize<'a>(
    analysis: &'a Analysis,
    flags: &'a [Flag],
    thresholds: &ThresholdConfig,
) -> Vec<CourseFinding<'a>> {
    let mut by_course: BTreeMap<&CourseKey, Vec<&Flag>> = BTreeMap::new();
    for flag in flags {
        by_course.entry(&flag.course).or_default().push(flag);
    }

    let mut findings: Vec<CourseFinding> = by_course
        .into_iter()
        .filter_map(|(course, course_flags)| {
            let latest = analysis.courses.get(course)?.last()?;
            let kinds: BTreeSet<PatternKind> = course_flags.iter().map(|f| f.kind).collect();
            Some(CourseFinding {
                course,
                severity: classify(&kinds, latest.dfw_rate, thresholds),
                headline: headline(&course_flags, latest),
                action: recommended_action(&kinds),
                section_spread: section_spread(analysis, latest),
                kinds,
                latest,
                flags: course_flags,
            })
        })
        .collect();

    findings.sort_by(|a, b| {
        a.severity
            .cmp(&b.severity)
            .then(b.kinds.len().cmp(&a.kinds.len()))
            .then(
                b.latest
                    .dfw_rate
                    .partial_cmp(&a.latest.dfw_rate)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.course.cmp(b.course))
    });
    findings
}

pub fn build_report(
    analysis: &Analysis,
    flags: &[Flag],
    thresholds: &ThresholdConfig,
    config_warnings: &[ConfigWarning],
) -> String {
    let findings = summarize(analysis, flags, thresholds);
    let mut output = String::new();

    let _ = writeln!(output, "# Course Success Patterns Report");
    let _ = writeln!(
        output,
        "Generated {} from worksheet `{}` (run {})",
        analysis.generated_at.format("%Y-%m-%d %H:%M UTC"),
        analysis.sheet,
        analysis.run_id
    );
    let _ = writeln!(output);

    if findings.is_empty() {
        let _ = writeln!(output, "## No Courses Flagged");
        let _ = writeln!(output);
        let _ = writeln!(
            output,
            "No courses met the criteria for flagging with the current thresholds. \
Consider lowering thresholds for a broader scan."
        );
        let _ = writeln!(output);
        write_data_quality(&mut output, analysis, config_warnings);
        return output;
    }

    let _ = writeln!(output, "## Recommended Actions");
    for severity in [Severity::Immediate, Severity::Moderate, Severity::Watch] {
        let tier: Vec<&CourseFinding> = findings.iter().filter(|f| f.severity == severity).collect();
        if tier.is_empty() {
            continue;
        }
        let _ = writeln!(output);
        let _ = writeln!(output, "### {} ({})", severity.heading(), tier.len());
        for finding in tier {
            let _ = writeln!(output, "- **{}**: {}", finding.course, finding.headline);
            let _ = writeln!(output, "  - *Action:* {}", finding.action);
            if finding.section_spread.is_some() {
                let _ = writeln!(
                    output,
                    "  - *Note:* Compare section-level outcomes by instructor/modality"
                );
            }
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Executive Summary");
    let total = analysis.courses.len();
    let pct = if total == 0 {
        0.0
    } else {
        findings.len() as f64 / total as f64 * 100.0
    };
    let _ = writeln!(
        output,
        "Out of **{} courses** analyzed, **{}** ({:.0}%) were flagged for student success concerns.",
        total,
        findings.len(),
        pct
    );
    let _ = writeln!(output);
    for kind in [
        PatternKind::PersistentHighDfw,
        PatternKind::WorseningTrend,
        PatternKind::Spike,
        PatternKind::HighRepeat,
        PatternKind::CoOccurring,
    ] {
        let count = findings.iter().filter(|f| f.kinds.contains(&kind)).count();
        if count > 0 {
            let _ = writeln!(output, "- {}: {} course(s)", kind.label(), count);
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Supporting Detail");
    for (rank, finding) in findings.iter().enumerate() {
        let history = analysis.courses.get(finding.course).map(Vec::as_slice).unwrap_or(&[]);
        let _ = writeln!(output);
        let _ = writeln!(output, "### {}. {}", rank + 1, finding.course);
        let _ = writeln!(
            output,
            "- **Latest DFW rate:** {:.1}% ({})",
            finding.latest.dfw_rate * 100.0,
            finding.latest.term
        );
        let _ = writeln!(
            output,
            "- **Sections:** {} ({} students)",
            finding.latest.num_sections, finding.latest.enrollment
        );
        if !history.is_empty() {
            let mean = history.iter().map(|m| m.dfw_rate).sum::<f64>() / history.len() as f64;
            let _ = writeln!(
                output,
                "- **Historical DFW rate:** {:.1}% (across {} terms)",
                mean * 100.0,
                history.len()
            );
        }
        let _ = writeln!(output, "- **Findings:**");
        for flag in &finding.flags {
            let _ = writeln!(output, "  - {}: {}", flag.kind, flag.detail);
        }
        if let Some((low, high)) = finding.section_spread {
            let _ = writeln!(
                output,
                "- **Section variation:** DFW rates range from {:.1}% to {:.1}% across sections; \
the issue may be concentrated in specific sections.",
                low * 100.0,
                high * 100.0
            );
        }
    }

    let _ = writeln!(output);
    write_data_quality(&mut output, analysis, config_warnings);
    output
}

fn write_data_quality(output: &mut String, analysis: &Analysis, config_warnings: &[ConfigWarning]) {
    let diagnostics = &analysis.diagnostics;
    let _ = writeln!(output, "## Data Quality");
    let _ = writeln!(
        output,
        "- {} rows read, {} kept, {} rollup rows removed, {} invalid rows skipped",
        diagnostics.rows_read, diagnostics.rows_kept, diagnostics.rollup_rows, diagnostics.invalid_rows
    );
    if !diagnostics.missing_optional.is_empty() {
        let _ = writeln!(
            output,
            "- Optional columns absent (treated as 0): {}",
            diagnostics.missing_optional.join(", ")
        );
    }
    for warning in diagnostics.warnings.iter().take(10) {
        let _ = writeln!(output, "- Skipped {warning}");
    }
    if diagnostics.warnings.len() > 10 {
        let _ = writeln!(output, "- ... and {} more", diagnostics.warnings.len() - 10);
    }
    for warning in config_warnings {
        let _ = writeln!(output, "- Threshold {warning}");
    }
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

    fn kinds(list: &[PatternKind]) -> BTreeSet<PatternKind> {
        list.iter().copied().collect()
    }

    #[test]
    fn severity_tiers() {
        let thresholds = ThresholdConfig::default();
        assert_eq!(
            classify(&kinds(&[PatternKind::PersistentHighDfw]), 0.3, &thresholds),
            Severity::Immediate
        );
        assert_eq!(
            classify(&kinds(&[PatternKind::Spike, PatternKind::HighRepeat]), 0.1, &thresholds),
            Severity::Immediate
        );
        assert_eq!(
            classify(&kinds(&[PatternKind::HighRepeat]), 0.46, &thresholds),
            Severity::Immediate
        );
        assert_eq!(
            classify(&kinds(&[PatternKind::WorseningTrend]), 0.2, &thresholds),
            Severity::Moderate
        );
        assert_eq!(
            classify(&kinds(&[PatternKind::HighRepeat]), 0.2, &thresholds),
            Severity::Watch
        );
    }

    #[test]
    fn action_follows_priority() {
        assert_eq!(
            recommended_action(&kinds(&[PatternKind::Spike, PatternKind::CoOccurring])),
            "Holistic review with department and advising"
        );
        assert_eq!(
            recommended_action(&kinds(&[PatternKind::Spike])),
            "Determine cause of spike; monitor next term"
        );
        assert_eq!(
            recommended_action(&BTreeSet::new()),
            "Review course data and discuss with department"
        );
    }

    #[test]
    fn report_lists_flagged_course_with_action() {
        let analysis = analysis();
        let thresholds = ThresholdConfig::default();
        let flags = analysis.detect(&thresholds);
        let report = build_report(&analysis, &flags, &thresholds, &[]);

        assert!(report.starts_with("# Course Success Patterns Report"));
        assert!(report.contains("### Act Now (1)"));
        assert!(report.contains("- **MATH 101**: DFW rate at 35% for 3 consecutive terms"));
        assert!(report.contains("Out of **2 courses** analyzed, **1** (50%)"));
        assert!(!report.contains("BIO 200**"));
        assert!(report.contains("1 invalid rows skipped"));
        assert!(report.contains(&analysis.run_id.to_string()));
    }

    #[test]
    fn empty_report_says_so() {
        let analysis = analysis();
        let report = build_report(&analysis, &[], &ThresholdConfig::default(), &[]);
        assert!(report.contains("## No Courses Flagged"));
        assert!(report.contains("## Data Quality"));
        assert!(!report.contains("- Threshold "));
    }

    #[test]
    fn threshold_warnings_reach_data_quality() {
        let analysis = analysis();
        let (thresholds, warnings) = ThresholdConfig::from_named([("trend_min_delta", "-0.1")]);
        let flags = analysis.detect(&thresholds);
        let report = build_report(&analysis, &flags, &thresholds, &warnings);
        let quality = &report[report.find("## Data Quality").unwrap()..];
        assert!(quality.contains(
            "- Threshold trend_min_delta = `-0.1` ignored (negative value); keeping 0.05"
        ));
    }

    #[test]
    fn section_spread_reports_range() {
        let analysis = analysis();
        let latest = analysis.courses[&CourseKey::new("MATH", "101")]
            .iter()
            .find(|m| m.term.label() == "Fall 2022")
            .unwrap();
        // 11/30 vs 10/30 is well inside the spread limit.
        assert_eq!(section_spread(&analysis, latest), None);

        let mut skewed = analysis.clone();
        for section in skewed.sections.iter_mut() {
            if section.term.label() == "Fall 2022" && section.section_number == "002" {
                section.dfw = 1;
            }
        }
        let (low, high) = section_spread(&skewed, latest).unwrap();
        assert!((low - 1.0 / 30.0).abs() < 1e-12);
        assert!((high - 11.0 / 30.0).abs() < 1e-12);
    }
}
