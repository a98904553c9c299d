use std::collections::BTreeMap;

use tracing::info;

use crate::models::{CourseKey, CourseMetrics, CourseTermMetrics, SectionRecord};
use crate::term::Term;

/// `numerator / denominator`, or 0 when the denominator is 0.
pub fn safe_rate(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

impl SectionRecord {
    pub fn dfw_rate(&self) -> f64 {
        safe_rate(self.dfw, self.graded)
    }

    pub fn drop_rate(&self) -> f64 {
        safe_rate(self.dropped, self.enrollment)
    }

    pub fn incomplete_rate(&self) -> f64 {
        safe_rate(self.incomplete_family(), self.enrollment)
    }

    pub fn repeat_rate(&self) -> f64 {
        safe_rate(self.repeats, self.enrollment)
    }
}

#[derive(Debug, Default)]
struct Totals {
    sections: usize,
    enrollment: u64,
    graded: u64,
    dfw: u64,
    dropped: u64,
    repeats: u64,
    incomplete: u64,
    lapsed: u64,
}

impl Totals {
    fn add(&mut self, record: &SectionRecord) {
        self.sections += 1;
        self.enrollment = self.enrollment.saturating_add(record.enrollment);
        self.graded = self.graded.saturating_add(record.graded);
        self.dfw = self.dfw.saturating_add(record.dfw);
        self.dropped = self.dropped.saturating_add(record.dropped);
        self.repeats = self.repeats.saturating_add(record.repeats);
        self.incomplete = self.incomplete.saturating_add(record.incomplete_family());
        self.lapsed = self.lapsed.saturating_add(record.lapsed_incomplete);
    }

    fn into_metrics(self, course: CourseKey, term: Term) -> CourseTermMetrics {
        CourseTermMetrics {
            course,
            term,
            num_sections: self.sections,
            enrollment: self.enrollment,
            graded: self.graded,
            dfw: self.dfw,
            dropped: self.dropped,
            repeats: self.repeats,
            incomplete: self.incomplete,
            lapsed: self.lapsed,
            dfw_rate: safe_rate(self.dfw, self.graded),
            drop_rate: safe_rate(self.dropped, self.enrollment),
            incomplete_rate: safe_rate(self.incomplete, self.enrollment),
            repeat_rate: safe_rate(self.repeats, self.enrollment),
            lapsed_rate: safe_rate(self.lapsed, self.enrollment),
        }
    }
}

/// Sums sections into one row per (course, term); each course's history
/// comes back in chronological term order.
pub fn aggregate(records: &[SectionRecord]) -> CourseMetrics {
    let mut groups: BTreeMap<(CourseKey, Term), Totals> = BTreeMap::new();
    for record in records {
        groups
            .entry((record.course_key(), record.term.clone()))
            .or_default()
            .add(record);
    }

    let course_terms = groups.len();
    let mut courses = CourseMetrics::new();
    for ((course, term), totals) in groups {
        courses
            .entry(course.clone())
            .or_default()
            .push(totals.into_metrics(course, term));
    }

    info!(
        sections = records.len(),
        course_terms,
        courses = courses.len(),
        "aggregated course-term metrics"
    );
    courses
}
