//! Rule-based detection over each course's chronological metrics.
//!
//! Rules A–D run independently on the same history. Co-occurrence (E) is a
//! second pass over the flags those rules produced for the same course.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info};

use crate::config::ThresholdConfig;
use crate::models::{CourseKey, CourseMetrics, CourseTermMetrics, Flag, Metric, PatternKind, TermRate};
use crate::term::Term;

/// Absorbs float noise in rate comparisons such as 0.35 - 0.20 >= 0.15.
const EPSILON: f64 = 1e-9;

const TREND_METRICS: [Metric; 2] = [Metric::Dfw, Metric::Drop];
const SPIKE_METRICS: [Metric; 3] = [Metric::Dfw, Metric::Drop, Metric::Incomplete];
const MIN_SPIKE_HISTORY: usize = 2;

fn at_least(value: f64, threshold: f64) -> bool {
    value + EPSILON >= threshold
}

/// A level test: the rate is non-zero and reaches the threshold.
fn meets(rate: f64, threshold: f64) -> bool {
    rate > 0.0 && at_least(rate, threshold)
}

fn evidence(window: &[&CourseTermMetrics], metric: Metric) -> Vec<TermRate> {
    window
        .iter()
        .map(|m| TermRate {
            term: m.term.clone(),
            rate: m.rate(metric),
        })
        .collect()
}

fn pct(rate: f64) -> String {
    format!("{:.1}%", rate * 100.0)
}

pub fn detect(courses: &CourseMetrics, thresholds: &ThresholdConfig) -> Vec<Flag> {
    let mut flags = Vec::new();
    let mut latest_terms: HashMap<CourseKey, Term> = HashMap::new();

    for (course, all_terms) in courses {
        let history: Vec<&CourseTermMetrics> = all_terms
            .iter()
            .filter(|m| m.enrollment >= thresholds.min_enrollment)
            .collect();
        let Some(latest) = history.last() else {
            continue;
        };
        latest_terms.insert(course.clone(), latest.term.clone());

        let mut course_flags = independent_flags(course, &history, thresholds);
        if let Some(meta) = co_occurring(course, &history, &course_flags) {
            course_flags.push(meta);
        }
        debug!(course = %course, flags = course_flags.len(), "evaluated course");
        flags.extend(course_flags);
    }

    if thresholds.recency_terms > 0 {
        flags = drop_stale(courses, flags, &latest_terms, thresholds.recency_terms);
    }

    info!(
        courses = courses.len(),
        flags = flags.len(),
        "pattern detection finished"
    );
    flags
}

/// Rules A–D, in a fixed order so output is deterministic.
fn independent_flags(
    course: &CourseKey,
    history: &[&CourseTermMetrics],
    thresholds: &ThresholdConfig,
) -> Vec<Flag> {
    let mut flags = Vec::new();
    flags.extend(persistent_high_dfw(course, history, thresholds));
    for metric in TREND_METRICS {
        flags.extend(worsening_trend(course, history, metric, thresholds));
    }
    for metric in SPIKE_METRICS {
        flags.extend(spikes(course, history, metric, thresholds));
    }
    flags.extend(high_repeat(course, history, thresholds));
    flags
}

/// Rule A: the most recent terms form an unbroken high-DFW streak.
pub fn persistent_high_dfw(
    course: &CourseKey,
    history: &[&CourseTermMetrics],
    thresholds: &ThresholdConfig,
) -> Option<Flag> {
    let min_terms = thresholds.persistent_min_terms;
    if min_terms == 0 || history.len() < min_terms {
        return None;
    }

    let streak = history
        .iter()
        .rev()
        .take_while(|m| meets(m.dfw_rate, thresholds.high_dfw_threshold))
        .count();
    if streak < min_terms {
        return None;
    }

    let window = &history[history.len() - streak..];
    let mean = window.iter().map(|m| m.dfw_rate).sum::<f64>() / streak as f64;
    let first = &window[0].term;
    let last = &window[streak - 1].term;

    Some(Flag {
        course: course.clone(),
        kind: PatternKind::PersistentHighDfw,
        metric: Some(Metric::Dfw),
        evidence: evidence(window, Metric::Dfw),
        magnitude: mean,
        detail: format!(
            "DFW rate at or above {} for {} consecutive terms ({} to {}), averaging {}",
            pct(thresholds.high_dfw_threshold),
            streak,
            first,
            last,
            pct(mean)
        ),
    })
}

/// First-to-last rise over the trailing `window` values, if they never dip
/// and the rise is at least `min_delta`.
pub fn monotonic_rise(values: &[f64], window: usize, min_delta: f64) -> Option<f64> {
    if window < 2 || values.len() < window {
        return None;
    }
    let tail = &values[values.len() - window..];
    let non_decreasing = tail.windows(2).all(|pair| pair[1] + EPSILON >= pair[0]);
    let delta = tail[window - 1] - tail[0];
    if non_decreasing && delta > EPSILON && at_least(delta, min_delta) {
        Some(delta)
    } else {
        None
    }
}

/// Rule B, evaluated separately per metric.
pub fn worsening_trend(
    course: &CourseKey,
    history: &[&CourseTermMetrics],
    metric: Metric,
    thresholds: &ThresholdConfig,
) -> Option<Flag> {
    let values: Vec<f64> = history.iter().map(|m| m.rate(metric)).collect();
    let delta = monotonic_rise(&values, thresholds.trend_window, thresholds.trend_min_delta)?;
    let window = &history[history.len() - thresholds.trend_window..];

    Some(Flag {
        course: course.clone(),
        kind: PatternKind::WorseningTrend,
        metric: Some(metric),
        evidence: evidence(window, metric),
        magnitude: delta,
        detail: format!(
            "{} rising over the last {} terms ({} to {}): {} to {}",
            metric.label(),
            window.len(),
            window[0].term,
            window[window.len() - 1].term,
            pct(window[0].rate(metric)),
            pct(window[window.len() - 1].rate(metric))
        ),
    })
}

/// Rule C: every term whose rate exceeds the average of all prior terms by at
/// least `spike_delta`. Each spike is its own flag.
pub fn spikes(
    course: &CourseKey,
    history: &[&CourseTermMetrics],
    metric: Metric,
    thresholds: &ThresholdConfig,
) -> Vec<Flag> {
    let mut flags = Vec::new();
    let mut prior_sum: f64 = history
        .iter()
        .take(MIN_SPIKE_HISTORY)
        .map(|m| m.rate(metric))
        .sum();

    for index in MIN_SPIKE_HISTORY..history.len() {
        let current = history[index];
        let rate = current.rate(metric);
        let trailing = prior_sum / index as f64;
        let excess = rate - trailing;
        prior_sum += rate;

        if excess > EPSILON && at_least(excess, thresholds.spike_delta) {
            flags.push(Flag {
                course: course.clone(),
                kind: PatternKind::Spike,
                metric: Some(metric),
                evidence: evidence(&history[index..=index], metric),
                magnitude: excess,
                detail: format!(
                    "{} spiked to {} in {}, against a trailing average of {}",
                    metric.label(),
                    pct(rate),
                    current.term,
                    pct(trailing)
                ),
            });
        }
    }
    flags
}

/// Rule D: high repeat rate in the latest term, or a rising repeat rate.
pub fn high_repeat(
    course: &CourseKey,
    history: &[&CourseTermMetrics],
    thresholds: &ThresholdConfig,
) -> Option<Flag> {
    let latest = history.last()?;
    let values: Vec<f64> = history.iter().map(|m| m.repeat_rate).collect();
    let level = meets(latest.repeat_rate, thresholds.high_repeat_threshold);
    let rise = monotonic_rise(&values, thresholds.trend_window, thresholds.trend_min_delta);

    let (window, detail) = match (level, rise) {
        (false, None) => return None,
        (true, None) => (
            &history[history.len() - 1..],
            format!(
                "repeat rate {} in {} is at or above {}",
                pct(latest.repeat_rate),
                latest.term,
                pct(thresholds.high_repeat_threshold)
            ),
        ),
        (level, Some(delta)) => {
            let window = &history[history.len() - thresholds.trend_window..];
            let mut detail = format!(
                "repeat rate rising by {} over the last {} terms",
                pct(delta),
                window.len()
            );
            if level {
                detail.push_str(&format!(
                    ", now {} (at or above {})",
                    pct(latest.repeat_rate),
                    pct(thresholds.high_repeat_threshold)
                ));
            }
            (window, detail)
        }
    };

    Some(Flag {
        course: course.clone(),
        kind: PatternKind::HighRepeat,
        metric: Some(Metric::Repeat),
        evidence: evidence(window, Metric::Repeat),
        magnitude: latest.repeat_rate,
        detail,
    })
}

/// Rule E: two or more distinct kinds among `flags` cite the latest term.
pub fn co_occurring(course: &CourseKey, history: &[&CourseTermMetrics], flags: &[Flag]) -> Option<Flag> {
    let latest = history.last()?;
    let kinds: BTreeSet<PatternKind> = flags
        .iter()
        .filter(|flag| flag.kind != PatternKind::CoOccurring && flag.covers(&latest.term))
        .map(|flag| flag.kind)
        .collect();
    if kinds.len() < 2 {
        return None;
    }

    let names: Vec<&str> = kinds.iter().map(|kind| kind.label()).collect();
    Some(Flag {
        course: course.clone(),
        kind: PatternKind::CoOccurring,
        metric: None,
        evidence: vec![TermRate {
            term: latest.term.clone(),
            rate: latest.dfw_rate,
        }],
        magnitude: kinds.len() as f64,
        detail: format!(
            "{} issues co-occur in {}: {}",
            kinds.len(),
            latest.term,
            names.join(", ")
        ),
    })
}

fn drop_stale(
    courses: &CourseMetrics,
    flags: Vec<Flag>,
    latest_terms: &HashMap<CourseKey, Term>,
    recency_terms: usize,
) -> Vec<Flag> {
    let all_terms: BTreeSet<&Term> = courses.values().flatten().map(|m| &m.term).collect();
    let position: HashMap<&Term, usize> = all_terms
        .iter()
        .enumerate()
        .map(|(index, term)| (*term, index))
        .collect();
    let newest = all_terms.len().saturating_sub(1);

    flags
        .into_iter()
        .filter(|flag| {
            let offered = latest_terms
                .get(&flag.course)
                .and_then(|term| position.get(term))
                .copied()
                .unwrap_or(0);
            newest - offered < recency_terms
        })
        .collect()
}
