use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Serialize, Serializer};

/// Academic period within a year, in calendar order for sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Season {
    Spring,
    Summer,
    Fall,
    Winter,
    Other,
}

impl Season {
    fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "spring" | "sp" => Some(Season::Spring),
            "summer" | "su" => Some(Season::Summer),
            "fall" | "autumn" | "fa" => Some(Season::Fall),
            "winter" | "wi" => Some(Season::Winter),
            _ => None,
        }
    }
}

/// A term description such as "Fall 2023".
///
/// Ordering is chronological: year first, then season, then the label.
/// Descriptions without a recognizable year sort before every dated term.
/// Identity ignores case and runs of whitespace, so "FALL  2023" and
/// "Fall 2023" are the same term; the first spelling seen is displayed.
#[derive(Debug, Clone)]
pub struct Term {
    year: Option<i32>,
    season: Season,
    label: String,
    key: String,
}

impl Term {
    pub fn parse(raw: &str) -> Self {
        let label = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        let mut year = None;
        let mut season = None;

        for token in label.split(|c: char| c.is_whitespace() || c == '-' || c == '/') {
            if token.is_empty() {
                continue;
            }
            if year.is_none() && token.len() == 4 && token.chars().all(|c| c.is_ascii_digit()) {
                year = token.parse().ok();
                continue;
            }
            if season.is_none() {
                season = Season::parse(token);
            }
        }

        Term {
            year,
            season: season.unwrap_or(Season::Other),
            key: label.to_lowercase(),
            label,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl PartialEq for Term {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Term {}

impl Hash for Term {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl Ord for Term {
    fn cmp(&self, other: &Self) -> Ordering {
        self.year
            .cmp(&other.year)
            .then(self.season.cmp(&other.season))
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for Term {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<&str> for Term {
    fn from(raw: &str) -> Self {
        Term::parse(raw)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

impl Serialize for Term {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_season_and_year() {
        let term = Term::parse("  Fall 2023 ");
        assert_eq!(term.year, Some(2023));
        assert_eq!(term.season, Season::Fall);
        assert_eq!(term.label(), "Fall 2023");
    }

    #[test]
    fn orders_across_years_not_lexically() {
        let mut terms: Vec<Term> = ["Fall 2023", "Spring 2024", "Summer 2023", "Spring 2023"]
            .into_iter()
            .map(Term::from)
            .collect();
        terms.sort();
        let labels: Vec<&str> = terms.iter().map(Term::label).collect();
        assert_eq!(
            labels,
            vec!["Spring 2023", "Summer 2023", "Fall 2023", "Spring 2024"]
        );
    }

    #[test]
    fn accepts_year_first_descriptions() {
        assert_eq!(Term::parse("2022 Fall").season, Season::Fall);
        assert!(Term::parse("2022 Fall") < Term::parse("Spring 2023"));
    }

    #[test]
    fn undated_terms_sort_first() {
        assert!(Term::parse("Special Session") < Term::parse("Spring 1999"));
    }

    #[test]
    fn case_and_spacing_do_not_split_a_term() {
        let canonical = Term::parse("Fall 2023");
        for variant in ["FALL 2023", "Fall  2023", " fall\t2023 "] {
            let term = Term::parse(variant);
            assert_eq!(term, canonical, "{variant:?}");
            assert_eq!(term.cmp(&canonical), Ordering::Equal);
        }
        assert_eq!(Term::parse("Fall  2023").label(), "Fall 2023");
        assert_ne!(Term::parse("Fall 2023"), Term::parse("Fall 2023 B"));
    }

    #[test]
    fn serializes_as_label() {
        let json = serde_json::to_string(&Term::parse("Winter 2021")).unwrap();
        assert_eq!(json, "\"Winter 2021\"");
    }
}
