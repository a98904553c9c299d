use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info, warn};

use crate::error::{RowIssue, RowWarning, SchemaError};
use crate::models::{Diagnostics, SectionRecord};
use crate::sheet::{RawRow, RawTable};
use crate::term::Term;

/// Logical columns of the Section Attrition & Grade export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    Term,
    Subject,
    CatalogNumber,
    SectionNumber,
    Enrollment,
    Graded,
    Dfw,
    Dropped,
    Repeats,
    Incomplete,
    ExtendedIncomplete,
    PermanentIncomplete,
    LapsedIncomplete,
}

impl Field {
    pub const REQUIRED: [Field; 8] = [
        Field::Term,
        Field::Subject,
        Field::CatalogNumber,
        Field::SectionNumber,
        Field::Enrollment,
        Field::Graded,
        Field::Dfw,
        Field::Dropped,
    ];

    pub const OPTIONAL: [Field; 5] = [
        Field::Repeats,
        Field::Incomplete,
        Field::ExtendedIncomplete,
        Field::PermanentIncomplete,
        Field::LapsedIncomplete,
    ];

    pub fn header(self) -> &'static str {
        match self {
            Field::Term => "Term Description",
            Field::Subject => "Subject",
            Field::CatalogNumber => "Catalog Number",
            Field::SectionNumber => "Section Number",
            Field::Enrollment => "Official Class Enrollments",
            Field::Graded => "Tot. # Grades used for DFW Rate Analysis",
            Field::Dfw => "Ds,Fs,Ws used for DFW Rate Analysis",
            Field::Dropped => "Dropped",
            Field::Repeats => "Repeats",
            Field::Incomplete => "Incomplete (I)",
            Field::ExtendedIncomplete => "Extended Incomplete (EI)",
            Field::PermanentIncomplete => "Permanent Incomplete (PI)",
            Field::LapsedIncomplete => "Incomplete lapsed to F (@F)",
        }
    }

    /// Snake-case name used on the command line, e.g. `catalog_number`.
    pub fn name(self) -> &'static str {
        match self {
            Field::Term => "term",
            Field::Subject => "subject",
            Field::CatalogNumber => "catalog_number",
            Field::SectionNumber => "section_number",
            Field::Enrollment => "enrollment",
            Field::Graded => "graded",
            Field::Dfw => "dfw",
            Field::Dropped => "dropped",
            Field::Repeats => "repeats",
            Field::Incomplete => "incomplete",
            Field::ExtendedIncomplete => "extended_incomplete",
            Field::PermanentIncomplete => "permanent_incomplete",
            Field::LapsedIncomplete => "lapsed_incomplete",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Field::REQUIRED
            .iter()
            .chain(Field::OPTIONAL.iter())
            .copied()
            .find(|field| field.name().eq_ignore_ascii_case(name.trim()))
    }

    pub fn is_required(self) -> bool {
        Field::REQUIRED.contains(&self)
    }
}

/// Accepted header spellings per logical field.
#[derive(Debug, Clone)]
pub struct ColumnMap {
    aliases: HashMap<Field, Vec<String>>,
}

impl Default for ColumnMap {
    fn default() -> Self {
        let aliases = Field::REQUIRED
            .iter()
            .chain(Field::OPTIONAL.iter())
            .map(|field| (*field, vec![field.header().to_string()]))
            .collect();
        ColumnMap { aliases }
    }
}

impl ColumnMap {
    pub fn with_alias(mut self, field: Field, header: impl Into<String>) -> Self {
        self.aliases.entry(field).or_default().push(header.into());
        self
    }

    /// Matches fields to sheet headers, trimmed and case-insensitively.
    pub fn resolve(&self, headers: &[String]) -> Result<ResolvedColumns, SchemaError> {
        let mut columns = HashMap::new();
        let mut missing_required = Vec::new();
        let mut missing_optional = Vec::new();

        for field in Field::REQUIRED.iter().chain(Field::OPTIONAL.iter()) {
            let found = self.aliases.get(field).and_then(|aliases| {
                aliases.iter().find_map(|alias| {
                    headers
                        .iter()
                        .find(|header| header.trim().eq_ignore_ascii_case(alias.trim()))
                })
            });

            match found {
                Some(header) => {
                    columns.insert(*field, header.clone());
                }
                None if field.is_required() => missing_required.push(field.header().to_string()),
                None => missing_optional.push(*field),
            }
        }

        if !missing_required.is_empty() {
            return Err(SchemaError::MissingColumns {
                columns: missing_required,
            });
        }

        Ok(ResolvedColumns {
            columns,
            missing_optional,
        })
    }
}

/// clap parser for `field=Header Text`.
pub fn parse_alias(input: &str) -> Result<(Field, String), String> {
    let (name, header) = input
        .split_once('=')
        .ok_or_else(|| format!("expected FIELD=HEADER, got `{input}`"))?;
    let field = Field::from_name(name).ok_or_else(|| format!("unknown column field `{}`", name.trim()))?;
    if header.trim().is_empty() {
        return Err(format!("empty header for `{}`", field.name()));
    }
    Ok((field, header.trim().to_string()))
}

#[derive(Debug, Clone)]
pub struct ResolvedColumns {
    columns: HashMap<Field, String>,
    pub missing_optional: Vec<Field>,
}

impl ResolvedColumns {
    fn cell<'a>(&self, row: &'a RawRow, field: Field) -> Option<&'a str> {
        self.columns
            .get(&field)
            .and_then(|header| row.get(header))
            .map(|value| value.trim())
    }
}

#[derive(Debug, Clone, Default)]
pub struct NormalizeOptions {
    /// Also drop embedded totals whose enrollment equals the sum of their siblings.
    pub detect_sum_rollups: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub records: Vec<SectionRecord>,
    pub diagnostics: Diagnostics,
}

pub fn normalize(
    table: &RawTable,
    columns: &ColumnMap,
    options: &NormalizeOptions,
) -> Result<Normalized, SchemaError> {
    let resolved = columns.resolve(&table.headers)?;
    let mut diagnostics = Diagnostics {
        rows_read: table.rows.len(),
        missing_optional: resolved
            .missing_optional
            .iter()
            .map(|field| field.header().to_string())
            .collect(),
        ..Diagnostics::default()
    };

    for header in &diagnostics.missing_optional {
        debug!(column = %header, "optional column absent, defaulting to 0");
    }

    let mut records = Vec::with_capacity(table.rows.len());
    for (index, row) in table.rows.iter().enumerate() {
        let row_number = index + 2;

        if is_rollup(&resolved, row) {
            diagnostics.rollup_rows += 1;
            continue;
        }

        match build_record(&resolved, row, row_number) {
            Ok(record) => records.push(record),
            Err(warnings) => {
                for warning in &warnings {
                    warn!(sheet = %table.sheet, "dropping row: {warning}");
                }
                diagnostics.invalid_rows += 1;
                diagnostics.warnings.extend(warnings);
            }
        }
    }

    if options.detect_sum_rollups {
        let removed = remove_sum_rollups(&mut records);
        diagnostics.sum_rollup_rows = removed;
        diagnostics.rollup_rows += removed;
    }

    diagnostics.rows_kept = records.len();
    info!(
        sheet = %table.sheet,
        rows_read = diagnostics.rows_read,
        rollup_rows = diagnostics.rollup_rows,
        invalid_rows = diagnostics.invalid_rows,
        rows_kept = diagnostics.rows_kept,
        "normalized section rows"
    );

    Ok(Normalized {
        records,
        diagnostics,
    })
}

fn is_total(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("total")
}

fn is_rollup(columns: &ResolvedColumns, row: &RawRow) -> bool {
    let subject = columns.cell(row, Field::Subject).unwrap_or("");
    let catalog = columns.cell(row, Field::CatalogNumber).unwrap_or("");
    let section = columns.cell(row, Field::SectionNumber).unwrap_or("");

    is_total(subject) || catalog.is_empty() || is_total(catalog) || section.is_empty() || is_total(section)
}

/// Largest count accepted from a cell; every whole number up to here is
/// exactly representable as `f64`.
pub const MAX_COUNT: u64 = 1 << 53;

/// Parses a count cell. Accepts "1,234" and whole-valued decimals such as "30.0".
pub fn parse_count(raw: &str) -> Result<u64, RowIssue> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() {
        return Err(RowIssue::Blank);
    }
    let value: f64 = cleaned.parse().map_err(|_| RowIssue::NotNumeric)?;
    if !value.is_finite() {
        return Err(RowIssue::NotNumeric);
    }
    if value < 0.0 {
        return Err(RowIssue::Negative);
    }
    if value > MAX_COUNT as f64 {
        return Err(RowIssue::TooLarge);
    }
    if (value - value.round()).abs() > 1e-9 {
        return Err(RowIssue::NotWholeNumber);
    }
    Ok(value.round() as u64)
}

fn build_record(
    columns: &ResolvedColumns,
    row: &RawRow,
    row_number: usize,
) -> Result<SectionRecord, Vec<RowWarning>> {
    let mut warnings = Vec::new();

    let mut text = |field: Field| -> String {
        let value = columns.cell(row, field).unwrap_or("");
        if value.is_empty() {
            warnings.push(RowWarning {
                row: row_number,
                field: field.header().to_string(),
                value: String::new(),
                issue: RowIssue::Blank,
            });
        }
        value.to_string()
    };
    let term = text(Field::Term);
    let subject = text(Field::Subject);
    let catalog_number = text(Field::CatalogNumber);
    let section_number = text(Field::SectionNumber);

    let mut required = |field: Field| -> u64 {
        let value = columns.cell(row, field).unwrap_or("");
        match parse_count(value) {
            Ok(count) => count,
            Err(issue) => {
                warnings.push(RowWarning {
                    row: row_number,
                    field: field.header().to_string(),
                    value: value.to_string(),
                    issue,
                });
                0
            }
        }
    };
    let enrollment = required(Field::Enrollment);
    let graded = required(Field::Graded);
    let dfw = required(Field::Dfw);
    let dropped = required(Field::Dropped);

    if warnings.is_empty() && dfw > graded {
        warnings.push(RowWarning {
            row: row_number,
            field: Field::Dfw.header().to_string(),
            value: dfw.to_string(),
            issue: RowIssue::DfwExceedsGraded,
        });
    }

    if !warnings.is_empty() {
        return Err(warnings);
    }

    let optional = |field: Field| -> u64 {
        columns
            .cell(row, field)
            .and_then(|value| parse_count(value).ok())
            .unwrap_or(0)
    };

    Ok(SectionRecord {
        term: Term::parse(&term),
        subject,
        catalog_number,
        section_number,
        enrollment,
        graded,
        dfw,
        dropped,
        repeats: optional(Field::Repeats),
        incomplete: optional(Field::Incomplete),
        extended_incomplete: optional(Field::ExtendedIncomplete),
        permanent_incomplete: optional(Field::PermanentIncomplete),
        lapsed_incomplete: optional(Field::LapsedIncomplete),
    })
}

/// Drops rows whose enrollment equals the sum of the other rows in the same
/// (term, subject, catalog) group. Only groups of three or more rows are
/// considered, and a group with more than one candidate is left untouched.
fn remove_sum_rollups(records: &mut Vec<SectionRecord>) -> usize {
    let mut groups: BTreeMap<(Term, String, String), Vec<usize>> = BTreeMap::new();
    for (index, record) in records.iter().enumerate() {
        groups
            .entry((
                record.term.clone(),
                record.subject.clone(),
                record.catalog_number.clone(),
            ))
            .or_default()
            .push(index);
    }

    let mut rollups = Vec::new();
    for ((term, subject, catalog), members) in groups {
        if members.len() < 3 {
            continue;
        }
        let course = format!("{subject} {catalog}");
        let total = members
            .iter()
            .fold(0u64, |sum, i| sum.saturating_add(records[*i].enrollment));
        let candidates: Vec<usize> = members
            .iter()
            .copied()
            .filter(|i| {
                let enrollment = records[*i].enrollment;
                enrollment > 0 && enrollment.checked_mul(2) == Some(total)
            })
            .collect();

        match candidates.as_slice() {
            [single] => {
                debug!(
                    term = %term,
                    course = %course,
                    section = %records[*single].section_number,
                    "removing embedded total row"
                );
                rollups.push(*single);
            }
            [] => {}
            _ => debug!(
                term = %term,
                course = %course,
                "ambiguous embedded total, keeping all sections"
            ),
        }
    }

    let removed = rollups.len();
    if removed > 0 {
        let mut index = 0;
        records.retain(|_| {
            let keep = !rollups.contains(&index);
            index += 1;
            keep
        });
    }
    removed
}
