//! Field-level extraction helpers.
//!
//! Every helper returns a [`FieldResult`]; [`FieldSet`] downgrades failures to
//! the sentinel one field at a time so a missing element never blanks its
//! siblings.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Selector};
use thiserror::Error;
use tracing::debug;

use crate::record::{FieldValue, LicenseRecord};

/// Declared total assumed when a page carries no `(N total)` indicator.
pub const DEFAULT_TOTAL: usize = 100;

static TOTAL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\((\d+)\s+total\)").unwrap());
static DATE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{2}/\d{2}/\d{4}").unwrap());
static TR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").unwrap());
static TD: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("no element matching `{0}`")]
    MissingElement(String),
    #[error("`{element}` has no `{attr}` attribute")]
    MissingAttribute { element: String, attr: String },
    #[error("no match for `{0}`")]
    NoMatch(String),
    #[error("invalid selector `{0}`")]
    InvalidSelector(String),
    #[error("malformed fragment: {0}")]
    MalformedFragment(String),
}

pub type FieldResult<T = String> = Result<T, ExtractError>;

/// Accumulates extracted fields, recording which ones failed.
#[derive(Debug, Default)]
pub struct FieldSet {
    fields: Vec<(String, FieldValue)>,
    failed: Vec<String>,
}

impl FieldSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&mut self, name: &str, result: FieldResult) {
        let value = match result {
            Ok(v) => FieldValue::Text(v),
            Err(e) => {
                self.fail(name, &e);
                FieldValue::Missing
            }
        };
        self.fields.push((name.to_string(), value));
    }

    pub fn list(&mut self, name: &str, result: FieldResult<Vec<String>>) {
        let value = match result {
            Ok(items) => FieldValue::List(items),
            Err(e) => {
                self.fail(name, &e);
                FieldValue::List(Vec::new())
            }
        };
        self.fields.push((name.to_string(), value));
    }

    /// Attach a nested group; its failures are reported as `name.field`.
    pub fn group(&mut self, name: &str, group: FieldSet) {
        self.failed
            .extend(group.failed.into_iter().map(|f| format!("{name}.{f}")));
        self.fields
            .push((name.to_string(), FieldValue::Nested(group.fields)));
    }

    pub fn finish(self) -> LicenseRecord {
        LicenseRecord::from_parts(self.fields, self.failed)
    }

    fn fail(&mut self, name: &str, err: &ExtractError) {
        debug!(field = name, error = %err, "field extraction failed");
        self.failed.push(name.to_string());
    }
}

pub fn selector(css: &str) -> FieldResult<Selector> {
    Selector::parse(css).map_err(|_| ExtractError::InvalidSelector(css.to_string()))
}

/// Whitespace-collapsed text content of an element.
pub fn text_of(el: ElementRef) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Non-empty text nodes of an element, one entry per node.
pub fn text_lines(el: ElementRef) -> Vec<String> {
    el.text()
        .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|t| !t.is_empty())
        .collect()
}

pub fn first<'a>(scope: ElementRef<'a>, css: &str) -> FieldResult<ElementRef<'a>> {
    let sel = selector(css)?;
    scope
        .select(&sel)
        .next()
        .ok_or_else(|| ExtractError::MissingElement(css.to_string()))
}

pub fn first_text(scope: ElementRef, css: &str) -> FieldResult {
    first(scope, css).map(text_of)
}

pub fn nth_text(scope: ElementRef, css: &str, n: usize) -> FieldResult {
    let sel = selector(css)?;
    scope
        .select(&sel)
        .nth(n)
        .map(text_of)
        .ok_or_else(|| ExtractError::MissingElement(format!("{css} #{n}")))
}

/// Text of the first match inside an optional section of the page.
pub fn section_text(section: Option<ElementRef>, section_css: &str, css: &str) -> FieldResult {
    let scope = section.ok_or_else(|| ExtractError::MissingElement(section_css.to_string()))?;
    first_text(scope, css)
}

pub fn attr(el: ElementRef, name: &str) -> FieldResult {
    el.value()
        .attr(name)
        .map(str::to_string)
        .ok_or_else(|| ExtractError::MissingAttribute {
            element: el.value().name().to_string(),
            attr: name.to_string(),
        })
}

/// Inline-styled `display: none` elements are treated as absent.
pub fn is_hidden(el: ElementRef) -> bool {
    el.value()
        .attr("style")
        .map(|s| s.replace(' ', "").to_ascii_lowercase().contains("display:none"))
        .unwrap_or(false)
}

/// Rows of the fragment's outermost table, skipping rows of nested tables.
pub fn top_level_rows(fragment: ElementRef) -> Vec<ElementRef> {
    let root = fragment.id();
    fragment
        .select(&TR)
        .filter(|tr| {
            tr.ancestors()
                .take_while(|n| n.id() != root)
                .filter_map(ElementRef::wrap)
                .filter(|e| e.value().name() == "table")
                .count()
                == 1
        })
        .collect()
}

pub fn row<'a>(rows: &[ElementRef<'a>], idx: usize) -> FieldResult<ElementRef<'a>> {
    rows.get(idx)
        .copied()
        .ok_or_else(|| ExtractError::MissingElement(format!("row {idx}")))
}

/// Text of the `n`th cell of a row.
pub fn cell_text(row: ElementRef, n: usize) -> FieldResult {
    row.select(&TD)
        .nth(n)
        .map(text_of)
        .ok_or_else(|| ExtractError::MissingElement(format!("td #{n}")))
}

/// Find the cell labelled `label` and return the text of the cell after it.
pub fn labelled_cell(row: ElementRef, label: &str) -> FieldResult {
    let cell = row
        .select(&TD)
        .find(|td| text_of(*td).starts_with(label))
        .ok_or_else(|| ExtractError::NoMatch(label.to_string()))?;
    cell.next_siblings()
        .find_map(ElementRef::wrap)
        .map(text_of)
        .ok_or_else(|| ExtractError::MissingElement(format!("cell after `{label}`")))
}

/// First and second `NN/NN/NNNN` dates in `text` (issue, expiration).
pub fn date_pair(text: &str) -> (FieldResult, FieldResult) {
    let mut dates = DATE_RE.find_iter(text).map(|m| m.as_str().to_string());
    let issue = dates
        .next()
        .ok_or_else(|| ExtractError::NoMatch("issue date".into()));
    let expiration = dates
        .next()
        .ok_or_else(|| ExtractError::NoMatch("expiration date".into()));
    (issue, expiration)
}

/// `N` from a `(N total)` parenthetical, if present.
pub fn find_total(text: &str) -> Option<usize> {
    TOTAL_RE
        .captures(text)
        .and_then(|caps| caps[1].parse().ok())
}
