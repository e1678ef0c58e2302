use std::cmp::Ordering;

use chrono::NaiveDate;
use serde_json::{Map, Value};

/// Marker stored in place of a value that could not be extracted.
pub const SENTINEL: &str = "N/A";

pub const EXPIRATION_DATE: &str = "expiration_date";
pub const CURRENT_URL: &str = "current_url";
pub const SCRAPE_TIME: &str = "recent_scrape_time";

const KEY_SEP: &str = "_";
const LIST_SEP: &str = "; ";
const DATE_FORMAT: &str = "%m/%d/%Y";

/// A stored record: flattened field name -> string value, in insertion order.
pub type FlatRecord = Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Missing,
    List(Vec<String>),
    Nested(Vec<(String, FieldValue)>),
}

/// One license as extracted from a page, before normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LicenseRecord {
    fields: Vec<(String, FieldValue)>,
    failed: Vec<String>,
}

impl LicenseRecord {
    pub fn from_parts(fields: Vec<(String, FieldValue)>, failed: Vec<String>) -> Self {
        Self { fields, failed }
    }

    /// Names of fields whose extraction failed (nested ones as `group.field`).
    pub fn failed_fields(&self) -> &[String] {
        &self.failed
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Text of a populated field; `None` for missing, empty or non-text values.
    pub fn text(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(FieldValue::Text(t)) if !t.trim().is_empty() => Some(t.as_str()),
            _ => None,
        }
    }

    /// Replace a field in place, or append it when absent.
    pub fn set(&mut self, name: &str, value: FieldValue) {
        match self.fields.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name.to_string(), value)),
        }
    }

    /// Flatten nested groups into `group_field` keys, join lists, and replace
    /// every missing or empty leaf with the sentinel.
    pub fn flatten(&self) -> FlatRecord {
        let mut out = FlatRecord::new();
        flatten_into(&mut out, "", &self.fields);
        out
    }
}

fn flatten_into(out: &mut FlatRecord, prefix: &str, fields: &[(String, FieldValue)]) {
    for (name, value) in fields {
        let key = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}{KEY_SEP}{name}")
        };
        match value {
            FieldValue::Nested(inner) => flatten_into(out, &key, inner),
            FieldValue::List(items) => {
                let items: Vec<&str> = items
                    .iter()
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .collect();
                let joined = if items.is_empty() {
                    SENTINEL.to_string()
                } else {
                    items.join(LIST_SEP)
                };
                out.insert(key, Value::String(joined));
            }
            FieldValue::Text(t) if !t.trim().is_empty() => {
                out.insert(key, Value::String(t.trim().to_string()));
            }
            FieldValue::Text(_) | FieldValue::Missing => {
                out.insert(key, Value::String(SENTINEL.to_string()));
            }
        }
    }
}

/// A field's string value, unless absent or the sentinel.
pub fn present<'a>(record: &'a FlatRecord, key: &str) -> Option<&'a str> {
    record
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty() && *v != SENTINEL)
}

/// Render any JSON leaf as the text written to CSV.
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => SENTINEL.to_string(),
        other => other.to_string(),
    }
}

pub fn parse_us_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT).ok()
}

pub fn expiration_of(record: &FlatRecord) -> Option<NaiveDate> {
    present(record, EXPIRATION_DATE).and_then(parse_us_date)
}

/// Order by expiration date; records without a parseable date always sort last.
pub fn cmp_expiration(a: &FlatRecord, b: &FlatRecord, newest_first: bool) -> Ordering {
    match (expiration_of(a), expiration_of(b)) {
        (Some(x), Some(y)) if newest_first => y.cmp(&x),
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

pub fn sort_by_expiration<R: std::borrow::Borrow<FlatRecord>>(records: &mut [R], newest_first: bool) {
    records.sort_by(|a, b| cmp_expiration(a.borrow(), b.borrow(), newest_first));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_expiration(date: &str) -> FlatRecord {
        let mut r = FlatRecord::new();
        r.insert(EXPIRATION_DATE.into(), Value::String(date.into()));
        r
    }

    #[test]
    fn flatten_nested_lists_and_blanks() {
        let record = LicenseRecord::from_parts(
            vec![
                ("owner_name".into(), FieldValue::Text("  ACME LLC ".into())),
                ("county".into(), FieldValue::Missing),
                ("phone_number".into(), FieldValue::Text(String::new())),
                (
                    "signing_person".into(),
                    FieldValue::List(vec!["JANE DOE".into(), "".into(), "JOHN DOE".into()]),
                ),
                ("aliases".into(), FieldValue::List(vec![])),
                (
                    "ce_requirements".into(),
                    FieldValue::Nested(vec![
                        ("total_required".into(), FieldValue::Text("16".into())),
                        (
                            "current".into(),
                            FieldValue::Nested(vec![("cc".into(), FieldValue::Missing)]),
                        ),
                    ]),
                ),
            ],
            vec![],
        );

        let flat = record.flatten();
        let keys: Vec<&str> = flat.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "owner_name",
                "county",
                "phone_number",
                "signing_person",
                "aliases",
                "ce_requirements_total_required",
                "ce_requirements_current_cc",
            ]
        );
        assert_eq!(flat["owner_name"], "ACME LLC");
        assert_eq!(flat["county"], SENTINEL);
        assert_eq!(flat["phone_number"], SENTINEL);
        assert_eq!(flat["signing_person"], "JANE DOE; JOHN DOE");
        assert_eq!(flat["aliases"], SENTINEL);
        assert_eq!(flat["ce_requirements_current_cc"], SENTINEL);
    }

    #[test]
    fn set_replaces_existing_field() {
        let mut record = LicenseRecord::default();
        record.set(CURRENT_URL, FieldValue::Missing);
        record.set(CURRENT_URL, FieldValue::Text("https://x/1".into()));
        assert_eq!(record.flatten().len(), 1);
        assert_eq!(record.text(CURRENT_URL), Some("https://x/1"));
    }

    #[test]
    fn expiration_sort_puts_missing_last() {
        let mut records = vec![
            with_expiration("03/01/2026"),
            with_expiration(SENTINEL),
            with_expiration("01/01/2025"),
        ];
        sort_by_expiration(&mut records, true);
        let order: Vec<&str> = records
            .iter()
            .map(|r| r[EXPIRATION_DATE].as_str().unwrap())
            .collect();
        assert_eq!(order, vec!["03/01/2026", "01/01/2025", SENTINEL]);

        sort_by_expiration(&mut records, false);
        let order: Vec<&str> = records
            .iter()
            .map(|r| r[EXPIRATION_DATE].as_str().unwrap())
            .collect();
        assert_eq!(order, vec!["01/01/2025", "03/01/2026", SENTINEL]);
    }

    #[test]
    fn unparseable_dates_count_as_missing() {
        assert!(expiration_of(&with_expiration("2026-03-01")).is_none());
        assert!(expiration_of(&FlatRecord::new()).is_none());
        assert_eq!(
            expiration_of(&with_expiration(" 12/31/2027 ")),
            NaiveDate::from_ymd_opt(2027, 12, 31)
        );
    }
}
