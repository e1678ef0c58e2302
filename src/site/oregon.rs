use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};

use super::{Listing, Paging, SeedLink, SiteAdapter};
use crate::parser::fields::{
    attr, cell_text, date_pair, find_total, first, first_text, labelled_cell, nth_text, row,
    text_lines, text_of, top_level_rows, ExtractError, FieldResult, FieldSet,
};
use crate::store::IdentityKey;

const ENTRY_URL: &str =
    "https://www4.cbs.state.or.us/exs/all/mylicsearch/index.cfm?fuseaction=search.show_search_name&group_id=30";

const WIDE_CELL: &str = r#"td[colspan="2"]"#;
const FULL_CELL: &str = r#"td[colspan="3"]"#;
const CE_TABLE: &str = r#"table[border="0"][cellpadding="2"][cellspacing="0"]"#;

static FRAGMENTS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.stripe0, div.stripe1").unwrap());
static PAGER_ROW: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("tr.light.bodytext").unwrap());
static TR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").unwrap());
static TABLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("table").unwrap());

/// Oregon CCB license search: striped record blocks, `i=` paging, CE table.
pub struct Oregon;

impl SiteAdapter for Oregon {
    fn name(&self) -> &'static str {
        "oregon"
    }

    fn entry_url(&self) -> &'static str {
        ENTRY_URL
    }

    fn listing(&self) -> Listing {
        Listing::Inline
    }

    fn paging(&self) -> Paging {
        Paging::QueryParam {
            param: "i",
            per_page_param: "items_per_page",
            seed: SeedLink {
                css: "tr.light.bodytext a",
                text: "Next",
            },
        }
    }

    fn identity(&self) -> IdentityKey {
        IdentityKey::Url
    }

    fn fragment_selector(&self) -> &Selector {
        &FRAGMENTS
    }

    fn declared_total(&self, page: &Html) -> Option<usize> {
        page.select(&PAGER_ROW)
            .find_map(|tr| find_total(&text_of(tr)))
            .or_else(|| find_total(&text_of(page.root_element())))
    }

    fn extract_primary(&self, fragment: ElementRef, fields: &mut FieldSet) -> Result<(), ExtractError> {
        let rows = top_level_rows(fragment);
        if rows.is_empty() {
            return Err(ExtractError::MalformedFragment("no record table".into()));
        }

        fields.text("owner_name", row(&rows, 0).and_then(|r| first_text(r, WIDE_CELL)));
        fields.text(
            "license_number",
            row(&rows, 1).and_then(|r| labelled_cell(r, "License/Registration No:")),
        );
        fields.text("license_holder", row(&rows, 1).and_then(|r| first_text(r, WIDE_CELL)));
        fields.text("address1", row(&rows, 2).and_then(|r| cell_text(r, 0)));
        fields.text("city", row(&rows, 3).and_then(|r| cell_text(r, 0)));
        fields.text("license_type", row(&rows, 2).and_then(|r| labelled_cell(r, "Type:")));
        fields.text("business_type", row(&rows, 3).and_then(|r| labelled_cell(r, "Status:")));
        fields.text("phone_number", row(&rows, 4).and_then(|r| cell_text(r, 0)));

        let (issue, expiration) = match row(&rows, 4) {
            Ok(r) => date_pair(&text_of(r)),
            Err(e) => (Err(e.clone()), Err(e)),
        };
        fields.text("issue_date", issue);
        fields.text("expiration_date", expiration);

        fields.text("county", row(&rows, 5).and_then(|r| labelled_cell(r, "County:")));
        let ccb = row(&rows, 5).and_then(|r| first(r, "a"));
        fields.text("ccb_number", ccb.clone().map(text_of));
        fields.text("current_url", ccb.and_then(|a| attr(a, "href")));

        fields.list("signing_person", signing_person(&rows));
        Ok(())
    }

    fn extract_secondary(&self, fragment: ElementRef, fields: &mut FieldSet) {
        let table = first(fragment, CE_TABLE);
        let rows: Vec<ElementRef> = table
            .as_ref()
            .map(|t| t.select(&TR).collect())
            .unwrap_or_default();
        let ce_row = |idx: usize| table.clone().and_then(|_| row(&rows, idx));

        let mut ce = FieldSet::new();
        ce.text("total_required", ce_row(0).and_then(|r| first_text(r, "b")));

        let required = ce_row(1);
        let mut breakdown = FieldSet::new();
        breakdown.text("cc", required.clone().and_then(|r| nth_text(r, "b", 0)));
        breakdown.text("orl", required.clone().and_then(|r| nth_text(r, "b", 1)));
        breakdown.text("cc_description", required.and_then(|r| cell_text(r, 3)));
        ce.group("required_breakdown", breakdown);

        let mut current = FieldSet::new();
        current.text("cc", ce_row(3).and_then(|r| cell_text(r, 1)));
        current.text("cr", ce_row(4).and_then(|r| cell_text(r, 1)));
        current.text("orl", ce_row(5).and_then(|r| cell_text(r, 1)));
        ce.group("current", current);

        let last = table.clone().and_then(|_| {
            rows.last()
                .copied()
                .ok_or_else(|| ExtractError::MissingElement("CE total row".into()))
        });
        ce.text("total_held", last.and_then(|r| cell_text(r, 1)));

        fields.group("ce_requirements", ce);
    }
}

/// Names listed in the full-width cell of the final row, one per line.
fn signing_person(rows: &[ElementRef]) -> FieldResult<Vec<String>> {
    let last = rows
        .last()
        .copied()
        .ok_or_else(|| ExtractError::MissingElement("signing row".into()))?;
    // The CE table also sits in a full-width cell; that row is not a signer list.
    if last.select(&TABLE).next().is_some() {
        return Err(ExtractError::MissingElement("signing row".into()));
    }
    first(last, FULL_CELL).map(text_lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::harvest_page;
    use crate::record::{FlatRecord, SENTINEL};

    fn fixture() -> String {
        std::fs::read_to_string("tests/fixtures/oregon_results.html").unwrap()
    }

    /// The first (complete) record block of the fixture, wrapped as its own page.
    fn single_record_page() -> String {
        let html = fixture();
        let start = html.find(r#"<div class="stripe1">"#).unwrap();
        let end = start + html[start..].find("</div>").unwrap() + "</div>".len();
        format!("<html><body>{}</body></html>", &html[start..end])
    }

    fn extract(page: &str) -> FlatRecord {
        let records = harvest_page(&Oregon, page);
        assert_eq!(records.len(), 1);
        records[0].flatten()
    }

    #[test]
    fn full_record() {
        let r = extract(&single_record_page());
        assert_eq!(r["owner_name"], "ACME BUILDERS LLC");
        assert_eq!(r["license_number"], "CB-201234");
        assert_eq!(r["license_holder"], "JOHN Q DOE");
        assert_eq!(r["address1"], "123 MAIN ST");
        assert_eq!(r["city"], "SALEM, OR 97301");
        assert_eq!(r["license_type"], "Residential General Contractor");
        assert_eq!(r["business_type"], "Active");
        assert_eq!(r["phone_number"], "(503) 555-0100");
        assert_eq!(r["issue_date"], "01/15/2010");
        assert_eq!(r["expiration_date"], "03/01/2026");
        assert_eq!(r["county"], "Marion");
        assert_eq!(r["ccb_number"], "201234");
        assert_eq!(
            r["current_url"],
            "https://search.ccb.state.or.us/search/business_details.aspx?id=201234"
        );
        assert_eq!(
            r["signing_person"],
            "JANE A DOE, MEMBER; JOHN Q DOE, MANAGING MEMBER"
        );
        assert_eq!(r["ce_requirements_total_required"], "16");
        assert_eq!(r["ce_requirements_required_breakdown_cc"], "8");
        assert_eq!(r["ce_requirements_required_breakdown_orl"], "8");
        assert_eq!(
            r["ce_requirements_required_breakdown_cc_description"],
            "Core Curriculum and Oregon Rules and Laws"
        );
        assert_eq!(r["ce_requirements_current_cc"], "4");
        assert_eq!(r["ce_requirements_current_cr"], "2");
        assert_eq!(r["ce_requirements_current_orl"], "6");
        assert_eq!(r["ce_requirements_total_held"], "12");
    }

    #[test]
    fn missing_field_leaves_siblings_untouched() {
        let page = single_record_page();
        let baseline = extract(&page);

        let cases: &[(&str, &str, &[&str])] = &[
            ("County:", "Parish:", &["county"]),
            ("Status:", "Standing:", &["business_type"]),
            ("Expiration Date: 03/01/2026", "Expiration Date: pending", &["expiration_date"]),
            (
                r#"<td colspan="2"><b>ACME BUILDERS LLC</b></td>"#,
                "<td><b>ACME BUILDERS LLC</b></td>",
                &["owner_name"],
            ),
            (
                r#"<a href="https://search.ccb.state.or.us/search/business_details.aspx?id=201234">201234</a>"#,
                "201234",
                &["ccb_number", "current_url"],
            ),
            ("<td><b>16</b></td>", "<td>16</td>", &["ce_requirements_total_required"]),
        ];

        for (needle, replacement, changed) in cases {
            assert!(page.contains(needle), "fixture lacks {needle}");
            let mutated = extract(&page.replacen(needle, replacement, 1));
            assert_eq!(mutated.len(), baseline.len());
            for (key, value) in &baseline {
                if changed.contains(&key.as_str()) {
                    assert_ne!(value, SENTINEL, "{key} should be populated in baseline");
                    assert_eq!(mutated[key], SENTINEL, "{key} should fall back to sentinel");
                } else {
                    assert_eq!(&mutated[key], value, "{key} changed after removing {needle}");
                }
            }
        }
    }

    #[test]
    fn record_without_ce_table() {
        let html = fixture();
        let records = harvest_page(&Oregon, &html);
        let second = records[1].flatten();
        assert_eq!(second["owner_name"], "CASCADE ROOFING INC");
        assert_eq!(second["expiration_date"], "01/01/2025");
        assert_eq!(second["signing_person"], SENTINEL);
        assert_eq!(second["ce_requirements_total_required"], SENTINEL);
        assert_eq!(second["ce_requirements_current_orl"], SENTINEL);
        assert!(records[1]
            .failed_fields()
            .contains(&"ce_requirements.total_held".to_string()));
    }

    #[test]
    fn declared_total_from_pager_row() {
        let page = Html::parse_document(&fixture());
        assert_eq!(Oregon.declared_total(&page), Some(137));

        let bare = Html::parse_document("<html><body><p>No results</p></body></html>");
        assert_eq!(Oregon.declared_total(&bare), None);
    }
}
