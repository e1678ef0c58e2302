use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};

use super::{Listing, Paging, SiteAdapter};
use crate::parser::fields::{
    attr, first, is_hidden, section_text, text_of, ExtractError, FieldResult, FieldSet,
};
use crate::store::IdentityKey;

const ENTRY_URL: &str = "https://secure.lni.wa.gov/verify/";

const LAYOUT: &str = ".itemLayout";
const LICENSE: &str = "#WholeLicense";

/// Owner and address block of the detail page.
const PRIMARY: &[(&str, &str)] = &[
    ("owner_name", "span#BusinesOwnersName"),
    ("owner_first_name", "span#BusinesOwnersFirstName"),
    ("owner_last_name", "span#BusinesOwnersLastName"),
    ("principal_name", "span#principalName"),
    ("doing_business_as", "span#BusinessDbaName"),
    ("address1", "span#Address1"),
    ("unit", "span.data-item"),
    ("city", "span#City"),
    ("state", "span#State"),
    ("zip", "span#Zip"),
    ("phone_number", "span#PhoneNumber"),
    ("county", "span#CountyName"),
    ("ubi_number", "span#UBINumber"),
    ("business_type", "span#BusinessType"),
];

static PAGE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("body").unwrap());
static LAYOUT_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse(LAYOUT).unwrap());
static LICENSE_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse(LICENSE).unwrap());
static ITEMS_TOTAL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("span#itemsTotal").unwrap());

/// Washington L&I contractor lookup: one detail page per result row.
pub struct Washington;

impl SiteAdapter for Washington {
    fn name(&self) -> &'static str {
        "washington"
    }

    fn entry_url(&self) -> &'static str {
        ENTRY_URL
    }

    fn listing(&self) -> Listing {
        Listing::Detail {
            row: ".itemSingleCol",
        }
    }

    fn paging(&self) -> Paging {
        Paging::ClickNext {
            control: ".nextButton",
        }
    }

    fn identity(&self) -> IdentityKey {
        IdentityKey::CityAddress
    }

    fn fragment_selector(&self) -> &Selector {
        &PAGE
    }

    fn declared_total(&self, page: &Html) -> Option<usize> {
        page.select(&ITEMS_TOTAL)
            .next()
            .map(text_of)
            .and_then(|t| t.replace(',', "").trim().parse().ok())
    }

    fn extract_primary(&self, fragment: ElementRef, fields: &mut FieldSet) -> Result<(), ExtractError> {
        let layout = fragment.select(&LAYOUT_SEL).next();
        if layout.is_none() && fragment.select(&LICENSE_SEL).next().is_none() {
            return Err(ExtractError::MalformedFragment(format!(
                "neither {LAYOUT} nor {LICENSE} present"
            )));
        }
        for (name, css) in PRIMARY {
            fields.text(name, section_text(layout, LAYOUT, css));
        }
        Ok(())
    }

    fn extract_secondary(&self, fragment: ElementRef, fields: &mut FieldSet) {
        let license = fragment.select(&LICENSE_SEL).next();
        let span = |css: &str| within_license(license, css);

        fields.text("license_specialty_1", span("span#SpecialtyName1").map(text_of));
        fields.text("license_specialty_2", span("span#SpecialtyName2").and_then(visible).map(text_of));
        fields.text("license_number", span("span#LicenseNumber").map(text_of));
        fields.text("effective_date", span("span#EffectiveDate").map(text_of));
        fields.text("expiration_date", span("span#ExpirationDate").map(text_of));
        fields.text("contractor_registration", span("span#Registration2").map(text_of));
        fields.text(
            "associated_licenses_link",
            span("span#AssociatedLicensesLink")
                .and_then(visible)
                .and_then(|s| first(s, "a#relatedLink"))
                .and_then(|a| attr(a, "href")),
        );
        fields.text(
            "fraud_report_link",
            span("span#FraudLink")
                .and_then(|s| first(s, "a"))
                .and_then(|a| attr(a, "href")),
        );
        fields.text("license_renewal", span("span#LicenseRenewal").map(text_of));
    }
}

fn within_license<'a>(license: Option<ElementRef<'a>>, css: &str) -> FieldResult<ElementRef<'a>> {
    let scope = license.ok_or_else(|| ExtractError::MissingElement(LICENSE.into()))?;
    first(scope, css)
}

fn visible(el: ElementRef) -> FieldResult<ElementRef> {
    if is_hidden(el) {
        Err(ExtractError::MissingElement(format!(
            "{} (hidden)",
            el.value().id().unwrap_or_else(|| el.value().name())
        )))
    } else {
        Ok(el)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::harvest_page;
    use crate::record::SENTINEL;

    fn detail() -> String {
        std::fs::read_to_string("tests/fixtures/washington_detail.html").unwrap()
    }

    #[test]
    fn detail_page_record() {
        let records = harvest_page(&Washington, &detail());
        assert_eq!(records.len(), 1);
        let r = records[0].flatten();
        assert_eq!(r["owner_name"], "ACME BUILDERS LLC");
        assert_eq!(r["owner_first_name"], "JOHN");
        assert_eq!(r["doing_business_as"], "ACME BUILDERS");
        assert_eq!(r["address1"], "456 PINE AVE");
        assert_eq!(r["unit"], "STE 200");
        assert_eq!(r["city"], "SPOKANE");
        assert_eq!(r["state"], "WA");
        assert_eq!(r["zip"], "99201");
        assert_eq!(r["county"], "Spokane");
        assert_eq!(r["ubi_number"], "603 123 456");
        assert_eq!(r["license_specialty_1"], "General");
        assert_eq!(r["license_number"], "ACMEBBL123AB");
        assert_eq!(r["effective_date"], "04/12/2019");
        assert_eq!(r["expiration_date"], "04/12/2027");
        assert_eq!(
            r["fraud_report_link"],
            "https://lni.wa.gov/licensing-permits/contractors/report-fraud"
        );
    }

    #[test]
    fn hidden_spans_are_absent() {
        let r = harvest_page(&Washington, &detail())[0].flatten();
        assert_eq!(r["license_specialty_2"], SENTINEL);
        assert_eq!(r["associated_licenses_link"], SENTINEL);

        let shown = detail()
            .replace(r#"<span id="SpecialtyName2" style="display: none;">"#, r#"<span id="SpecialtyName2">"#)
            .replace(
                r#"<span id="AssociatedLicensesLink" style="display: none;">"#,
                r#"<span id="AssociatedLicensesLink">"#,
            );
        let r = harvest_page(&Washington, &shown)[0].flatten();
        assert_eq!(r["license_specialty_2"], "Electrical");
        assert_eq!(r["associated_licenses_link"], "/verify/related?id=1");
    }

    #[test]
    fn missing_license_block_keeps_owner_fields() {
        let html = detail();
        let start = html.find(r#"<div id="WholeLicense">"#).unwrap();
        let end = start + html[start..].find("</div>").unwrap() + "</div>".len();
        let stripped = format!("{}{}", &html[..start], &html[end..]);

        let records = harvest_page(&Washington, &stripped);
        let r = records[0].flatten();
        assert_eq!(r["owner_name"], "ACME BUILDERS LLC");
        assert_eq!(r["city"], "SPOKANE");
        assert_eq!(r["license_number"], SENTINEL);
        assert_eq!(r["expiration_date"], SENTINEL);
        assert!(records[0].failed_fields().contains(&"license_number".to_string()));
    }

    #[test]
    fn page_without_detail_blocks_is_skipped() {
        let records = harvest_page(&Washington, "<html><body><p>Loading...</p></body></html>");
        assert!(records.is_empty());
    }

    #[test]
    fn items_total() {
        let page = Html::parse_document(r#"<p>Showing <span id="itemsTotal">1,204</span> items</p>"#);
        assert_eq!(Washington.declared_total(&page), Some(1204));
        let page = Html::parse_document("<p>Searching...</p>");
        assert_eq!(Washington.declared_total(&page), None);
    }
}
