pub mod fields;

use scraper::Html;
use tracing::{debug, warn};

use crate::record::LicenseRecord;
use crate::site::SiteAdapter;

/// Parse a rendered page once and extract every record fragment on it, in
/// document order. Fragments that lack the expected structure are skipped.
pub fn harvest_page(site: &dyn SiteAdapter, markup: &str) -> Vec<LicenseRecord> {
    let page = Html::parse_document(markup);
    let fragments = site.locate_fragments(&page);
    let mut records = Vec::with_capacity(fragments.len());

    for (idx, fragment) in fragments.into_iter().enumerate() {
        match site.extract_record(fragment) {
            Ok(record) => {
                if !record.failed_fields().is_empty() {
                    debug!(
                        site = site.name(),
                        fragment = idx,
                        failed = ?record.failed_fields(),
                        "record extracted with missing fields"
                    );
                }
                records.push(record);
            }
            Err(e) => warn!(site = site.name(), fragment = idx, "skipping fragment: {}", e),
        }
    }

    records
}

/// Number of elements matching `css` on a rendered page.
pub fn count_matches(markup: &str, css: &str) -> usize {
    match fields::selector(css) {
        Ok(sel) => Html::parse_document(markup).select(&sel).count(),
        Err(e) => {
            warn!("{}", e);
            0
        }
    }
}
