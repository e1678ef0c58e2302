pub mod oregon;
pub mod washington;

use clap::ValueEnum;
use scraper::{ElementRef, Html, Selector};

use crate::parser::fields::{ExtractError, FieldSet};
use crate::record::LicenseRecord;
use crate::store::IdentityKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Site {
    /// Paginated result listing with inline records and CE requirements
    Oregon,
    /// Result rows that each open a license detail page
    Washington,
}

impl Site {
    pub fn adapter(self) -> Box<dyn SiteAdapter> {
        match self {
            Site::Oregon => Box::new(oregon::Oregon),
            Site::Washington => Box::new(washington::Washington),
        }
    }
}

/// How records are reached from a results page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listing {
    /// Records are fragments of the results page itself.
    Inline,
    /// Each row matching `row` is clicked to open a detail page holding one record.
    Detail { row: &'static str },
}

/// A link on the first results page whose href seeds query-parameter paging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedLink {
    pub css: &'static str,
    pub text: &'static str,
}

/// How the crawl moves between results pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Paging {
    /// `param` carries the 1-based index of the first item on the page.
    QueryParam {
        param: &'static str,
        per_page_param: &'static str,
        seed: SeedLink,
    },
    /// A "next page" control is clicked.
    ClickNext { control: &'static str },
}

/// Everything the crawl needs to know about one licensing site.
pub trait SiteAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Where an operator starts a manual search.
    fn entry_url(&self) -> &'static str;

    fn listing(&self) -> Listing;

    fn paging(&self) -> Paging;

    fn identity(&self) -> IdentityKey;

    /// Selector matching every record container on a harvested page.
    fn fragment_selector(&self) -> &Selector;

    /// The declared result count, if the page shows one.
    fn declared_total(&self, page: &Html) -> Option<usize>;

    fn extract_primary(&self, fragment: ElementRef, fields: &mut FieldSet) -> Result<(), ExtractError>;

    fn extract_secondary(&self, fragment: ElementRef, fields: &mut FieldSet);

    fn locate_fragments<'a>(&self, page: &'a Html) -> Vec<ElementRef<'a>> {
        page.select(self.fragment_selector()).collect()
    }

    /// Field failures are absorbed into the record; only a fragment without
    /// the expected structure is an error.
    fn extract_record(&self, fragment: ElementRef) -> Result<LicenseRecord, ExtractError> {
        let mut fields = FieldSet::new();
        self.extract_primary(fragment, &mut fields)?;
        self.extract_secondary(fragment, &mut fields);
        Ok(fields.finish())
    }
}
