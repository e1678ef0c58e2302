use anyhow::{Context, Result};
use scraper::Html;
use tracing::debug;
use url::Url;

use crate::browser::Locator;
use crate::parser::fields::{selector, text_of, DEFAULT_TOTAL};
use crate::site::{Paging, SeedLink, SiteAdapter};

/// Pagination state of one crawl. Offsets are 0-based item counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlCursor {
    pub offset: usize,
    pub items_per_page: usize,
    pub declared_total: Option<usize>,
}

impl CrawlCursor {
    pub fn new(items_per_page: usize) -> Self {
        Self {
            offset: 0,
            items_per_page: items_per_page.max(1),
            declared_total: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.declared_total.is_some_and(|total| self.offset >= total)
    }

    /// `offset / declared_total`, clamped to `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        match self.declared_total {
            None => 0.0,
            Some(0) => 1.0,
            Some(total) => (self.offset as f64 / total as f64).clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextTarget {
    Url(String),
    Click(Locator),
    /// Harvest whatever the session is already showing.
    Stay,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub target: NextTarget,
    pub done: bool,
}

pub struct Pager {
    paging: Paging,
    cursor: CrawlCursor,
    base: Option<Url>,
}

impl Pager {
    pub fn new(paging: Paging, items_per_page: usize) -> Self {
        Self {
            paging,
            cursor: CrawlCursor::new(items_per_page),
            base: None,
        }
    }

    pub fn cursor(&self) -> &CrawlCursor {
        &self.cursor
    }

    /// Where the first harvested page lives, given the page the operator left
    /// the session on.
    pub fn first_target(&mut self, markup: &str, location: &str) -> Result<NextTarget> {
        match self.paging {
            Paging::QueryParam {
                param,
                per_page_param,
                seed,
            } => {
                let current = Url::parse(location)
                    .with_context(|| format!("Invalid session location: {location}"))?;
                let mut base = match seed_href(markup, seed) {
                    Some(href) => current
                        .join(&href)
                        .with_context(|| format!("Invalid paging link: {href}"))?,
                    None => current,
                };
                set_query_param(&mut base, per_page_param, &self.cursor.items_per_page.to_string());
                let target = self.page_url(&base, param);
                self.base = Some(base);
                Ok(NextTarget::Url(target))
            }
            Paging::ClickNext { .. } => Ok(NextTarget::Stay),
        }
    }

    /// Record the declared total. Only the first reading counts.
    pub fn set_declared_total(&mut self, total: usize) {
        if self.cursor.declared_total.is_none() {
            debug!(total, "declared total");
            self.cursor.declared_total = Some(total);
        }
    }

    /// Advance past the page just harvested; `markup` is `None` when that page
    /// failed to load. Once done, stays done without moving the cursor.
    pub fn compute_next(&mut self, site: &dyn SiteAdapter, markup: Option<&str>) -> Step {
        if let (None, Some(markup)) = (self.cursor.declared_total, markup) {
            let page = Html::parse_document(markup);
            self.set_declared_total(site.declared_total(&page).unwrap_or(DEFAULT_TOTAL));
        }

        let done = Step {
            target: NextTarget::Stay,
            done: true,
        };
        if self.cursor.is_done() {
            return done;
        }
        self.cursor.offset += self.cursor.items_per_page;
        if self.cursor.is_done() {
            return done;
        }

        let target = match (self.paging, &self.base) {
            (Paging::QueryParam { param, .. }, Some(base)) => {
                NextTarget::Url(self.page_url(base, param))
            }
            (Paging::QueryParam { .. }, None) => NextTarget::Stay,
            (Paging::ClickNext { control }, _) => NextTarget::Click(Locator::css(control)),
        };
        Step {
            target,
            done: false,
        }
    }

    fn page_url(&self, base: &Url, param: &str) -> String {
        let mut url = base.clone();
        set_query_param(&mut url, param, &(self.cursor.offset + 1).to_string());
        url.into()
    }
}

fn seed_href(markup: &str, seed: SeedLink) -> Option<String> {
    let sel = selector(seed.css).ok()?;
    let page = Html::parse_document(markup);
    let href = page
        .select(&sel)
        .find(|a| text_of(*a).contains(seed.text))
        .and_then(|a| a.value().attr("href"))
        .map(str::to_string);
    href
}

/// Replace `key` in place, or append it, keeping the other pairs in order.
pub fn set_query_param(url: &mut Url, key: &str, value: &str) {
    let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    match pairs.iter_mut().find(|(k, _)| k == key) {
        Some(pair) => pair.1 = value.to_string(),
        None => pairs.push((key.to_string(), value.to_string())),
    }
    url.query_pairs_mut().clear().extend_pairs(&pairs);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::oregon::Oregon;
    use crate::site::washington::Washington;

    const RESULTS: &str = "https://www4.cbs.state.or.us/exs/all/mylicsearch/index.cfm?fuseaction=search.get_name_results&search_input=acme&group_id=30";

    fn query(target: &NextTarget) -> Vec<(String, String)> {
        match target {
            NextTarget::Url(u) => Url::parse(u).unwrap().query_pairs().into_owned().collect(),
            other => panic!("expected URL target, got {other:?}"),
        }
    }

    fn param(target: &NextTarget, key: &str) -> Option<String> {
        query(target).into_iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    #[test]
    fn first_target_follows_next_link() {
        let html = std::fs::read_to_string("tests/fixtures/oregon_results.html").unwrap();
        let mut pager = Pager::new(Oregon.paging(), 100);
        let first = pager.first_target(&html, RESULTS).unwrap();

        assert_eq!(param(&first, "i").as_deref(), Some("1"));
        assert_eq!(param(&first, "items_per_page").as_deref(), Some("100"));
        assert_eq!(param(&first, "fuseaction").as_deref(), Some("search.get_name_results"));
        assert_eq!(param(&first, "search_input").as_deref(), Some("acme"));
        // `i` keeps its position from the seed link
        assert_eq!(query(&first)[0].0, "i");
    }

    #[test]
    fn first_target_without_next_link_uses_location() {
        let mut pager = Pager::new(Oregon.paging(), 50);
        let first = pager.first_target("<p>one page</p>", RESULTS).unwrap();
        let keys: Vec<String> = query(&first).into_iter().map(|(k, _)| k).collect();
        assert_eq!(
            keys,
            vec!["fuseaction", "search_input", "group_id", "items_per_page", "i"]
        );
    }

    #[test]
    fn oregon_137_total_is_two_pages() {
        let html = std::fs::read_to_string("tests/fixtures/oregon_results.html").unwrap();
        let mut pager = Pager::new(Oregon.paging(), 100);
        pager.first_target(&html, RESULTS).unwrap();

        let step = pager.compute_next(&Oregon, Some(html.as_str()));
        assert!(!step.done);
        assert_eq!(param(&step.target, "i").as_deref(), Some("101"));
        assert_eq!(pager.cursor().declared_total, Some(137));
        assert_eq!(pager.cursor().offset, 100);

        let step = pager.compute_next(&Oregon, Some("<p>last page, no pager</p>"));
        assert!(step.done);
        assert_eq!(pager.cursor().declared_total, Some(137));
        assert_eq!(pager.cursor().fraction(), 1.0);
    }

    #[test]
    fn done_is_idempotent() {
        let mut pager = Pager::new(Oregon.paging(), 100);
        pager.set_declared_total(100);
        assert!(pager.compute_next(&Oregon, Some("")).done);
        let offset = pager.cursor().offset;
        for _ in 0..3 {
            assert!(pager.compute_next(&Oregon, Some("")).done);
            assert_eq!(pager.cursor().offset, offset);
        }
    }

    #[test]
    fn missing_total_defaults_to_one_hundred() {
        let mut pager = Pager::new(Oregon.paging(), 25);
        pager.first_target("", RESULTS).unwrap();
        let step = pager.compute_next(&Oregon, Some("<p>no total here</p>"));
        assert_eq!(pager.cursor().declared_total, Some(DEFAULT_TOTAL));
        assert!(!step.done);
        assert_eq!(pager.cursor().fraction(), 0.25);
    }

    #[test]
    fn failed_page_leaves_total_unset() {
        let mut pager = Pager::new(Oregon.paging(), 100);
        pager.first_target("", RESULTS).unwrap();

        let step = pager.compute_next(&Oregon, None);
        assert!(!step.done);
        assert_eq!(pager.cursor().declared_total, None);
        assert_eq!(param(&step.target, "i").as_deref(), Some("101"));

        let html = std::fs::read_to_string("tests/fixtures/oregon_results.html").unwrap();
        let step = pager.compute_next(&Oregon, Some(html.as_str()));
        assert!(step.done);
        assert_eq!(pager.cursor().declared_total, Some(137));
    }

    #[test]
    fn click_next_until_total() {
        let mut pager = Pager::new(Washington.paging(), 100);
        assert_eq!(pager.first_target("", "https://x/verify").unwrap(), NextTarget::Stay);
        pager.set_declared_total(250);
        pager.set_declared_total(5);
        assert_eq!(pager.cursor().declared_total, Some(250));

        for _ in 0..2 {
            let step = pager.compute_next(&Washington, Some(""));
            assert!(!step.done);
            assert_eq!(step.target, NextTarget::Click(Locator::css(".nextButton")));
        }
        assert!(pager.compute_next(&Washington, Some("")).done);
    }

    #[test]
    fn fraction_bounds() {
        let mut cursor = CrawlCursor::new(10);
        assert_eq!(cursor.fraction(), 0.0);
        cursor.declared_total = Some(0);
        assert_eq!(cursor.fraction(), 1.0);
        cursor.declared_total = Some(40);
        cursor.offset = 90;
        assert_eq!(cursor.fraction(), 1.0);
    }
}
