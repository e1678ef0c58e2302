use std::fmt;
use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::debug;
use url::Url;

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

static LINK: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());

/// The `index`th element matching a CSS selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    css: String,
    index: usize,
}

impl Locator {
    pub fn css(css: &str) -> Self {
        Self::nth(css, 0)
    }

    pub fn nth(css: &str, index: usize) -> Self {
        Self {
            css: css.to_string(),
            index,
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.css, self.index)
    }
}

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("navigation to {target} failed: {reason}")]
    Navigation { target: String, reason: String },
    #[error("no element matches {0}")]
    ElementNotFound(Locator),
    #[error("{0} is not clickable")]
    NotClickable(Locator),
    #[error("browser session lost: {0}")]
    SessionLost(String),
}

impl BrowserError {
    /// Errors after which the session cannot be used for another page.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrowserError::SessionLost(_))
    }
}

/// A controlled browser owned by one crawl for its whole lifetime.
pub trait BrowserSession: Send {
    /// Load `target`, resolved against the current location.
    fn navigate(&mut self, target: &str) -> impl Future<Output = Result<(), BrowserError>> + Send;

    fn click(&mut self, locator: &Locator) -> impl Future<Output = Result<(), BrowserError>> + Send;

    fn current_markup(&mut self) -> impl Future<Output = Result<String, BrowserError>> + Send;

    fn current_location(&self) -> String;

    fn close(self) -> impl Future<Output = ()> + Send;
}

/// Absolute URL a click on `locator` would follow: the element's own href,
/// or that of the first link inside it.
pub fn link_target(markup: &str, location: &str, locator: &Locator) -> Result<String, BrowserError> {
    let sel = Selector::parse(&locator.css)
        .map_err(|_| BrowserError::ElementNotFound(locator.clone()))?;
    let page = Html::parse_document(markup);
    let el = page
        .select(&sel)
        .nth(locator.index)
        .ok_or_else(|| BrowserError::ElementNotFound(locator.clone()))?;

    let href = el
        .value()
        .attr("href")
        .or_else(|| el.select(&LINK).next().and_then(|a| a.value().attr("href")))
        .ok_or_else(|| BrowserError::NotClickable(locator.clone()))?;

    let base = Url::parse(location).map_err(|e| BrowserError::Navigation {
        target: location.to_string(),
        reason: e.to_string(),
    })?;
    base.join(href)
        .map(String::from)
        .map_err(|_| BrowserError::NotClickable(locator.clone()))
}

/// Plain HTTP session: follows links and keeps cookies, but runs no scripts.
pub struct HttpSession {
    client: reqwest::Client,
    location: Url,
    markup: String,
}

impl HttpSession {
    pub async fn open(url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .cookie_store(true)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        let location = Url::parse(url).with_context(|| format!("Invalid start URL: {url}"))?;
        let mut session = Self {
            client,
            location,
            markup: String::new(),
        };
        session
            .navigate(url)
            .await
            .with_context(|| format!("Failed to open {url}"))?;
        Ok(session)
    }
}

impl BrowserSession for HttpSession {
    async fn navigate(&mut self, target: &str) -> Result<(), BrowserError> {
        let nav_err = |reason: String| BrowserError::Navigation {
            target: target.to_string(),
            reason,
        };
        let url = self.location.join(target).map_err(|e| nav_err(e.to_string()))?;
        debug!(url = %url, "GET");

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| nav_err(e.to_string()))?;
        let final_url = resp.url().clone();
        let body = resp.text().await.map_err(|e| nav_err(e.to_string()))?;

        self.location = final_url;
        self.markup = body;
        Ok(())
    }

    async fn click(&mut self, locator: &Locator) -> Result<(), BrowserError> {
        let href = link_target(&self.markup, self.location.as_str(), locator)?;
        self.navigate(&href).await
    }

    async fn current_markup(&mut self) -> Result<String, BrowserError> {
        Ok(self.markup.clone())
    }

    fn current_location(&self) -> String {
        self.location.to_string()
    }

    async fn close(self) {
        debug!(location = %self.location, "HTTP session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><body>
        <div class="itemSingleCol"><a href="detail?id=1">One</a></div>
        <div class="itemSingleCol"><a href="/verify/detail?id=2">Two</a></div>
        <div class="itemSingleCol">No link</div>
        <a class="nextButton" href="?page=2">Next</a>
    </body></html>"#;

    const LOCATION: &str = "https://example.gov/verify/results?q=acme";

    #[test]
    fn clicks_resolve_against_location() {
        assert_eq!(
            link_target(PAGE, LOCATION, &Locator::nth(".itemSingleCol", 0)).unwrap(),
            "https://example.gov/verify/detail?id=1"
        );
        assert_eq!(
            link_target(PAGE, LOCATION, &Locator::nth(".itemSingleCol", 1)).unwrap(),
            "https://example.gov/verify/detail?id=2"
        );
        assert_eq!(
            link_target(PAGE, LOCATION, &Locator::css(".nextButton")).unwrap(),
            "https://example.gov/verify/results?page=2"
        );
    }

    #[test]
    fn missing_or_dead_elements() {
        assert!(matches!(
            link_target(PAGE, LOCATION, &Locator::nth(".itemSingleCol", 2)),
            Err(BrowserError::NotClickable(_))
        ));
        assert!(matches!(
            link_target(PAGE, LOCATION, &Locator::nth(".itemSingleCol", 3)),
            Err(BrowserError::ElementNotFound(_))
        ));
        assert!(!BrowserError::ElementNotFound(Locator::css("a")).is_fatal());
        assert!(BrowserError::SessionLost("closed".into()).is_fatal());
        assert_eq!(Locator::nth(".row", 4).to_string(), ".row[4]");
    }
}
