use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rand::Rng;
use serde::Deserialize;

use crate::site::Site;

const ITEMS_PER_PAGE: usize = 100;
const ITERATION_CEILING: usize = 5000;
const JITTER_MIN_SECS: u64 = 3;
const JITTER_MAX_SECS: u64 = 10;
const OUT_DIR: &str = "logs";

/// Timing and limits for one crawl.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub items_per_page: usize,
    /// Fixed wait after every navigation for the page to finish rendering.
    pub settle_delay: Duration,
    /// Bounds of the random pause between result pages.
    pub jitter: (Duration, Duration),
    /// Hard cap on loop iterations, whatever the declared total says.
    pub iteration_ceiling: usize,
    pub total_poll_attempts: u32,
    pub total_poll_interval: Duration,
    pub out_dir: PathBuf,
}

impl CrawlConfig {
    pub fn for_site(site: Site) -> Self {
        let base = Self {
            items_per_page: ITEMS_PER_PAGE,
            settle_delay: Duration::from_secs(20),
            jitter: (
                Duration::from_secs(JITTER_MIN_SECS),
                Duration::from_secs(JITTER_MAX_SECS),
            ),
            iteration_ceiling: ITERATION_CEILING,
            total_poll_attempts: 1,
            total_poll_interval: Duration::ZERO,
            out_dir: PathBuf::from(OUT_DIR),
        };
        match site {
            Site::Oregon => base,
            Site::Washington => Self {
                settle_delay: Duration::from_secs(3),
                total_poll_attempts: 15,
                total_poll_interval: Duration::from_secs(2),
                ..base
            },
        }
    }

    #[cfg(test)]
    pub fn immediate(site: Site) -> Self {
        Self {
            settle_delay: Duration::ZERO,
            jitter: (Duration::ZERO, Duration::ZERO),
            total_poll_interval: Duration::ZERO,
            ..Self::for_site(site)
        }
    }

    pub fn with_overrides(mut self, o: &ConfigOverrides) -> Result<Self> {
        if let Some(n) = o.items_per_page {
            if n == 0 {
                bail!("items_per_page must be at least 1");
            }
            self.items_per_page = n;
        }
        if let Some(s) = o.settle_secs {
            self.settle_delay = seconds("settle_secs", s)?;
        }
        if let Some(s) = o.jitter_min_secs {
            self.jitter.0 = seconds("jitter_min_secs", s)?;
        }
        if let Some(s) = o.jitter_max_secs {
            self.jitter.1 = seconds("jitter_max_secs", s)?;
        }
        if self.jitter.0 > self.jitter.1 {
            bail!(
                "jitter minimum ({:?}) exceeds maximum ({:?})",
                self.jitter.0,
                self.jitter.1
            );
        }
        if let Some(n) = o.iteration_ceiling {
            self.iteration_ceiling = n;
        }
        if let Some(n) = o.total_poll_attempts {
            self.total_poll_attempts = n.max(1);
        }
        if let Some(dir) = &o.out_dir {
            self.out_dir = dir.clone();
        }
        Ok(self)
    }

    /// A random pause within the jitter bounds.
    pub fn jitter_delay(&self) -> Duration {
        let (lo, hi) = self.jitter;
        if lo >= hi {
            return lo;
        }
        let ms = rand::rng().random_range(lo.as_millis() as u64..=hi.as_millis() as u64);
        Duration::from_millis(ms)
    }
}

/// Negative values clamp to zero; values too large for a `Duration` are rejected.
fn seconds(name: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs.max(0.0))
        .with_context(|| format!("{name} out of range: {secs}"))
}

/// Optional settings from a JSON file, with command-line flags layered on top.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigOverrides {
    pub items_per_page: Option<usize>,
    pub settle_secs: Option<f64>,
    pub jitter_min_secs: Option<f64>,
    pub jitter_max_secs: Option<f64>,
    pub iteration_ceiling: Option<usize>,
    pub total_poll_attempts: Option<u32>,
    pub out_dir: Option<PathBuf>,
}

impl ConfigOverrides {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Values set in `other` win.
    pub fn merge(self, other: ConfigOverrides) -> Self {
        Self {
            items_per_page: other.items_per_page.or(self.items_per_page),
            settle_secs: other.settle_secs.or(self.settle_secs),
            jitter_min_secs: other.jitter_min_secs.or(self.jitter_min_secs),
            jitter_max_secs: other.jitter_max_secs.or(self.jitter_max_secs),
            iteration_ceiling: other.iteration_ceiling.or(self.iteration_ceiling),
            total_poll_attempts: other.total_poll_attempts.or(self.total_poll_attempts),
            out_dir: other.out_dir.or(self.out_dir),
        }
    }
}
