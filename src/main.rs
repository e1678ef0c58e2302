mod browser;
mod config;
mod crawler;
mod pager;
mod parser;
mod progress;
mod record;
mod site;
mod store;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::warn;

use crate::browser::HttpSession;
use crate::config::{ConfigOverrides, CrawlConfig};
use crate::crawler::{CrawlOutcome, OperatorGate};
use crate::record::{present, EXPIRATION_DATE};
use crate::site::{Site, SiteAdapter};
use crate::store::{RecordStore, ViewFilter};

const DEFAULT_OUT: &str = "logs";

#[derive(Parser)]
#[command(name = "license_scraper", about = "State contractor license lookup scraper")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl the results of a search the operator has already run
    Crawl {
        #[arg(value_enum)]
        site: Site,
        /// Results page the operator's search landed on
        #[arg(long)]
        url: Option<String>,
        /// Confirm the site's automation check has been cleared
        #[arg(long)]
        captcha_cleared: bool,
        /// Confirm the search terms have been entered and submitted
        #[arg(long)]
        search_entered: bool,
        /// JSON file with crawl settings
        #[arg(long)]
        config: Option<PathBuf>,
        /// Output directory for crawl_data.json and data.csv
        #[arg(long)]
        out: Option<PathBuf>,
        /// Seconds to wait for each page to render
        #[arg(long)]
        settle: Option<f64>,
        /// Maximum loop iterations before the crawl is aborted
        #[arg(long)]
        ceiling: Option<usize>,
        /// Results requested per page
        #[arg(long)]
        per_page: Option<usize>,
    },
    /// List stored records by expiration date
    View {
        /// Case-insensitive owner name filter
        #[arg(short, long)]
        name: Option<String>,
        /// Include records without an expiration date
        #[arg(long)]
        all: bool,
        /// Earliest expiration first
        #[arg(long)]
        oldest_first: bool,
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
        #[arg(long, default_value = DEFAULT_OUT)]
        out: PathBuf,
    },
    /// Show record store statistics
    Stats {
        #[arg(long, default_value = DEFAULT_OUT)]
        out: PathBuf,
    },
    /// Rebuild data.csv from crawl_data.json
    Export {
        #[arg(long, default_value = DEFAULT_OUT)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Crawl {
            site,
            url,
            captcha_cleared,
            search_entered,
            config,
            out,
            settle,
            ceiling,
            per_page,
        } => {
            OperatorGate {
                automation_check: captcha_cleared,
                search_terms_entered: search_entered,
            }
            .check()?;

            let file = match &config {
                Some(path) => ConfigOverrides::from_file(path)?,
                None => ConfigOverrides::default(),
            };
            let flags = ConfigOverrides {
                items_per_page: per_page,
                settle_secs: settle,
                iteration_ceiling: ceiling,
                out_dir: out,
                ..Default::default()
            };
            let cfg = CrawlConfig::for_site(site).with_overrides(&file.merge(flags))?;

            let adapter = site.adapter();
            let start = start_url(url, adapter.as_ref())?;
            let mut store = RecordStore::open(&cfg.out_dir, adapter.identity())?;
            if store.is_empty() {
                println!("Crawling {} from {} (new store)", adapter.name(), start);
            } else {
                println!(
                    "Crawling {} from {} ({} records already stored)",
                    adapter.name(),
                    start,
                    store.len()
                );
            }
            let session = HttpSession::open(&start).await?;

            let shutdown = Arc::new(AtomicBool::new(false));
            {
                let flag = Arc::clone(&shutdown);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("Interrupt received, stopping after the current page");
                        flag.store(true, Ordering::Relaxed);
                    }
                });
            }

            let (tx, rx) = progress::channel();
            let observer = progress::spawn_observer(rx, adapter.name());
            let summary =
                crawler::run_crawl(session, adapter.as_ref(), &cfg, &mut store, &tx, &shutdown)
                    .await;
            drop(tx);
            let _ = observer.await;

            match &summary.outcome {
                CrawlOutcome::Done => println!("Crawl complete."),
                CrawlOutcome::Aborted(reason) => println!("Crawl aborted: {}", reason),
            }
            println!(
                "{} pages ({} failed), {} records harvested: {} new, {} duplicates.",
                summary.pages,
                summary.failed_pages,
                summary.harvested,
                summary.inserted,
                summary.duplicates
            );
            if let Some(total) = summary.declared_total {
                println!("Site reported {} results.", total);
            }
            println!("Store: {} records in {}", store.len(), cfg.out_dir.display());
            Ok(())
        }
        Commands::View {
            name,
            all,
            oldest_first,
            limit,
            out,
        } => {
            let records = store::load_view_records(&out)
                .with_context(|| format!("loading records from {}", out.display()))?;
            let filter = ViewFilter {
                name,
                include_undated: all,
                newest_first: !oldest_first,
                limit: Some(limit),
            };
            let rows = filter.apply(&records);
            if rows.is_empty() {
                println!("No records found.");
                return Ok(());
            }

            println!(
                "{:>3} | {:<30} | {:<14} | {:<22} | {:<10}",
                "#", "Owner", "License", "City", "Expires"
            );
            println!("{}", "-".repeat(90));
            for (i, r) in rows.iter().enumerate() {
                let field = |key: &str, max: usize| truncate(present(r, key).unwrap_or("-"), max);
                println!(
                    "{:>3} | {:<30} | {:<14} | {:<22} | {:<10}",
                    i + 1,
                    field("owner_name", 30),
                    field("license_number", 14),
                    field("city", 22),
                    field(EXPIRATION_DATE, 10)
                );
            }
            println!("\n{} of {} records", rows.len(), records.len());
            Ok(())
        }
        Commands::Stats { out } => {
            let records = store::load_records(&out.join(store::JSON_FILE))?;
            let s = store::stats(&records);
            println!("Total:           {}", s.total);
            println!("With expiration: {}", s.with_expiration);
            println!("No expiration:   {}", s.total - s.with_expiration);
            println!("Expired:         {}", s.expired);
            Ok(())
        }
        Commands::Export { out } => {
            let rows = store::export_csv(&out)?;
            println!("Wrote {} rows to {}", rows, out.join(store::CSV_FILE).display());
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

/// The crawl starts from a results page; the site's search form has none.
fn start_url(url: Option<String>, site: &dyn SiteAdapter) -> anyhow::Result<String> {
    match url {
        Some(u) if u != site.entry_url() => Ok(u),
        _ => bail!(
            "--url must be the results page of a search already run on {} (search form: {})",
            site.name(),
            site.entry_url()
        ),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn crawl_flags_parse() {
        let cli = Cli::try_parse_from([
            "license_scraper",
            "crawl",
            "washington",
            "--captcha-cleared",
            "--search-entered",
            "--ceiling",
            "7",
        ])
        .unwrap();
        match cli.command {
            Commands::Crawl {
                site,
                captcha_cleared,
                search_entered,
                ceiling,
                ..
            } => {
                assert_eq!(site, Site::Washington);
                assert!(captcha_cleared && search_entered);
                assert_eq!(ceiling, Some(7));
            }
            _ => panic!("expected crawl"),
        }
    }

    #[test]
    fn crawl_needs_a_results_url() {
        let oregon = Site::Oregon.adapter();
        let err = start_url(None, oregon.as_ref()).unwrap_err().to_string();
        assert!(err.contains("--url"));
        assert!(err.contains(oregon.entry_url()));
        assert!(start_url(Some(oregon.entry_url().to_string()), oregon.as_ref()).is_err());

        let results = "https://www4.cbs.state.or.us/exs/all/mylicsearch/index.cfm?fuseaction=search.get_name_results&search_input=acme";
        assert_eq!(
            start_url(Some(results.to_string()), oregon.as_ref()).unwrap(),
            results
        );
    }

    #[test]
    fn truncate_and_durations() {
        assert_eq!(truncate("ACME", 10), "ACME");
        assert_eq!(truncate("ACME BUILDERS LLC", 10), "ACME BU...");
        assert_eq!(format_duration(std::time::Duration::from_secs(125)), "2m 5s");
    }
}
