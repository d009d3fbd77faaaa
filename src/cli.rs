//! Command-line interface definitions for the archive crawler.
//!
//! Every option can also be supplied through an environment variable. Values
//! given here override the corresponding entries of the YAML config file.

use clap::Parser;

/// Command-line arguments for the archive crawler.
///
/// # Examples
///
/// ```sh
/// # Crawl every configured site
/// archive_crawler -c config/sites.yaml -o ./output
///
/// # One site, one archive year, at most 100 articles
/// archive_crawler --site postillon --target-year 2019 --max-articles 100
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to the sites YAML file
    #[arg(short, long, env = "CRAWLER_CONFIG", default_value = "config/sites.yaml")]
    pub config: String,

    /// Directory receiving the dated JSON Lines files
    #[arg(short, long, env = "CRAWLER_OUTPUT_DIR", default_value = "output")]
    pub output_dir: String,

    /// File persisting already-crawled short URLs (default: `<output-dir>/seen_urls.txt`)
    #[arg(long, env = "CRAWLER_SEEN_FILE")]
    pub seen_file: Option<String>,

    /// Only crawl the named site; repeat for several
    #[arg(long = "site")]
    pub sites: Vec<String>,

    /// Concurrent article fetches per site
    #[arg(long, env = "CRAWLER_WORKERS")]
    pub workers: Option<usize>,

    /// Maximum number of articles fetched per site
    #[arg(long)]
    pub max_articles: Option<usize>,

    /// Maximum number of archive units (months, departments) per site
    #[arg(long)]
    pub max_archive_units: Option<usize>,

    /// Only expand archive groups of this year
    #[arg(long)]
    pub target_year: Option<i32>,

    /// Skip archive months before this one (1-12)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=12))]
    pub min_month: Option<u32>,

    /// Stop issuing new fetches after this many seconds
    #[arg(long)]
    pub time_budget_secs: Option<u64>,
}

impl Cli {
    pub fn seen_file(&self) -> String {
        self.seen_file.clone().unwrap_or_else(|| {
            format!("{}/seen_urls.txt", self.output_dir.trim_end_matches('/'))
        })
    }
}
