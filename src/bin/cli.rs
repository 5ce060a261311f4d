//! tierfetch CLI
//!
//! Local entry point for crawling, classifying, cleaning and deduplicating pages.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tierfetch::{
    classify::Classifier,
    clean::TextCleaner,
    dedup::Deduplicator,
    error::Result,
    extract::TextExtractor,
    models::{Config, StrategyKind},
    pipeline::Orchestrator,
    ratelimit::{self, Clock, SystemClock},
};

/// tierfetch - tiered web fetching under rate and budget limits
#[derive(Parser, Debug)]
#[command(
    name = "tierfetch",
    version,
    about = "Tiered web fetching with admissibility checks and near-duplicate filtering"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch URLs through the tier cascade
    Crawl {
        /// URLs to fetch
        #[arg(required = true)]
        urls: Vec<String>,

        /// Tiers to use, in order (http, render, api)
        #[arg(long, value_delimiter = ',')]
        tiers: Option<Vec<StrategyKind>>,

        /// Print full records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Classify a saved HTML file
    Classify {
        file: PathBuf,

        /// URL the page was fetched from, for log context
        #[arg(long, default_value = "file://local")]
        url: String,
    },

    /// Strip boilerplate lines (cookie banners, calls to action) from text files
    Clean {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Remove near-duplicate paragraphs from text files, in argument order
    Dedupe {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Similarity threshold (0.0 - 1.0)
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Validate the configuration file
    Validate,

    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let load = || Config::load_or_default(&cli.config);

    match cli.command {
        Command::Crawl { urls, tiers, json } => {
            let mut config = load();
            if let Some(tiers) = tiers {
                config.cascade.tiers = tiers;
            }
            config.validate()?;

            let clock: Arc<dyn Clock> = Arc::new(SystemClock);
            let store = ratelimit::connect_store(&config.rate_limit, clock.clone()).await;
            let orchestrator = Orchestrator::from_config(&config, store, clock)?;
            log::info!(
                "Tiers: {}",
                orchestrator
                    .tier_kinds()
                    .iter()
                    .map(StrategyKind::as_str)
                    .collect::<Vec<_>>()
                    .join(" -> ")
            );

            let records = orchestrator.crawl(&urls).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                for record in &records {
                    let via = record
                        .metadata
                        .strategy
                        .map_or("-", |s| s.as_str());
                    match &record.error {
                        None => println!(
                            "OK    {} [{}] {} chars{}",
                            record.url,
                            via,
                            record.metadata.content_length,
                            if record.metadata.js_required {
                                " (js_required)"
                            } else {
                                ""
                            }
                        ),
                        Some(error) => println!("FAIL  {} [{}] {}", record.url, via, error),
                    }
                }
            }
            let failed = records.iter().filter(|r| !r.success).count();
            log::info!("{} of {} URL(s) fetched", records.len() - failed, records.len());
        }

        Command::Classify { file, url } => {
            let config = load();
            let html = std::fs::read_to_string(&file)?;
            let text = TextExtractor::new(&config.extract.exclude_tags).html_to_text(&html);
            let classifier = Classifier::new(&config.classifier)?;
            let verdict = classifier.classify(&url, &html, &text);
            println!("{}: {}", file.display(), verdict);
            println!(
                "  {} text chars / {} html chars",
                text.chars().count(),
                html.chars().count()
            );
        }

        Command::Clean { files } => {
            let config = load();
            let cleaner = TextCleaner::new(&config.clean)?;
            for file in &files {
                let text = std::fs::read_to_string(file)?;
                println!("==> {} <==\n{}\n", file.display(), cleaner.clean(&text));
            }
        }

        Command::Dedupe { files, threshold } => {
            let mut config = load();
            if let Some(threshold) = threshold {
                config.dedup.threshold = threshold;
            }
            config.validate()?;
            let dedup = Deduplicator::from_config(&config.dedup);

            let mut pages = Vec::with_capacity(files.len());
            for file in &files {
                let text = std::fs::read_to_string(file)?;
                pages.push((file.display().to_string(), dedup.dedupe(&text)));
            }
            let texts = if config.dedup.cross_page {
                dedup.dedupe_across_pages(&pages)
            } else {
                pages.iter().map(|(_, text)| text.clone()).collect()
            };
            for ((name, _), text) in pages.iter().zip(&texts) {
                println!("==> {} <==\n{}\n", name, text);
            }
        }

        Command::Validate => {
            log::info!("Validating {}...", cli.config.display());
            let config = load();
            if let Err(e) = config.validate() {
                log::error!("Config validation failed: {}", e);
                return Err(e);
            }
            Classifier::new(&config.classifier)?;
            TextCleaner::new(&config.clean)?;
            log::info!("Config OK");
        }

        Command::InitConfig { force } => {
            if cli.config.exists() && !force {
                log::warn!(
                    "{} already exists. Use --force to overwrite.",
                    cli.config.display()
                );
                return Ok(());
            }
            std::fs::write(&cli.config, Config::default().to_toml()?)?;
            log::info!("Default configuration written to {}", cli.config.display());
        }
    }

    Ok(())
}
