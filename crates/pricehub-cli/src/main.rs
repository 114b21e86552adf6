use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use pricehub_core::{AggregatedResult, Marketplace, SearchQuery};
use pricehub_search::{Aggregator, SearchConfig};
use pricehub_storage::{ExportFormat, ExportStore};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Parser)]
#[command(name = "pricehub")]
#[command(about = "Compare product prices across Pakistani and global marketplaces")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to $PRICEHUB_CONFIG, then ./pricehub.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Search every enabled marketplace
    Search {
        query: String,

        /// Restrict to these marketplaces (repeatable)
        #[arg(short, long = "marketplace")]
        marketplaces: Vec<Marketplace>,

        #[arg(long)]
        max_price: Option<f64>,

        /// Write the result as json or csv
        #[arg(short, long)]
        export: Option<ExportFormat>,

        #[arg(short, long, default_value = "exports")]
        out: PathBuf,
    },
    /// Run the JSON API
    Serve {
        /// Defaults to $PRICEHUB_WEB_PORT, then 8000
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Print the effective configuration as YAML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(cli.config)?;

    match cli.command {
        Commands::Search {
            query,
            marketplaces,
            max_price,
            export,
            out,
        } => {
            let mut query = SearchQuery::new(&query)?.with_marketplaces(marketplaces);
            if let Some(max_price) = max_price {
                query = query.with_max_price(max_price)?;
            }
            let aggregator = Aggregator::from_config(&config)?;
            let result = aggregator.search_all(&query).await;
            print_result(&result);

            if let Some(format) = export {
                let stored = ExportStore::new(out).export(&result, format).await?;
                println!(
                    "exported {} bytes to {}{}",
                    stored.byte_size,
                    stored.absolute_path.display(),
                    if stored.deduplicated { " (unchanged)" } else { "" }
                );
            }
            if result.all_failed() {
                bail!("search failed on every marketplace");
            }
        }
        Commands::Serve { port } => {
            let port = port.unwrap_or_else(pricehub_web::port_from_env);
            pricehub_web::serve(Aggregator::from_config(&config)?, port).await?;
        }
        Commands::Config => {
            print!("{}", config.to_yaml()?);
        }
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<SearchConfig> {
    let Some(path) = path else {
        return SearchConfig::from_env();
    };
    let mut config = SearchConfig::load(&path)?;
    config.apply_env(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

fn print_result(result: &AggregatedResult) {
    for (marketplace, products) in result.grouped() {
        println!("== {} ({})", marketplace.display_name(), products.len());
        for product in products {
            let price = product
                .price
                .map(|p| format!("{p:.2} {}", product.currency))
                .unwrap_or_else(|| "n/a".to_string());
            println!(
                "  {price:>16}  {}  {}",
                product.name,
                product.url.as_deref().unwrap_or("-")
            );
        }
    }
    for source in &result.sources {
        match &source.error {
            None => println!(
                "{}: {} products, {} unpriced, {} attempt(s), {}ms",
                source.marketplace.slug(),
                source.count,
                source.unpriced,
                source.attempts,
                source.elapsed_ms
            ),
            Some(error) => println!(
                "{}: failed after {} attempt(s): {error}",
                source.marketplace.slug(),
                source.attempts
            ),
        }
    }
    println!("total: {}", result.total);
}
