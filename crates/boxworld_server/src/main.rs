//! Boxworld - unified CLI
//!
//! Runs the actor engine, or inspects pages and layouts offline.

#![warn(missing_docs)]

use anyhow::{Context, Result};
use boxworld_bits::{Address, AddressedRngFactory, PAGE_BITS, decompress};
use boxworld_minesweeper::{Grid, MineField};
use boxworld_server::{
    Cli, Command, EngineConfig, GOLD_SPOTS, GOLD_STREAM, Gateway, MINE_STREAM, MemoryStore,
    RNG_SECRET_ENV, SqliteStore, StateStore, StorageConfig,
};
use clap::Parser;
use rand::Rng;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, instrument};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => run_engine(config).await,
        Command::Decode { hex, width } => decode_page(&hex, width),
        Command::Layout {
            stream,
            address,
            width,
            count,
            config,
        } => print_layout(&stream, &address, width, count, config),
    }
}

fn initialize_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,boxworld_server=debug")),
        )
        .init();
}

fn load_config(path: Option<PathBuf>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::from_file(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::new(String::new()),
    }
    .with_env_overrides();
    config
        .validate()
        .with_context(|| format!("invalid configuration (is {} set?)", RNG_SECRET_ENV))?;
    Ok(config)
}

/// Run the engine until ctrl-c
#[instrument(skip_all)]
async fn run_engine(config: Option<PathBuf>) -> Result<()> {
    initialize_tracing();
    let config = load_config(config)?;

    let store: Arc<dyn StateStore> = match config.storage() {
        StorageConfig::Memory => {
            info!("Using in-memory storage");
            Arc::new(MemoryStore::new())
        }
        StorageConfig::Sqlite { path } => {
            info!(path = %path, "Using SQLite storage");
            Arc::new(SqliteStore::open(path.clone())?)
        }
    };

    let gateway = Gateway::start(config, store).await?;
    info!("Engine running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;

    info!("Shutting down");
    gateway.shutdown().await;
    Ok(())
}

/// Print a compressed page as rows of `#` and `.`
fn decode_page(hex: &str, width: usize) -> Result<()> {
    let bytes = hex::decode(hex.trim()).context("page is not hex")?;
    let Some(bits) = decompress(&bytes)? else {
        println!("(no stored state)");
        return Ok(());
    };
    let width = width.max(1);
    for row in bits.chunks(width) {
        let line: String = row.iter().map(|b| if *b { '#' } else { '.' }).collect();
        println!("{}", line);
    }
    let set = bits.iter().filter(|b| **b).count();
    println!("{} of {} checked", set, bits.len());
    Ok(())
}

/// Print the deterministic layout of `address` on `stream`
fn print_layout(
    stream: &str,
    address: &str,
    width: usize,
    count: usize,
    config: Option<PathBuf>,
) -> Result<()> {
    let config = load_config(config)?;
    let address: Address = address.parse()?;
    let factory = AddressedRngFactory::from_hex(config.rng_secret())?;
    let mut rng = factory.derive(stream)?.for_address(&address);

    match stream {
        MINE_STREAM => {
            let grid = Grid::new(width)?;
            let field = MineField::generate(grid, count, &mut rng)?;
            for row in 0..width {
                let line: String = (row * width..(row + 1) * width)
                    .map(|i| if field.is_mine(i) { '*' } else { '.' })
                    .collect();
                println!("{}", line);
            }
        }
        GOLD_STREAM => {
            let mut spots = BTreeSet::new();
            while spots.len() < GOLD_SPOTS {
                spots.insert(rng.gen_range(0..PAGE_BITS));
            }
            for spot in spots {
                println!("{}", spot);
            }
        }
        other => anyhow::bail!("unknown stream {:?}", other),
    }
    Ok(())
}
