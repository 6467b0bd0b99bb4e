use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use swing_rs::prelude::*;
use swing_rs::utils::get_candles_from_file;

#[derive(Parser)]
#[command(name = "swing-backtest")]
#[command(about = "Replays historical candles through a trading bot", long_about = None)]
struct Cli {
    /// Klines JSON file
    #[arg(short = 'k', long, default_value = "data/btc.json")]
    candles: PathBuf,
    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Bot to run, overrides the config
    #[arg(short, long)]
    bot: Option<String>,
    /// Seed of the bot's random choices, overrides the config
    #[arg(long)]
    seed: Option<u64>,
    /// Directory for trade records, overrides the config
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = ConfigLoader::load(cli.config.as_deref())?;
    if let Some(bot) = cli.bot {
        config.bot = bot;
    }
    if let Some(seed) = cli.seed {
        config.swing.seed = seed;
    }
    if let Some(data_dir) = cli.data_dir {
        config.swing.data_dir = data_dir;
    }

    let candles = get_candles_from_file(cli.candles.clone())
        .with_context(|| format!("reading candles from {}", cli.candles.display()))?;
    let bt = Backtest::new(candles, config.backtest.clone())?;

    let registry = BotRegistry::with_builtin(config.swing.clone());
    let mut bot = registry
        .create(&config.bot, bt.context())
        .with_context(|| format!("available bots: {}", registry.names().join(", ")))?;

    let report = bt.run(bot.as_mut()).await?;
    println!("{report}");

    Ok(())
}
