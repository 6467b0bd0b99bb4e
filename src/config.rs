use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::engine::{CACHE_CHUNK_SIZE, TimeFrame};
use crate::errors::{Error, Result};

/// Settings of the price swing bot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwingConfig {
    /// Instance name, used in the trade record path.
    pub name: String,
    /// Price move, as a fraction of spot, that makes a round trip worth closing and keeps
    /// new trades apart.
    pub price_change_frac: f64,
    /// Fraction of the available balance put into each new trade.
    pub volume_frac: f64,
    /// False runs the bot in "fake" mode, with its own trade record file.
    pub allow_trades: bool,
    /// Seed of the direction tie-breaker.
    pub seed: u64,
    /// Directory holding the `Bots/` tree.
    pub data_dir: PathBuf,
}

impl Default for SwingConfig {
    fn default() -> Self {
        Self {
            name: "PriceSwing".to_string(),
            price_change_frac: 0.01,
            volume_frac: 0.1,
            allow_trades: true,
            seed: 653,
            data_dir: PathBuf::from("."),
        }
    }
}

/// Settings of the backtest runner and its simulated market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    /// Base coin symbol.
    pub base: String,
    /// Quote coin symbol.
    pub quote: String,
    /// Starting base balance.
    pub initial_base: f64,
    /// Starting quote balance.
    pub initial_quote: f64,
    /// Fee fraction charged on each fill.
    pub fee: f64,
    /// Distance between the best bid and ask as a fraction of the mid price.
    pub spread_frac: f64,
    /// Levels on each side of the synthetic book.
    pub depth_levels: usize,
    /// Base volume of each synthetic book level.
    pub level_volume: f64,
    /// Intra-candle steps, each one a bot tick.
    pub steps_per_candle: usize,
    /// Period of the input candles.
    pub time_frame: TimeFrame,
    /// Candles loaded per instrument cache chunk.
    pub cache_chunk_size: usize,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            base: "BTC".to_string(),
            quote: "USDT".to_string(),
            initial_base: 1.0,
            initial_quote: 10_000.0,
            fee: 0.001,
            spread_frac: 0.001,
            depth_levels: 10,
            level_volume: 1.0,
            steps_per_candle: 4,
            time_frame: TimeFrame::Min1,
            cache_chunk_size: CACHE_CHUNK_SIZE,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Registered name of the bot to run.
    pub bot: String,
    /// Settings of the `PriceSwing` bot.
    pub swing: SwingConfig,
    /// Settings of the backtest runner.
    pub backtest: BacktestConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bot: "PriceSwing".to_string(),
            swing: SwingConfig::default(),
            backtest: BacktestConfig::default(),
        }
    }
}

/// Loads [`AppConfig`] with `figment`.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads the configuration: defaults, then the TOML file at `path` if given, then
    /// `SWING_` environment variables (`SWING_BACKTEST__FEE=0.002`).
    ///
    /// ### Returns
    /// `Error::Config` if a source can't be parsed.
    pub fn load(path: Option<&Path>) -> Result<AppConfig> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed("SWING_").split("__"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Loads the configuration from a TOML string over the defaults.
    pub fn from_toml(toml: &str) -> Result<AppConfig> {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::string(toml))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = AppConfig::default();
        assert_eq!(config.bot, "PriceSwing");
        assert_eq!(config.swing.seed, 653);
        assert_eq!(config.swing.price_change_frac, 0.01);
        assert_eq!(config.swing.volume_frac, 0.1);
        assert!(config.swing.allow_trades);
        assert_eq!(config.backtest.cache_chunk_size, 1000);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = ConfigLoader::from_toml(
            r#"
            [swing]
            seed = 7
            allow_trades = false

            [backtest]
            fee = 0.002
            time_frame = "hour1"
            "#,
        )
        .unwrap();
        assert_eq!(config.swing.seed, 7);
        assert!(!config.swing.allow_trades);
        assert_eq!(config.swing.volume_frac, 0.1);
        assert_eq!(config.backtest.fee, 0.002);
        assert_eq!(config.backtest.time_frame, TimeFrame::Hour1);
        assert_eq!(config.backtest.initial_quote, 10_000.0);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("swing.toml");
        std::fs::write(&path, "[swing]\nprice_change_frac = 0.05\n").unwrap();
        let config = ConfigLoader::load(Some(&path)).unwrap();
        assert_eq!(config.swing.price_change_frac, 0.05);
    }

    #[test]
    fn invalid_value_is_a_config_error() {
        let result = ConfigLoader::from_toml("[swing]\nseed = \"many\"\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
