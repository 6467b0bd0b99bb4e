//! Bot host interface.
//!
//! A host (the backtester, or a live runner) creates bots through a [`BotRegistry`], then
//! drives them through the [`Bot`] lifecycle: `on_start`, one `step` per tick with the
//! exchange's fill and cancel notifications in between, and `on_stop`.

mod price_swing;
mod records;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::SwingConfig;
use crate::engine::{Exchange, Fund, OrderCompleted, OrderId, TradePair};
use crate::errors::{Error, Result};

pub use price_swing::*;
pub use records::*;

/// Lifecycle hooks a host calls on a bot.
#[async_trait]
pub trait Bot: Send {
    /// Called once before the first step.
    async fn on_start(&mut self) -> Result<()>;

    /// Called once after the last step.
    async fn on_stop(&mut self) -> Result<()>;

    /// Runs one tick.
    async fn step(&mut self) -> Result<()>;

    /// An order filled.
    ///
    /// ### Returns
    /// `Error::UnrecognizedOrder` if the bot didn't create the order. The host decides
    /// whether that is fatal.
    async fn on_position_filled(&mut self, order_id: OrderId, fill: &OrderCompleted) -> Result<()>;

    /// An order was cancelled.
    ///
    /// ### Returns
    /// `Error::UnrecognizedOrder` if the bot didn't create the order.
    async fn on_position_cancelled(&mut self, order_id: OrderId) -> Result<()>;
}

/// What a bot trades with.
#[derive(Clone)]
pub struct BotContext {
    /// Where orders go.
    pub exchange: Arc<dyn Exchange>,
    /// The pair traded.
    pub pair: Arc<TradePair>,
    /// The balance partition the bot trades from.
    pub fund: Fund,
    /// True when replaying history.
    pub backtesting: bool,
    /// Cancels the bot's in-flight exchange requests.
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for BotContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotContext")
            .field("exchange", &self.exchange.name())
            .field("pair", &self.pair.name())
            .field("fund", &self.fund.id())
            .field("backtesting", &self.backtesting)
            .finish()
    }
}

/// Builds a bot for a context.
pub type BotFactory = Box<dyn Fn(BotContext) -> Result<Box<dyn Bot>> + Send + Sync>;

/// Maps bot names to their constructors.
#[derive(Default)]
pub struct BotRegistry {
    factories: HashMap<String, BotFactory>,
}

impl BotRegistry {
    /// Creates a registry with no bots.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the bots this crate ships.
    ///
    /// ### Arguments
    /// * `swing` - Settings of every `PriceSwing` instance created.
    pub fn with_builtin(swing: SwingConfig) -> Self {
        let mut registry = Self::new();
        registry.register(PriceSwing::NAME, move |ctx| {
            Ok(Box::new(PriceSwing::new(ctx, swing.clone())) as Box<dyn Bot>)
        });
        registry
    }

    /// Registers `factory` under `name`, replacing an earlier registration.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(BotContext) -> Result<Box<dyn Bot>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Creates the bot registered under `name`.
    ///
    /// ### Returns
    /// The bot, or `Error::UnknownBot`.
    pub fn create(&self, name: &str, ctx: BotContext) -> Result<Box<dyn Bot>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::UnknownBot(name.to_string()))?;
        factory(ctx)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Coin, SimExchange};

    struct Idle;

    #[async_trait]
    impl Bot for Idle {
        async fn on_start(&mut self) -> Result<()> {
            Ok(())
        }

        async fn on_stop(&mut self) -> Result<()> {
            Ok(())
        }

        async fn step(&mut self) -> Result<()> {
            Ok(())
        }

        async fn on_position_filled(&mut self, order_id: OrderId, _fill: &OrderCompleted) -> Result<()> {
            Err(Error::UnrecognizedOrder(order_id))
        }

        async fn on_position_cancelled(&mut self, order_id: OrderId) -> Result<()> {
            Err(Error::UnrecognizedOrder(order_id))
        }
    }

    fn context() -> BotContext {
        BotContext {
            exchange: Arc::new(SimExchange::new("Sim")),
            pair: Arc::new(TradePair::new(Coin::new("BTC", "Sim"), Coin::new("USDT", "Sim"), 0.0)),
            fund: Fund::new("main"),
            backtesting: true,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn builtin_bots() {
        let registry = BotRegistry::with_builtin(SwingConfig::default());
        assert_eq!(registry.names(), vec!["PriceSwing"]);
        assert!(registry.create("PriceSwing", context()).is_ok());
    }

    #[test]
    fn unknown_bot() {
        let registry = BotRegistry::new();
        assert!(matches!(registry.create("Nope", context()), Err(Error::UnknownBot(_))));
    }

    #[tokio::test]
    async fn custom_registration() {
        let mut registry = BotRegistry::with_builtin(SwingConfig::default());
        registry.register("Idle", |_| Ok(Box::new(Idle) as Box<dyn Bot>));
        assert_eq!(registry.names(), vec!["Idle", "PriceSwing"]);

        let mut bot = registry.create("Idle", context()).unwrap();
        bot.on_start().await.unwrap();
        bot.step().await.unwrap();
        assert!(matches!(bot.on_position_cancelled(3).await, Err(Error::UnrecognizedOrder(3))));
    }
}
