use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bot::{Bot, BotContext};
use crate::config::BacktestConfig;
use crate::engine::{
    Candle, CandleBuilder, CandleStyle, Coin, Fund, Instrument, MarketDepth, MemoryPriceData, Notification,
    SimExchange, TradePair,
};
use crate::errors::{Error, Result};
use crate::utils::ms_to_datetime;

const EXCHANGE_NAME: &str = "Sim";

/// Outcome of a backtest run.
#[derive(Debug, Clone, PartialEq)]
pub struct BacktestReport {
    /// Candles replayed.
    pub candles: usize,
    /// Bot ticks.
    pub steps: usize,
    /// Fills the bot accepted.
    pub orders_filled: usize,
    /// Cancellations the bot accepted.
    pub orders_cancelled: usize,
    /// Fills the bot didn't recognize.
    pub unrecognized_fills: usize,
    /// Base balance before the run.
    pub initial_base: f64,
    /// Quote balance before the run.
    pub initial_quote: f64,
    /// Base balance after the run.
    pub final_base: f64,
    /// Quote balance after the run.
    pub final_quote: f64,
    /// Close of the last candle.
    pub final_price: f64,
}

impl BacktestReport {
    /// Value of the initial balances in quote, at the final price.
    pub fn initial_value(&self) -> f64 {
        self.initial_quote + self.initial_base * self.final_price
    }

    /// Value of the final balances in quote, at the final price.
    pub fn final_value(&self) -> f64 {
        self.final_quote + self.final_base * self.final_price
    }

    /// Relative change between [`Self::initial_value`] and [`Self::final_value`].
    ///
    /// Both are valued at the same price, so this is what trading added over holding.
    pub fn equity_change(&self) -> f64 {
        let initial = self.initial_value();
        if initial == 0.0 {
            return 0.0;
        }
        (self.final_value() - initial) / initial
    }
}

impl fmt::Display for BacktestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "candles:       {} ({} steps)", self.candles, self.steps)?;
        writeln!(
            f,
            "orders:        {} filled, {} cancelled, {} unrecognized fills",
            self.orders_filled, self.orders_cancelled, self.unrecognized_fills
        )?;
        writeln!(f, "base:          {:.8} -> {:.8}", self.initial_base, self.final_base)?;
        writeln!(f, "quote:         {:.2} -> {:.2}", self.initial_quote, self.final_quote)?;
        writeln!(f, "final price:   {:.2}", self.final_price)?;
        write!(f, "equity change: {:.4}%", self.equity_change() * 100.0)
    }
}

/// Replays historical candles through a [`SimExchange`] and drives a bot over them.
///
/// Each candle is split into `steps_per_candle` partial candles (see [`Candle::sub_candle`]).
/// At every step the backtest:
/// 1. Feeds the partial candle to an [`Instrument`] and reads the latest close back.
/// 2. Moves the exchange clock and rebuilds a synthetic order book around that close.
/// 3. Fills resting orders the move since the previous step crossed.
/// 4. Calls [`Bot::step`], then hands the exchange's notifications to the bot.
///
/// Fills the bot doesn't recognize are counted and ignored. Cancellations it doesn't
/// recognize end the run.
pub struct Backtest {
    data: Arc<[Candle]>,
    config: BacktestConfig,
    pair: Arc<TradePair>,
    fund: Fund,
    exchange: Arc<SimExchange>,
    cancel: CancellationToken,
}

impl Backtest {
    /// Creates a backtest over `data` with the balances and market of `config`.
    ///
    /// ### Arguments
    /// * `data` - Candles in strictly ascending time order.
    /// * `config` - Pair, fee, initial balances and order book shape.
    ///
    /// ### Returns
    /// The backtest, `Error::CandleDataEmpty` without candles, or `Error::InvalidCandle` if
    /// they are out of order.
    ///
    /// ### Example
    /// ```rust
    /// use swing_rs::prelude::*;
    ///
    /// let candle = Candle::try_from((0i64, 100.0, 110.0, 95.0, 105.0, 1.0)).unwrap();
    /// let bt = Backtest::new(vec![candle], BacktestConfig::default()).unwrap();
    /// assert_eq!(bt.fund().total(bt.pair().quote()), 10_000.0);
    /// ```
    pub fn new(data: Vec<Candle>, config: BacktestConfig) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::CandleDataEmpty);
        }
        if let Some(i) = data.windows(2).position(|w| w[0].timestamp() >= w[1].timestamp()) {
            return Err(Error::InvalidCandle(format!("timestamps not ascending at index {}", i + 1)));
        }

        let pair = Arc::new(TradePair::new(
            Coin::new(&config.base, EXCHANGE_NAME),
            Coin::new(&config.quote, EXCHANGE_NAME),
            config.fee,
        ));
        let fund = Fund::new("backtest");
        fund.deposit(pair.base(), config.initial_base)?;
        fund.deposit(pair.quote(), config.initial_quote)?;

        Ok(Self {
            data: Arc::from(data),
            config,
            pair,
            fund,
            exchange: Arc::new(SimExchange::new(EXCHANGE_NAME)),
            cancel: CancellationToken::new(),
        })
    }

    /// The simulated pair.
    pub fn pair(&self) -> &Arc<TradePair> {
        &self.pair
    }

    /// The fund the bot trades with.
    pub fn fund(&self) -> &Fund {
        &self.fund
    }

    /// The simulated exchange.
    pub fn exchange(&self) -> &Arc<SimExchange> {
        &self.exchange
    }

    /// Settings of this run.
    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    /// The context a bot under test trades with.
    pub fn context(&self) -> BotContext {
        BotContext {
            exchange: self.exchange.clone(),
            pair: self.pair.clone(),
            fund: self.fund.clone(),
            backtesting: true,
            cancel: self.cancel.child_token(),
        }
    }

    /// Runs `bot` over every candle, from `on_start` to `on_stop`.
    ///
    /// ### Returns
    /// The report, or the first error raised by the bot, the exchange or the candle data.
    pub async fn run(&self, bot: &mut dyn Bot) -> Result<BacktestReport> {
        let time_frame = self.config.time_frame;
        let steps = self.config.steps_per_candle.max(1) as i64;
        let source = Arc::new(RwLock::new(MemoryPriceData::new(time_frame, Vec::new())?));
        let mut instrument = Instrument::new(self.pair.clone(), Box::new(source.clone()), CandleStyle::Standard)
            .with_chunk_size(self.config.cache_chunk_size);

        let mut report = BacktestReport {
            candles: 0,
            steps: 0,
            orders_filled: 0,
            orders_cancelled: 0,
            unrecognized_fills: 0,
            initial_base: self.fund.total(self.pair.base()),
            initial_quote: self.fund.total(self.pair.quote()),
            final_base: 0.0,
            final_quote: 0.0,
            final_price: 0.0,
        };
        info!(pair = %self.pair.name(), candles = self.data.len(), steps, "Backtest started");

        bot.on_start().await?;
        let mut last_price: Option<f64> = None;
        for candle in self.data.iter() {
            for s in 1..=steps {
                let at = candle.timestamp() + time_frame.millis() * s / steps;
                let event = source.write().push(candle.sub_candle(at, time_frame))?;
                instrument.on_data_changed(&event)?;
                let Some(current) = instrument.latest()? else {
                    continue;
                };
                let price = current.close();

                self.exchange.set_now(ms_to_datetime(at));
                self.pair.update_depth(MarketDepth::synthetic(
                    price,
                    self.config.spread_frac,
                    self.config.depth_levels,
                    self.config.level_volume,
                ));

                // straight line from the previous step
                let prev = last_price.replace(price).unwrap_or(price);
                let moved = CandleBuilder::builder()
                    .timestamp(at)
                    .open(prev)
                    .high(prev.max(price))
                    .low(prev.min(price))
                    .close(price)
                    .build()?;
                let filled = self.exchange.execute_orders(&moved)?;
                if filled > 0 {
                    debug!(filled, at, "Resting orders filled");
                }
                self.dispatch(bot, &mut report).await?;

                bot.step().await?;
                self.dispatch(bot, &mut report).await?;
                report.steps += 1;
            }
            report.candles += 1;
        }
        bot.on_stop().await?;
        self.dispatch(bot, &mut report).await?;

        report.final_base = self.fund.total(self.pair.base());
        report.final_quote = self.fund.total(self.pair.quote());
        report.final_price = last_price.unwrap_or_default();
        info!(
            steps = report.steps,
            filled = report.orders_filled,
            equity_change = report.equity_change(),
            "Backtest finished"
        );
        Ok(report)
    }

    async fn dispatch(&self, bot: &mut dyn Bot, report: &mut BacktestReport) -> Result<()> {
        for notification in self.exchange.drain_notifications() {
            match notification {
                Notification::Filled(fill) => match bot.on_position_filled(fill.order_id(), &fill).await {
                    Ok(()) => report.orders_filled += 1,
                    Err(Error::UnrecognizedOrder(order_id)) => {
                        debug!(order_id, "Fill of an order the bot doesn't track");
                        report.unrecognized_fills += 1;
                    }
                    Err(e) => return Err(e),
                },
                Notification::Cancelled(order_id) => {
                    bot.on_position_cancelled(order_id).await?;
                    report.orders_cancelled += 1;
                }
            }
        }
        Ok(())
    }
}
