use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::{
    Candle, Exchange, Notification, Order, OrderCompleted, OrderId, OrderResult, OrderType, Trade, TradeCompleted,
    TradeId, TradePair, TradeType,
};
use crate::errors::{Error, Result};

#[derive(Debug)]
struct SimState {
    next_order_id: OrderId,
    next_trade_id: TradeId,
    now: Option<DateTime<Utc>>,
    orders: Vec<Order>,
    notifications: VecDeque<Notification>,
}

/// Paper exchange for backtesting and fake trading.
///
/// - Market orders fill immediately against the pair's order book.
/// - Limit and stop orders reserve their `amount_in` and rest until [`SimExchange::execute_orders`]
///   sees a candle cross their price. They fill at their own price.
/// - Every fill is charged the pair fee in CoinOut.
/// - Fill and cancel notifications queue up until the host drains them.
#[derive(Debug)]
pub struct SimExchange {
    name: String,
    state: Mutex<SimState>,
    balance_synced: Notify,
}

impl SimExchange {
    /// Creates an exchange with no orders and the wall clock.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(SimState {
                next_order_id: 1,
                next_trade_id: 1,
                now: None,
                orders: Vec::new(),
                notifications: VecDeque::new(),
            }),
            balance_synced: Notify::new(),
        }
    }

    /// Pins the exchange clock to `now`.
    pub fn set_now(&self, now: DateTime<Utc>) {
        self.state.lock().now = Some(now);
    }

    /// Returns a copy of every resting order.
    pub fn orders(&self) -> Vec<Order> {
        self.state.lock().orders.clone()
    }

    /// Returns a copy of the resting order `order_id`.
    pub fn order(&self, order_id: OrderId) -> Option<Order> {
        self.state.lock().orders.iter().find(|o| o.order_id() == order_id).cloned()
    }

    /// Takes every queued notification, oldest first.
    pub fn drain_notifications(&self) -> Vec<Notification> {
        self.state.lock().notifications.drain(..).collect()
    }

    /// Fills every resting order whose price `candle` crosses.
    ///
    /// A buy (Q2B) limit fills when the low reaches its price, a sell (B2Q) limit when the high
    /// does. Stops trigger on the opposite extreme. An order leaves the book only once its fill
    /// is booked: on error it and every order after it keep resting.
    ///
    /// ### Returns
    /// The number of orders filled.
    pub fn execute_orders(&self, candle: &Candle) -> Result<usize> {
        let mut state = self.state.lock();
        let now = state.now.unwrap_or_else(Utc::now);

        let mut filled = 0;
        let mut index = 0;
        while index < state.orders.len() {
            if !Self::crosses(&state.orders[index], candle) {
                index += 1;
                continue;
            }
            let order = state.orders[index].clone();
            let fund = order.fund();
            let coin_in = order.coin_in().clone();
            let reserved = fund.release(&coin_in, order.unique_key());
            if let Err(e) = fund.withdraw(&coin_in, order.remaining_in()) {
                fund.reserve(&coin_in, order.unique_key(), reserved)?;
                return Err(e);
            }

            let amount_out = order.remaining_in() * order.price();
            let trade_id = state.next_trade_id;
            let completed = Self::fill(&order, trade_id, order.remaining_in(), amount_out, now)?;
            state.next_trade_id += 1;
            state.orders.remove(index);
            info!(
                order_id = order.order_id(),
                pair = %order.pair().name(),
                trade_type = ?order.trade_type(),
                price_q2b = order.price_q2b(),
                "Resting order filled"
            );
            state.notifications.push_back(Notification::Filled(completed));
            filled += 1;
        }
        Ok(filled)
    }

    fn crosses(order: &Order, candle: &Candle) -> bool {
        let price = order.price_q2b();
        match (order.order_type(), order.trade_type()) {
            (OrderType::Limit, TradeType::Q2B) | (OrderType::Stop, TradeType::B2Q) => candle.low() <= price,
            (OrderType::Limit, TradeType::B2Q) | (OrderType::Stop, TradeType::Q2B) => candle.high() >= price,
            (OrderType::Market, _) => true,
        }
    }

    /// Credits CoinOut net of fee and builds the fill report.
    fn fill(order: &Order, trade_id: TradeId, amount_in: f64, gross_out: f64, now: DateTime<Utc>) -> Result<OrderCompleted> {
        let commission = gross_out * order.pair().fee();
        let coin_out = order.coin_out().clone();
        order.fund().deposit(&coin_out, gross_out - commission)?;

        let mut completed = OrderCompleted::from(order);
        completed.add(TradeCompleted::new(
            order.order_id(),
            trade_id,
            amount_in,
            gross_out - commission,
            commission,
            coin_out,
            now,
        )?)?;
        Ok(completed)
    }
}

#[async_trait]
impl Exchange for SimExchange {
    fn name(&self) -> &str {
        &self.name
    }

    fn utc_now(&self) -> DateTime<Utc> {
        self.state.lock().now.unwrap_or_else(Utc::now)
    }

    async fn create_order(&self, trade: &Trade, cancel: CancellationToken, creator_name: &str) -> Result<OrderResult> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if trade.amount_in() <= 0.0 {
            return Err(Error::Exchange(format!("order amount must be positive, got {}", trade.amount_in())));
        }

        let mut state = self.state.lock();
        let now = state.now.unwrap_or_else(Utc::now);
        let order_id = state.next_order_id;
        state.next_order_id += 1;
        let order = Order::new(trade.clone(), order_id, trade.amount_in(), Some(now), now)?;
        let pair_name = trade.pair().name();

        if trade.order_type() == OrderType::Market {
            let tt = trade.trade_type();
            let gross_out = trade
                .pair()
                .amount_out(tt, trade.amount_in())
                .ok_or_else(|| Error::NoMarketData(pair_name.clone()))?;
            trade.fund().withdraw(trade.coin_in(), trade.amount_in())?;

            let trade_id = state.next_trade_id;
            state.next_trade_id += 1;
            let completed = Self::fill(&order, trade_id, trade.amount_in(), gross_out, now)?;
            debug!(order_id, creator = creator_name, pair = %pair_name, "Market order filled");
            state.notifications.push_back(Notification::Filled(completed));
            return Ok(OrderResult {
                pair_name,
                order_id,
                filled: true,
                trade_ids: vec![trade_id],
            });
        }

        trade.fund().reserve(trade.coin_in(), order.unique_key(), trade.amount_in())?;
        debug!(order_id, creator = creator_name, pair = %pair_name, "Order resting");
        state.orders.push(order);
        Ok(OrderResult {
            pair_name,
            order_id,
            filled: false,
            trade_ids: Vec::new(),
        })
    }

    async fn cancel_order(&self, pair: &TradePair, order_id: OrderId, cancel: CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut state = self.state.lock();
        let index = state
            .orders
            .iter()
            .position(|o| o.order_id() == order_id && o.pair().as_ref() == pair)
            .ok_or(Error::OrderNotFound(order_id))?;
        let order = state.orders.remove(index);
        order.fund().release(order.coin_in(), order.unique_key());
        state.notifications.push_back(Notification::Cancelled(order_id));
        debug!(order_id, pair = %pair.name(), "Order cancelled");
        Ok(())
    }

    fn request_balance_update(&self) {
        // balances are always current here, the refresh completes immediately
        self.balance_synced.notify_one();
    }

    async fn balance_updated(&self) {
        self.balance_synced.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engine::{Coin, Fund, MarketDepth};

    fn setup() -> (Arc<TradePair>, Fund, SimExchange) {
        let pair = TradePair::new(Coin::new("BTC", "Sim"), Coin::new("USDT", "Sim"), 0.01);
        pair.update_depth(MarketDepth::new(vec![(100.0, 10.0).into()], vec![(101.0, 10.0).into()]));
        let pair = Arc::new(pair);
        let fund = Fund::new("main");
        fund.deposit(pair.base(), 2.0).unwrap();
        fund.deposit(pair.quote(), 1000.0).unwrap();
        (pair, fund, SimExchange::new("Sim"))
    }

    #[tokio::test]
    async fn market_order_fills_immediately() {
        let (pair, fund, exchange) = setup();
        let trade = pair.make_trade(&fund, TradeType::B2Q, 1.0).unwrap();
        let result = exchange.create_order(&trade, CancellationToken::new(), "test").await.unwrap();

        assert!(result.filled);
        assert_eq!(result.pair_name, "BTC/USDT");
        assert_eq!(fund.total(pair.base()), 1.0);
        // 100 quote less 1% fee
        assert!((fund.total(pair.quote()) - 1099.0).abs() < 1e-9);

        let notifications = exchange.drain_notifications();
        assert_eq!(notifications.len(), 1);
        let Notification::Filled(completed) = &notifications[0] else {
            panic!("expected a fill");
        };
        assert_eq!(completed.order_id(), result.order_id);
        assert_eq!(completed.amount_in(), 1.0);
        assert!((completed.commission() - 1.0).abs() < 1e-9);
        assert!(exchange.drain_notifications().is_empty());
    }

    #[tokio::test]
    async fn market_order_needs_balance() {
        let (pair, fund, exchange) = setup();
        let trade = pair.make_trade(&fund, TradeType::B2Q, 5.0).unwrap();
        let result = exchange.create_order(&trade, CancellationToken::new(), "test").await;
        assert!(matches!(result, Err(Error::InsufficientFunds(_, _))));
        assert!(exchange.drain_notifications().is_empty());
    }

    #[tokio::test]
    async fn limit_order_rests_until_crossed() {
        let (pair, fund, exchange) = setup();
        let trade = Trade::from_amount_in(fund.clone(), pair.clone(), OrderType::Limit, TradeType::Q2B, 95.0, 190.0).unwrap();
        let result = exchange.create_order(&trade, CancellationToken::new(), "test").await.unwrap();
        assert!(!result.filled);
        assert_eq!(fund.available(pair.quote()), 810.0);
        assert_eq!(exchange.orders().len(), 1);

        let above = Candle::try_from((0i64, 100.0, 102.0, 96.0, 101.0, 1.0)).unwrap();
        assert_eq!(exchange.execute_orders(&above).unwrap(), 0);

        let through = Candle::try_from((60_000i64, 100.0, 101.0, 94.0, 96.0, 1.0)).unwrap();
        assert_eq!(exchange.execute_orders(&through).unwrap(), 1);
        assert!(exchange.orders().is_empty());
        assert_eq!(fund.total(pair.quote()), 810.0);
        // 2 base less 1% fee
        assert!((fund.total(pair.base()) - 3.98).abs() < 1e-9);
        assert_eq!(exchange.drain_notifications().len(), 1);
    }

    #[tokio::test]
    async fn failed_fill_keeps_order_resting() {
        let (pair, fund, exchange) = setup();
        let trade = Trade::from_amount_in(fund.clone(), pair.clone(), OrderType::Limit, TradeType::Q2B, 95.0, 190.0).unwrap();
        let result = exchange.create_order(&trade, CancellationToken::new(), "test").await.unwrap();
        // the quote backing the order disappears
        let key = exchange.order(result.order_id).unwrap().unique_key();
        fund.release(pair.quote(), key);
        fund.withdraw(pair.quote(), 1000.0).unwrap();

        let through = Candle::try_from((0i64, 100.0, 101.0, 94.0, 96.0, 1.0)).unwrap();
        assert!(matches!(exchange.execute_orders(&through), Err(Error::InsufficientFunds(_, _))));
        assert_eq!(exchange.orders().len(), 1);
        assert!(exchange.drain_notifications().is_empty());

        fund.deposit(pair.quote(), 1000.0).unwrap();
        assert_eq!(exchange.execute_orders(&through).unwrap(), 1);
        assert!(exchange.orders().is_empty());
        assert_eq!(fund.total(pair.quote()), 810.0);
        assert_eq!(exchange.drain_notifications().len(), 1);
    }

    #[tokio::test]
    async fn stop_order_triggers_beyond_spot() {
        let (pair, fund, exchange) = setup();
        let trade = Trade::from_amount_in(fund.clone(), pair.clone(), OrderType::Stop, TradeType::B2Q, 90.0, 1.0).unwrap();
        exchange.create_order(&trade, CancellationToken::new(), "test").await.unwrap();

        let above = Candle::try_from((0i64, 100.0, 102.0, 91.0, 101.0, 1.0)).unwrap();
        assert_eq!(exchange.execute_orders(&above).unwrap(), 0);
        let through = Candle::try_from((60_000i64, 100.0, 101.0, 89.0, 90.0, 1.0)).unwrap();
        assert_eq!(exchange.execute_orders(&through).unwrap(), 1);
    }

    #[tokio::test]
    async fn cancel_releases_reservation() {
        let (pair, fund, exchange) = setup();
        let trade = Trade::from_amount_in(fund.clone(), pair.clone(), OrderType::Limit, TradeType::B2Q, 110.0, 1.5).unwrap();
        let result = exchange.create_order(&trade, CancellationToken::new(), "test").await.unwrap();
        assert_eq!(fund.available(pair.base()), 0.5);

        exchange.cancel_order(&pair, result.order_id, CancellationToken::new()).await.unwrap();
        assert_eq!(fund.available(pair.base()), 2.0);
        assert!(matches!(
            exchange.drain_notifications().as_slice(),
            [Notification::Cancelled(id)] if *id == result.order_id
        ));

        let again = exchange.cancel_order(&pair, result.order_id, CancellationToken::new()).await;
        assert!(matches!(again, Err(Error::OrderNotFound(_))));
    }

    #[tokio::test]
    async fn cancelled_token_aborts_request() {
        let (pair, fund, exchange) = setup();
        let trade = pair.make_trade(&fund, TradeType::B2Q, 1.0).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = exchange.create_order(&trade, cancel, "test").await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(fund.total(pair.base()), 2.0);
    }

    #[test]
    fn simulated_clock() {
        let exchange = SimExchange::new("Sim");
        let at = DateTime::from_timestamp_millis(1_000).unwrap();
        exchange.set_now(at);
        assert_eq!(exchange.utc_now(), at);
    }
}
