use std::ops::Deref;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::engine::{Exchange, OrderId, OrderResult, Trade};
use crate::errors::{Error, Result};

/// A trade that is live on an exchange order book.
///
/// An order dereferences to the [`Trade`] it was created from. Its identity is
/// `(order_id, pair, trade_type)`: two `Order`s describing the same exchange order are equal
/// whatever their amounts.
#[derive(Debug, Clone)]
pub struct Order {
    trade: Trade,
    order_id: OrderId,
    unique_key: Uuid,
    remaining_in: f64,
    created: Option<DateTime<Utc>>,
    updated: DateTime<Utc>,
}

impl Deref for Order {
    type Target = Trade;

    fn deref(&self) -> &Self::Target {
        &self.trade
    }
}

impl PartialEq for Order {
    fn eq(&self, other: &Self) -> bool {
        self.order_id == other.order_id
            && self.trade.pair() == other.trade.pair()
            && self.trade.trade_type() == other.trade.trade_type()
    }
}

impl Order {
    /// Wraps a submitted trade.
    ///
    /// ### Arguments
    /// * `trade` - The trade as it was placed.
    /// * `order_id` - The exchange-assigned id.
    /// * `remaining_in` - CoinIn still to be filled.
    /// * `created` - When the exchange created the order, if known.
    /// * `updated` - When the exchange last reported the order.
    ///
    /// ### Returns
    /// The order, or an error if `remaining_in` is negative or exceeds `amount_in`.
    pub fn new(
        trade: Trade,
        order_id: OrderId,
        remaining_in: f64,
        created: Option<DateTime<Utc>>,
        updated: DateTime<Utc>,
    ) -> Result<Self> {
        if remaining_in < 0.0 || remaining_in.is_nan() {
            return Err(Error::NegativeAmount(remaining_in));
        }
        if remaining_in > trade.amount_in() {
            return Err(Error::RemainingExceedsAmount(remaining_in, trade.amount_in()));
        }
        Ok(Self {
            trade,
            order_id,
            unique_key: Uuid::new_v4(),
            remaining_in,
            created,
            updated,
        })
    }

    /// Keeps a local key across re-creation of the same logical order.
    pub fn with_unique_key(mut self, unique_key: Uuid) -> Self {
        self.unique_key = unique_key;
        self
    }

    /// Exchange id of the order.
    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    /// Local key of the order, stable across local re-creation.
    pub fn unique_key(&self) -> Uuid {
        self.unique_key
    }

    /// CoinIn still waiting to be filled.
    pub fn remaining_in(&self) -> f64 {
        self.remaining_in
    }

    /// CoinIn filled so far.
    pub fn filled_in(&self) -> f64 {
        self.trade.amount_in() - self.remaining_in
    }

    /// Time the exchange accepted the order.
    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.created
    }

    /// Time of the last update from the exchange.
    pub fn updated(&self) -> DateTime<Utc> {
        self.updated
    }

    /// The trade the order was created from.
    pub fn trade(&self) -> &Trade {
        &self.trade
    }

    /// Takes the state of a newer report of the same order.
    ///
    /// ### Returns
    /// - `Ok(true)` if the fields were updated.
    /// - `Ok(false)` if `other` is not newer than `self`, nothing changes.
    /// - `Error::OrderIdentityMismatch` if `other` is another order.
    pub fn update(&mut self, other: &Order) -> Result<bool> {
        if self != other {
            return Err(Error::OrderIdentityMismatch(format!(
                "{} {} {:?} updated from {} {} {:?}",
                self.order_id,
                self.pair().name(),
                self.trade_type(),
                other.order_id,
                other.pair().name(),
                other.trade_type()
            )));
        }
        if other.updated <= self.updated {
            return Ok(false);
        }
        self.trade = other.trade.clone();
        self.remaining_in = other.remaining_in;
        self.created = other.created;
        self.updated = other.updated;
        Ok(true)
    }

    /// Cancels the order on `exchange`.
    pub async fn cancel_order(&self, exchange: &dyn Exchange, cancel: CancellationToken) -> Result<()> {
        debug!(order_id = self.order_id, pair = %self.pair().name(), "Cancelling order");
        exchange.cancel_order(self.pair(), self.order_id, cancel).await
    }

    /// Replaces this order by `replacement`.
    ///
    /// The order is cancelled and the exchange balances are refreshed before `replacement` is
    /// submitted, so the balance the cancel frees is visible to the new order.
    ///
    /// ### Returns
    /// The new order, `Error::Cancelled` if `cancel` fires while waiting for the balance
    /// refresh, or the exchange's error.
    pub async fn create_order(
        &self,
        replacement: &Trade,
        exchange: &dyn Exchange,
        cancel: CancellationToken,
        creator_name: &str,
    ) -> Result<OrderResult> {
        self.cancel_order(exchange, cancel.clone()).await?;

        exchange.request_balance_update();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = exchange.balance_updated() => {}
        }

        replacement.create_order(exchange, cancel, creator_name).await
    }
}
