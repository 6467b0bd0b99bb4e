use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::engine::{OrderCompleted, OrderId, Trade, TradeId, TradePair};
use crate::errors::Result;

/// Outcome of submitting a trade.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderResult {
    /// Name of the pair the order was placed on.
    pub pair_name: String,
    /// Exchange-assigned order id.
    pub order_id: OrderId,
    /// True if the order filled completely on submission.
    pub filled: bool,
    /// Fills that happened on submission.
    pub trade_ids: Vec<TradeId>,
}

/// Events an exchange reports about orders after submission.
#[derive(Debug, Clone)]
pub enum Notification {
    /// The order filled.
    Filled(OrderCompleted),
    /// The order was cancelled before filling.
    Cancelled(OrderId),
}

impl Notification {
    /// The order the notification is about.
    pub fn order_id(&self) -> OrderId {
        match self {
            Self::Filled(completed) => completed.order_id(),
            Self::Cancelled(order_id) => *order_id,
        }
    }
}

/// An exchange orders can be placed on.
///
/// Implementations own all exchange-side state. Callers never write balances or books
/// directly, they go through `create_order` and `cancel_order`.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Display name of the exchange.
    fn name(&self) -> &str;

    /// Current time as the exchange sees it.
    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Places `trade` on the exchange.
    ///
    /// ### Arguments
    /// * `trade` - The trade to place. Its order type decides whether it fills or rests.
    /// * `cancel` - Aborts the request when cancelled.
    /// * `creator_name` - Name of whoever created the trade, for the exchange's records.
    async fn create_order(&self, trade: &Trade, cancel: CancellationToken, creator_name: &str) -> Result<OrderResult>;

    /// Cancels a live order.
    async fn cancel_order(&self, pair: &TradePair, order_id: OrderId, cancel: CancellationToken) -> Result<()>;

    /// Flags that balances must be refreshed before the next balance-dependent request.
    fn request_balance_update(&self);

    /// Resolves once balances have been refreshed after `request_balance_update`.
    async fn balance_updated(&self);
}
