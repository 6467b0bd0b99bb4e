use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::engine::Coin;
use crate::errors::{Error, Result};

/// Balance of one coin within a fund.
#[derive(Debug, Clone, Default)]
pub struct Balance {
    // Total holdings, including reserved amounts
    total: f64,
    // Amounts held by live orders, keyed by the order's unique key
    reserved: HashMap<Uuid, f64>,
}

impl Balance {
    /// Whole balance, reserved included.
    pub fn total(&self) -> f64 {
        self.total
    }

    /// Sum of all reservations.
    pub fn reserved(&self) -> f64 {
        self.reserved.values().sum()
    }

    /// Amount free for new orders.
    pub fn available(&self) -> f64 {
        (self.total - self.reserved()).max(0.0)
    }
}

/// A named partition of an exchange account.
///
/// `Fund` is a cheap handle: clones share the same balances, so the exchange can update
/// them while trades and bots read them.
#[derive(Debug, Clone)]
pub struct Fund {
    id: Arc<str>,
    balances: Arc<RwLock<HashMap<Coin, Balance>>>,
}

impl PartialEq for Fund {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Fund {
    /// Creates an empty fund.
    pub fn new(id: &str) -> Self {
        Self {
            id: Arc::from(id),
            balances: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Name of the fund.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns a snapshot of the balance of `coin`.
    pub fn balance(&self, coin: &Coin) -> Balance {
        self.balances.read().get(coin).cloned().unwrap_or_default()
    }

    /// Returns the total holdings of `coin`.
    pub fn total(&self, coin: &Coin) -> f64 {
        self.balance(coin).total()
    }

    /// Returns the amount of `coin` free for new orders.
    pub fn available(&self, coin: &Coin) -> f64 {
        self.balance(coin).available()
    }

    /// Returns the amount of `coin` reserved under `key`, or zero.
    pub fn reserved(&self, coin: &Coin, key: Uuid) -> f64 {
        self.balances
            .read()
            .get(coin)
            .and_then(|b| b.reserved.get(&key).copied())
            .unwrap_or(0.0)
    }

    /// Adds funds.
    pub fn deposit(&self, coin: &Coin, amount: f64) -> Result<()> {
        if amount < 0.0 {
            return Err(Error::NegativeAmount(amount));
        }
        self.balances.write().entry(coin.clone()).or_default().total += amount;
        Ok(())
    }

    /// Removes funds that are not reserved.
    pub fn withdraw(&self, coin: &Coin, amount: f64) -> Result<()> {
        if amount < 0.0 {
            return Err(Error::NegativeAmount(amount));
        }
        let mut balances = self.balances.write();
        let balance = balances.entry(coin.clone()).or_default();
        let available = balance.available();
        if amount > available {
            return Err(Error::InsufficientFunds(amount, available));
        }
        balance.total -= amount;
        Ok(())
    }

    /// Locks funds for a live order.
    pub fn reserve(&self, coin: &Coin, key: Uuid, amount: f64) -> Result<()> {
        if amount < 0.0 {
            return Err(Error::NegativeAmount(amount));
        }
        let mut balances = self.balances.write();
        let balance = balances.entry(coin.clone()).or_default();
        let available = balance.available();
        if amount > available {
            return Err(Error::InsufficientFunds(amount, available));
        }
        *balance.reserved.entry(key).or_default() += amount;
        Ok(())
    }

    /// Unlocks the funds held under `key`.
    ///
    /// ### Returns
    /// The amount that was released.
    pub fn release(&self, coin: &Coin, key: Uuid) -> f64 {
        self.balances
            .write()
            .get_mut(coin)
            .and_then(|b| b.reserved.remove(&key))
            .unwrap_or(0.0)
    }
}
