// ===============================
// src/ledger.rs
// ===============================
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;

use crate::domain::Trade;

pub const DEFAULT_TOTAL: Decimal = dec!(1000);
pub const DEFAULT_FEE_RATE: Decimal = dec!(0.00075);

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: Decimal, available: Decimal },
}

/// Fee-aware balance for one symbol.
///
/// `buy_cost` / `sell_cost` accumulate the notional of buy-side and sell-side
/// fills of the current round trip. They are reset together exactly when the
/// net position returns to zero; that is when profit and fee are realized and
/// the reserved margin goes back into `total`.
#[derive(Debug, Clone, PartialEq)]
pub struct Ledger {
    total: Decimal,
    position: Decimal,
    buy_cost: Decimal,
    sell_cost: Decimal,
    fee_rate: Decimal,
    fee_total: Decimal,
    // notional taken out of `total` by opening fills of the current round trip
    margin: Decimal,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(DEFAULT_TOTAL, DEFAULT_FEE_RATE)
    }
}

impl Ledger {
    pub fn new(total: Decimal, fee_rate: Decimal) -> Self {
        Self {
            total,
            position: Decimal::ZERO,
            buy_cost: Decimal::ZERO,
            sell_cost: Decimal::ZERO,
            fee_rate,
            fee_total: Decimal::ZERO,
            margin: Decimal::ZERO,
        }
    }

    /// Apply a fill. Returns the realized profit, non-zero only when this
    /// trade completes a round trip.
    pub fn add_trade(&mut self, trade: &Trade) -> Result<Decimal, LedgerError> {
        let amount = trade.amount.abs();
        let notional = (amount * trade.price).abs();
        let fee = notional * self.fee_rate;

        // admission check: belum ada state yang diubah
        if trade.kind.is_open() && notional + fee >= self.total {
            return Err(LedgerError::InsufficientBalance {
                required: notional + fee,
                available: self.total,
            });
        }

        let buy_side = trade.kind.is_buy();
        if buy_side {
            self.position += amount;
            self.buy_cost += notional;
        } else {
            self.position -= amount;
            self.sell_cost += notional;
        }

        if self.position.is_zero() {
            let round_trip_fee = (self.buy_cost + self.sell_cost) * self.fee_rate;
            self.fee_total += round_trip_fee;
            let profit = self.sell_cost - self.buy_cost - round_trip_fee;
            if buy_side {
                self.total += self.sell_cost + profit;
            } else {
                self.total += self.buy_cost + profit;
            }
            self.buy_cost = Decimal::ZERO;
            self.sell_cost = Decimal::ZERO;
            self.margin = Decimal::ZERO;
            return Ok(profit);
        }

        if trade.kind.is_open() {
            self.total -= notional;
            self.margin += notional;
        }
        Ok(Decimal::ZERO)
    }

    pub fn set_total(&mut self, total: Decimal) {
        self.total = total;
    }

    pub fn set_fee_rate(&mut self, fee_rate: Decimal) {
        self.fee_rate = fee_rate;
    }

    pub fn total(&self) -> Decimal {
        self.total
    }

    pub fn position(&self) -> Decimal {
        self.position
    }

    pub fn fee_rate(&self) -> Decimal {
        self.fee_rate
    }

    pub fn fee_total(&self) -> Decimal {
        self.fee_total
    }

    pub fn buy_cost(&self) -> Decimal {
        self.buy_cost
    }

    pub fn sell_cost(&self) -> Decimal {
        self.sell_cost
    }

    pub fn margin(&self) -> Decimal {
        self.margin
    }

    /// Realized equity: free balance plus reserved margin. Moves only when a
    /// round trip completes, so consecutive values differ by realized profit.
    pub fn equity(&self) -> Decimal {
        self.total + self.margin
    }

    /// Average entry price of the open round trip, zero when flat.
    pub fn entry_price(&self) -> Decimal {
        if self.position.is_zero() {
            return Decimal::ZERO;
        }
        let cost = if self.position > Decimal::ZERO { self.buy_cost } else { self.sell_cost };
        cost / self.position.abs()
    }
}
