// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Tax split and advance/balance arithmetic.
//!
//! Every computed value is rounded to 2 decimal places, half-up
//! ([`RoundingStrategy::MidpointAwayFromZero`]), at the point it is computed.
//! Tax on a tax-inclusive amount is derived by subtraction, so
//! `base + tax == total` holds exactly for every [`TaxSplit`].
//!
//! # Example
//!
//! ```
//! use groomer_settlement::{Config, MoneyEngine};
//! use rust_decimal_macros::dec;
//!
//! let money = MoneyEngine::new(&Config::default());
//! let split = money.base_from_gross(dec!(590)).unwrap();
//! assert_eq!(split.base, dec!(500.00));
//! assert_eq!(split.tax, dec!(90.00));
//! ```

use crate::config::Config;
use crate::payment::PaymentType;
use crate::SettlementError;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

const DECIMAL_PLACES: u32 = 2;

/// Rounds to 2 decimal places, half-up.
pub fn round2(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(DECIMAL_PLACES, RoundingStrategy::MidpointAwayFromZero)
}

/// Source of the tax rate applied to settlements.
pub trait TaxRateProvider: Send + Sync + fmt::Debug {
    /// Rate as a fraction, e.g. `0.18`.
    fn rate(&self) -> Decimal;
}

/// A single rate for every shop.
#[derive(Debug, Clone, Copy)]
pub struct FixedTaxRate(pub Decimal);

impl TaxRateProvider for FixedTaxRate {
    fn rate(&self) -> Decimal {
        self.0
    }
}

/// An amount decomposed into pre-tax base and tax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaxSplit {
    pub base: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
}

/// What to collect now and what stays owed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SettlementAmount {
    pub amount_due: Decimal,
    pub balance_remaining: Decimal,
    /// Percentage applied; zero for full settlements.
    pub advance_percentage: Decimal,
}

#[derive(Debug, Clone)]
pub struct MoneyEngine {
    rates: Arc<dyn TaxRateProvider>,
    default_advance_percentage: Decimal,
    max_amount: Decimal,
}

impl MoneyEngine {
    pub fn new(config: &Config) -> Self {
        Self::with_rate_provider(config, Arc::new(FixedTaxRate(config.tax_rate)))
    }

    pub fn with_rate_provider(config: &Config, rates: Arc<dyn TaxRateProvider>) -> Self {
        Self {
            rates,
            default_advance_percentage: config.default_advance_percentage,
            max_amount: config.max_amount,
        }
    }

    /// Current rate from the provider.
    ///
    /// # Errors
    ///
    /// Returns [`SettlementError::Configuration`] if the rate is outside `[0, 1)`.
    pub fn tax_rate(&self) -> Result<Decimal, SettlementError> {
        let rate = self.rates.rate();
        if rate < Decimal::ZERO || rate >= Decimal::ONE {
            return Err(SettlementError::Configuration(format!(
                "tax rate must be in [0, 1), got {}",
                rate
            )));
        }
        Ok(rate)
    }

    /// Validates a caller-supplied amount: positive, within the ceiling,
    /// at most 2 decimal places.
    pub fn check_amount(&self, field: &'static str, amount: Decimal) -> Result<Decimal, SettlementError> {
        if amount <= Decimal::ZERO {
            return Err(SettlementError::validation(field, "amount must be positive"));
        }
        if amount > self.max_amount {
            return Err(SettlementError::validation(
                field,
                format!("amount cannot exceed {}", self.max_amount),
            ));
        }
        if amount.normalize().scale() > DECIMAL_PLACES {
            return Err(SettlementError::validation(
                field,
                "amount cannot have more than 2 decimal places",
            ));
        }
        Ok(amount)
    }

    /// Adds tax on top of a pre-tax base.
    pub fn gross_from_base(&self, base: Decimal) -> Result<TaxSplit, SettlementError> {
        let base = self.check_amount("base", base)?;
        let tax = round2(base * self.tax_rate()?);
        Ok(TaxSplit {
            base,
            tax,
            total: round2(base + tax),
        })
    }

    /// Splits a tax-inclusive total back into base and tax.
    pub fn base_from_gross(&self, total: Decimal) -> Result<TaxSplit, SettlementError> {
        let total = self.check_amount("amount", total)?;
        let base = round2(total / (Decimal::ONE + self.tax_rate()?));
        Ok(TaxSplit {
            base,
            tax: total - base,
            total,
        })
    }

    /// Amount due for a first settlement against `total`.
    ///
    /// `advance_percentage` of `None` or zero means the configured default.
    pub fn settlement_amount(
        &self,
        total: Decimal,
        payment_type: PaymentType,
        advance_percentage: Option<Decimal>,
    ) -> Result<SettlementAmount, SettlementError> {
        let total = self.check_amount("amount", total)?;
        self.collect(total, total, payment_type, advance_percentage)
    }

    /// Amount due for a follow-up settlement when `outstanding` of `total`
    /// is still owed.
    ///
    /// A full settlement collects the whole outstanding balance; an advance
    /// collects its percentage of `total`, capped at what is outstanding.
    pub fn balance_settlement(
        &self,
        total: Decimal,
        outstanding: Decimal,
        payment_type: PaymentType,
        advance_percentage: Option<Decimal>,
    ) -> Result<SettlementAmount, SettlementError> {
        let total = self.check_amount("amount", total)?;
        if outstanding <= Decimal::ZERO || outstanding > total {
            return Err(SettlementError::validation(
                "amount",
                format!("no balance outstanding against total {}", total),
            ));
        }
        self.collect(total, outstanding, payment_type, advance_percentage)
    }

    fn collect(
        &self,
        total: Decimal,
        outstanding: Decimal,
        payment_type: PaymentType,
        advance_percentage: Option<Decimal>,
    ) -> Result<SettlementAmount, SettlementError> {
        match payment_type {
            PaymentType::Full => Ok(SettlementAmount {
                amount_due: outstanding,
                balance_remaining: Decimal::ZERO,
                advance_percentage: Decimal::ZERO,
            }),
            PaymentType::Advance => {
                let pct = self.advance_percentage(advance_percentage)?;
                let amount_due = round2(total * pct / dec!(100)).min(outstanding);
                if amount_due <= Decimal::ZERO {
                    return Err(SettlementError::validation(
                        "amount",
                        "advance amount rounds to zero",
                    ));
                }
                Ok(SettlementAmount {
                    amount_due,
                    balance_remaining: round2(outstanding - amount_due),
                    advance_percentage: pct,
                })
            }
        }
    }

    fn advance_percentage(&self, requested: Option<Decimal>) -> Result<Decimal, SettlementError> {
        match requested {
            None => Ok(self.default_advance_percentage),
            Some(pct) if pct.is_zero() => Ok(self.default_advance_percentage),
            Some(pct) if pct < Decimal::ZERO || pct > dec!(100) => Err(SettlementError::validation(
                "advancePercentage",
                format!("must be between 0 and 100, got {}", pct),
            )),
            Some(pct) => Ok(pct),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> MoneyEngine {
        MoneyEngine::new(&Config::default())
    }

    #[test]
    fn round2_is_half_up() {
        assert_eq!(round2(dec!(0.005)), dec!(0.01));
        assert_eq!(round2(dec!(0.015)), dec!(0.02));
        assert_eq!(round2(dec!(2.344)), dec!(2.34));
    }

    #[test]
    fn gross_from_base_adds_tax() {
        let split = engine().gross_from_base(dec!(500)).unwrap();
        assert_eq!(split.tax, dec!(90.00));
        assert_eq!(split.total, dec!(590.00));
        assert_eq!(split.base + split.tax, split.total);
    }

    #[test]
    fn base_from_gross_reconstructs_split() {
        let split = engine().base_from_gross(dec!(100)).unwrap();
        // 100 / 1.18 = 84.745... -> 84.75
        assert_eq!(split.base, dec!(84.75));
        assert_eq!(split.tax, dec!(15.25));
        assert_eq!(split.total, dec!(100));
    }

    #[test]
    fn full_settlement_leaves_no_balance() {
        let amount = engine()
            .settlement_amount(dec!(590), PaymentType::Full, None)
            .unwrap();
        assert_eq!(amount.amount_due, dec!(590));
        assert_eq!(amount.balance_remaining, Decimal::ZERO);
    }

    #[test]
    fn advance_defaults_to_thirty_percent() {
        let amount = engine()
            .settlement_amount(dec!(1000), PaymentType::Advance, None)
            .unwrap();
        assert_eq!(amount.amount_due, dec!(300.00));
        assert_eq!(amount.balance_remaining, dec!(700.00));
        assert_eq!(amount.advance_percentage, dec!(30));

        let zero = engine()
            .settlement_amount(dec!(1000), PaymentType::Advance, Some(Decimal::ZERO))
            .unwrap();
        assert_eq!(zero, amount);
    }

    #[test]
    fn advance_uses_explicit_percentage() {
        let amount = engine()
            .settlement_amount(dec!(999.99), PaymentType::Advance, Some(dec!(50)))
            .unwrap();
        // 499.995 rounds half-up
        assert_eq!(amount.amount_due, dec!(500.00));
        assert_eq!(amount.balance_remaining, dec!(499.99));
    }

    #[test]
    fn rejects_out_of_range_percentage() {
        let result = engine().settlement_amount(dec!(100), PaymentType::Advance, Some(dec!(120)));
        assert!(matches!(
            result,
            Err(SettlementError::Validation { field: "advancePercentage", .. })
        ));
    }

    #[test]
    fn rejects_bounds() {
        let money = engine();
        assert!(money.check_amount("amount", Decimal::ZERO).is_err());
        assert!(money.check_amount("amount", dec!(-5)).is_err());
        assert!(money.check_amount("amount", dec!(100000.01)).is_err());
        assert!(money.check_amount("amount", dec!(100000)).is_ok());
        assert!(money.check_amount("amount", dec!(10.005)).is_err());
        assert!(money.check_amount("amount", dec!(10.50)).is_ok());
    }

    #[test]
    fn balance_settlement_caps_at_outstanding() {
        let money = engine();
        let full = money
            .balance_settlement(dec!(1000), dec!(700), PaymentType::Full, None)
            .unwrap();
        assert_eq!(full.amount_due, dec!(700));
        assert_eq!(full.balance_remaining, Decimal::ZERO);

        let advance = money
            .balance_settlement(dec!(1000), dec!(200), PaymentType::Advance, Some(dec!(30)))
            .unwrap();
        assert_eq!(advance.amount_due, dec!(200));
        assert_eq!(advance.balance_remaining, Decimal::ZERO);
    }

    #[test]
    fn balance_settlement_requires_outstanding() {
        let result = engine().balance_settlement(dec!(1000), Decimal::ZERO, PaymentType::Full, None);
        assert!(result.is_err());
    }

    #[derive(Debug)]
    struct ZeroRated;

    impl TaxRateProvider for ZeroRated {
        fn rate(&self) -> Decimal {
            Decimal::ZERO
        }
    }

    #[test]
    fn rate_provider_is_injected() {
        let money = MoneyEngine::with_rate_provider(&Config::default(), Arc::new(ZeroRated));
        let split = money.base_from_gross(dec!(590)).unwrap();
        assert_eq!(split.base, dec!(590));
        assert_eq!(split.tax, Decimal::ZERO);
    }

    #[derive(Debug)]
    struct Rate(Decimal);

    impl TaxRateProvider for Rate {
        fn rate(&self) -> Decimal {
            self.0
        }
    }

    #[test]
    fn out_of_range_rate_is_configuration_error() {
        for rate in [dec!(-1), dec!(-0.01), Decimal::ONE, dec!(2.5)] {
            let money = MoneyEngine::with_rate_provider(&Config::default(), Arc::new(Rate(rate)));
            assert!(matches!(
                money.base_from_gross(dec!(590)),
                Err(SettlementError::Configuration(_))
            ));
            assert!(matches!(
                money.gross_from_base(dec!(500)),
                Err(SettlementError::Configuration(_))
            ));
        }
    }
}
