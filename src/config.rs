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

//! Engine configuration.
//!
//! Defaults match the grooming shops' current policy: 18% GST, 30% advance,
//! a ₹100,000 ceiling per settlement.

use crate::SettlementError;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Tax rate as a fraction (0.18 = 18%).
    pub tax_rate: Decimal,
    /// Percentage collected by an advance settlement that names none.
    pub default_advance_percentage: Decimal,
    /// Largest total a single settlement may quote.
    pub max_amount: Decimal,
    pub max_notes_len: usize,
    pub max_transaction_id_len: usize,
    /// How long an idempotency key blocks a resubmission.
    pub idempotency_window: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tax_rate: dec!(0.18),
            default_advance_percentage: dec!(30),
            max_amount: dec!(100000),
            max_notes_len: 200,
            max_transaction_id_len: 100,
            idempotency_window: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl Config {
    /// Loads configuration from `GROOMER_*` environment variables.
    ///
    /// Missing or unparsable values fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            tax_rate: env_decimal("GROOMER_TAX_RATE").unwrap_or(defaults.tax_rate),
            default_advance_percentage: env_decimal("GROOMER_ADVANCE_PERCENTAGE")
                .unwrap_or(defaults.default_advance_percentage),
            max_amount: env_decimal("GROOMER_MAX_AMOUNT").unwrap_or(defaults.max_amount),
            idempotency_window: std::env::var("GROOMER_IDEMPOTENCY_WINDOW_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.idempotency_window),
            ..defaults
        }
    }

    /// Rejects values the money engine cannot work with.
    pub fn validate(&self) -> Result<(), SettlementError> {
        if self.tax_rate < Decimal::ZERO || self.tax_rate >= Decimal::ONE {
            return Err(SettlementError::Configuration(format!(
                "tax rate must be within [0, 1), got {}",
                self.tax_rate
            )));
        }
        if self.default_advance_percentage <= Decimal::ZERO
            || self.default_advance_percentage > dec!(100)
        {
            return Err(SettlementError::Configuration(format!(
                "default advance percentage must be within (0, 100], got {}",
                self.default_advance_percentage
            )));
        }
        if self.max_amount <= Decimal::ZERO {
            return Err(SettlementError::Configuration(format!(
                "maximum amount must be positive, got {}",
                self.max_amount
            )));
        }
        Ok(())
    }
}

fn env_decimal(key: &str) -> Option<Decimal> {
    std::env::var(key)
        .ok()
        .and_then(|v| Decimal::from_str(v.trim()).ok())
}
