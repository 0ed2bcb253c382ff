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

//! Payment records.
//!
//! Payments follow a state machine:
//! - [`Pending`] → [`Completed`] or [`Failed`]
//! - [`Completed`] → [`Refunded`]
//!
//! A settlement writes its payment as [`Pending`] and completes it only once
//! the appointment it funds has been updated.
//!
//! [`Pending`]: PaymentState::Pending
//! [`Completed`]: PaymentState::Completed
//! [`Failed`]: PaymentState::Failed
//! [`Refunded`]: PaymentState::Refunded

use crate::SettlementError;
use crate::base::{AppointmentId, PaymentId, ServiceId, ShopId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const NOTES_SEPARATOR: &str = "\n---\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Cash,
    Card,
    Upi,
    Netbanking,
    Wallet,
}

impl PaymentMethod {
    /// Non-cash methods must carry a transaction reference.
    pub fn requires_transaction_id(&self) -> bool {
        !matches!(self, PaymentMethod::Cash)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::Upi => "upi",
            PaymentMethod::Netbanking => "netbanking",
            PaymentMethod::Wallet => "wallet",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cash" => Ok(PaymentMethod::Cash),
            "card" => Ok(PaymentMethod::Card),
            "upi" => Ok(PaymentMethod::Upi),
            "netbanking" => Ok(PaymentMethod::Netbanking),
            "wallet" => Ok(PaymentMethod::Wallet),
            other => Err(SettlementError::validation(
                "paymentMethod",
                format!("unknown payment method '{}'", other),
            )),
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PaymentType {
    #[default]
    Full,
    Advance,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentType::Full => "full",
            PaymentType::Advance => "advance",
        }
    }
}

impl FromStr for PaymentType {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "full" => Ok(PaymentType::Full),
            "advance" => Ok(PaymentType::Advance),
            other => Err(SettlementError::validation(
                "paymentType",
                format!("unknown payment type '{}'", other),
            )),
        }
    }
}

impl fmt::Display for PaymentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentState {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl PaymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentState::Pending => "pending",
            PaymentState::Completed => "completed",
            PaymentState::Failed => "failed",
            PaymentState::Refunded => "refunded",
        }
    }

    pub fn can_transition_to(&self, next: PaymentState) -> bool {
        matches!(
            (self, next),
            (PaymentState::Pending, PaymentState::Completed)
                | (PaymentState::Pending, PaymentState::Failed)
                | (PaymentState::Completed, PaymentState::Refunded)
        )
    }
}

impl FromStr for PaymentState {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(PaymentState::Pending),
            "completed" => Ok(PaymentState::Completed),
            "failed" => Ok(PaymentState::Failed),
            "refunded" => Ok(PaymentState::Refunded),
            other => Err(SettlementError::validation(
                "status",
                format!(
                    "unknown payment status '{}', must be pending, completed, failed or refunded",
                    other
                ),
            )),
        }
    }
}

impl fmt::Display for PaymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted financial record.
///
/// `amount` is what was collected by this payment; `base_amount + tax_amount`
/// always equals it. `settlement_total` is the tax-inclusive total the payment
/// was settled against and `balance_amount` what is still owed on it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: PaymentId,
    pub shop_id: ShopId,
    pub payer_id: UserId,
    pub manager_id: UserId,
    pub appointment_id: Option<AppointmentId>,
    pub subject_name: Option<String>,
    pub owner_name: Option<String>,
    pub service_id: Option<ServiceId>,
    pub service_name: Option<String>,
    pub amount: Decimal,
    pub base_amount: Decimal,
    pub tax_amount: Decimal,
    pub settlement_total: Decimal,
    pub payment_type: PaymentType,
    pub advance_percentage: Decimal,
    pub balance_amount: Decimal,
    pub method: PaymentMethod,
    pub transaction_id: String,
    pub notes: String,
    pub status: PaymentState,
    /// Set when the payment was written but its appointment never caught up.
    pub needs_reconciliation: bool,
    pub paid_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// Moves the payment to `next`, appending `notes` to the existing notes.
    pub fn transition(&mut self, next: PaymentState, notes: Option<&str>) -> Result<(), SettlementError> {
        if !self.status.can_transition_to(next) {
            return Err(SettlementError::validation(
                "status",
                format!("payment cannot move from {} to {}", self.status, next),
            ));
        }
        self.status = next;
        if let Some(notes) = notes.map(str::trim).filter(|n| !n.is_empty()) {
            if self.notes.is_empty() {
                self.notes = notes.to_string();
            } else {
                self.notes = format!("{}{}{}", self.notes, NOTES_SEPARATOR, notes);
            }
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// True when the amount fields sum correctly.
    pub fn is_balanced(&self) -> bool {
        self.base_amount + self.tax_amount == self.amount
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn payment() -> Payment {
        let now = Utc::now();
        Payment {
            id: PaymentId(1),
            shop_id: ShopId(1),
            payer_id: UserId(2),
            manager_id: UserId(3),
            appointment_id: None,
            subject_name: None,
            owner_name: None,
            service_id: None,
            service_name: None,
            amount: dec!(590),
            base_amount: dec!(500),
            tax_amount: dec!(90),
            settlement_total: dec!(590),
            payment_type: PaymentType::Full,
            advance_percentage: Decimal::ZERO,
            balance_amount: Decimal::ZERO,
            method: PaymentMethod::Cash,
            transaction_id: String::new(),
            notes: String::new(),
            status: PaymentState::Pending,
            needs_reconciliation: false,
            paid_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn parses_methods_case_insensitively() {
        assert_eq!("UPI".parse::<PaymentMethod>().unwrap(), PaymentMethod::Upi);
        assert_eq!(" cash ".parse::<PaymentMethod>().unwrap(), PaymentMethod::Cash);
        let err = "cheque".parse::<PaymentMethod>().unwrap_err();
        assert!(matches!(err, SettlementError::Validation { field: "paymentMethod", .. }));
    }

    #[test]
    fn only_cash_skips_transaction_id() {
        assert!(!PaymentMethod::Cash.requires_transaction_id());
        assert!(PaymentMethod::Card.requires_transaction_id());
        assert!(PaymentMethod::Wallet.requires_transaction_id());
    }

    #[test]
    fn unknown_payment_type_names_field() {
        let err = "partial".parse::<PaymentType>().unwrap_err();
        assert!(matches!(err, SettlementError::Validation { field: "paymentType", .. }));
    }

    #[test]
    fn completed_payment_can_only_be_refunded() {
        let mut p = payment();
        p.transition(PaymentState::Completed, None).unwrap();
        assert!(p.transition(PaymentState::Failed, None).is_err());
        assert!(p.transition(PaymentState::Pending, None).is_err());
        p.transition(PaymentState::Refunded, Some("customer cancelled")).unwrap();
        assert_eq!(p.status, PaymentState::Refunded);
        assert!(p.transition(PaymentState::Completed, None).is_err());
    }

    #[test]
    fn notes_are_appended_with_separator() {
        let mut p = payment();
        p.notes = "first visit".into();
        p.transition(PaymentState::Completed, Some("settled at desk")).unwrap();
        assert_eq!(p.notes, "first visit\n---\nsettled at desk");
    }

    #[test]
    fn balanced_when_base_and_tax_sum_to_amount() {
        let mut p = payment();
        assert!(p.is_balanced());
        p.tax_amount = dec!(89.99);
        assert!(!p.is_balanced());
    }

    #[test]
    fn serializes_enums_lowercase() {
        let json = serde_json::to_value(payment()).unwrap();
        assert_eq!(json["method"], "cash");
        assert_eq!(json["paymentType"], "full");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["amount"], "590");
    }
}
