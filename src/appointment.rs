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

//! Subjects, appointments and the appointment state machine.
//!
//! An appointment carries two orthogonal statuses:
//!
//! ```text
//!  status:         pending ─► confirmed ─► in-progress ─► completed
//!                     └──────────┴─────────────┴──► cancelled
//!
//!  payment status: pending ─► partial ─► paid ─► refunded
//!                     └──► cancelled
//! ```
//!
//! Neither axis ever moves backward; `completed` and `cancelled` are terminal.
//! A `paid` appointment is always `completed`.
//!
//! # Example
//!
//! ```
//! use groomer_settlement::{AppointmentStatus, PaymentStatus};
//!
//! let status: AppointmentStatus = "in-progress".parse().unwrap();
//! assert_eq!(status, AppointmentStatus::InProgress);
//! assert!("booked".parse::<PaymentStatus>().is_err());
//! ```

use crate::SettlementError;
use crate::base::{AppointmentId, PaymentId, ServiceId, ShopId, SubjectId};
use crate::money::SettlementAmount;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AppointmentStatus {
    #[default]
    Pending,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::InProgress => "in-progress",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AppointmentStatus::Completed | AppointmentStatus::Cancelled)
    }

    fn rank(&self) -> u8 {
        match self {
            AppointmentStatus::Pending => 0,
            AppointmentStatus::Confirmed => 1,
            AppointmentStatus::InProgress => 2,
            AppointmentStatus::Completed | AppointmentStatus::Cancelled => 3,
        }
    }
}

impl FromStr for AppointmentStatus {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(AppointmentStatus::Pending),
            "confirmed" => Ok(AppointmentStatus::Confirmed),
            "in-progress" => Ok(AppointmentStatus::InProgress),
            "completed" => Ok(AppointmentStatus::Completed),
            "cancelled" => Ok(AppointmentStatus::Cancelled),
            other => Err(SettlementError::validation(
                "status",
                format!("unknown appointment status '{}'", other),
            )),
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Partial,
    Paid,
    Cancelled,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Partial => "partial",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::Refunded => "refunded",
        }
    }

    /// Whether a settlement may still be recorded.
    pub fn accepts_payment(&self) -> bool {
        matches!(self, PaymentStatus::Pending | PaymentStatus::Partial)
    }
}

impl FromStr for PaymentStatus {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(PaymentStatus::Pending),
            "partial" => Ok(PaymentStatus::Partial),
            "paid" => Ok(PaymentStatus::Paid),
            "cancelled" => Ok(PaymentStatus::Cancelled),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(SettlementError::validation(
                "paymentStatus",
                format!("unknown payment status '{}'", other),
            )),
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bookable subject (a pet) registered with a shop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub id: SubjectId,
    pub shop_id: ShopId,
    pub name: String,
    pub kind: String,
    pub breed: Option<String>,
    /// Canonical owner name; preferred over anything a payer supplies.
    pub owner_name: Option<String>,
    pub owner_phone: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubject {
    pub shop_id: ShopId,
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub breed: Option<String>,
    #[serde(default)]
    pub owner_name: Option<String>,
    #[serde(default)]
    pub owner_phone: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAppointment {
    pub subject_id: SubjectId,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub service_ids: Vec<ServiceId>,
    /// Price snapshot at booking; zero when not quoted yet.
    #[serde(default)]
    pub price: Decimal,
}

/// One booking of a subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    pub id: AppointmentId,
    pub shop_id: ShopId,
    pub subject_id: SubjectId,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub service_ids: Vec<ServiceId>,
    pub price: Decimal,
    pub status: AppointmentStatus,
    pub payment_status: PaymentStatus,
    /// Total quoted by the first settlement; later settlements must match it.
    pub settlement_total: Option<Decimal>,
    /// Sum collected by completed settlements.
    pub collected: Decimal,
    pub payment_ids: Vec<PaymentId>,
    /// Store version, bumped on every committed write.
    pub version: u64,
}

impl Appointment {
    fn new(id: AppointmentId, shop_id: ShopId, booking: NewAppointment) -> Self {
        Self {
            id,
            shop_id,
            subject_id: booking.subject_id,
            scheduled_for: booking.scheduled_for,
            service_ids: booking.service_ids,
            price: booking.price,
            status: AppointmentStatus::Pending,
            payment_status: PaymentStatus::Pending,
            settlement_total: None,
            collected: Decimal::ZERO,
            payment_ids: Vec::new(),
            version: 0,
        }
    }

    fn assert_invariants(&self) {
        debug_assert!(
            self.payment_status != PaymentStatus::Paid
                || self.status == AppointmentStatus::Completed,
            "Invariant violated: paid appointment {} is {}",
            self.id,
            self.status
        );
        debug_assert!(
            self.payment_status != PaymentStatus::Partial
                || self.outstanding().is_some_and(|o| o > Decimal::ZERO),
            "Invariant violated: partial appointment {} has no balance",
            self.id
        );
        debug_assert!(
            self.settlement_total.is_none_or(|total| self.collected <= total),
            "Invariant violated: appointment {} collected more than its total",
            self.id
        );
    }

    /// Balance still owed, once a first settlement has fixed the total.
    pub fn outstanding(&self) -> Option<Decimal> {
        self.settlement_total.map(|total| total - self.collected)
    }

    /// Fails unless a settlement may be recorded against this appointment.
    pub fn check_settleable(&self) -> Result<(), SettlementError> {
        if self.status == AppointmentStatus::Cancelled {
            return Err(SettlementError::validation(
                "appointmentId",
                "appointment is cancelled",
            ));
        }
        if !self.payment_status.accepts_payment() {
            return Err(SettlementError::validation(
                "appointmentId",
                format!("appointment is already {}", self.payment_status),
            ));
        }
        Ok(())
    }

    /// Records a settlement of `amount` against `total`.
    ///
    /// Clearing the balance marks the appointment paid and completes it,
    /// backfilling an unset price with the settled total. Leaving a balance
    /// marks it partial and moves a pending appointment in progress.
    pub fn apply_settlement(
        &mut self,
        payment_id: PaymentId,
        total: Decimal,
        amount: &SettlementAmount,
    ) -> Result<(), SettlementError> {
        self.check_settleable()?;
        match self.settlement_total {
            Some(existing) if existing != total => {
                return Err(SettlementError::validation(
                    "amount",
                    format!("total {} does not match the settled total {}", total, existing),
                ));
            }
            Some(_) => {}
            None => self.settlement_total = Some(total),
        }

        self.collected += amount.amount_due;
        self.payment_ids.push(payment_id);

        if amount.balance_remaining.is_zero() {
            self.payment_status = PaymentStatus::Paid;
            if !self.status.is_terminal() {
                self.status = AppointmentStatus::Completed;
            }
            if self.price.is_zero() {
                self.price = total;
            }
        } else {
            self.payment_status = PaymentStatus::Partial;
            if self.status == AppointmentStatus::Pending {
                self.status = AppointmentStatus::InProgress;
            }
        }

        self.assert_invariants();
        Ok(())
    }

    /// Manual status edit by shop staff.
    pub fn set_status(&mut self, next: AppointmentStatus) -> Result<(), SettlementError> {
        if next == self.status {
            return Ok(());
        }
        if self.status.is_terminal() {
            return Err(SettlementError::validation(
                "status",
                format!("appointment is already {}", self.status),
            ));
        }
        if next != AppointmentStatus::Cancelled && next.rank() < self.status.rank() {
            return Err(SettlementError::validation(
                "status",
                format!("cannot move from {} back to {}", self.status, next),
            ));
        }
        if next == AppointmentStatus::Completed && self.payment_status == PaymentStatus::Partial {
            return Err(SettlementError::validation(
                "status",
                "appointment has an outstanding balance",
            ));
        }
        if next == AppointmentStatus::Cancelled && self.payment_status == PaymentStatus::Pending {
            self.payment_status = PaymentStatus::Cancelled;
        }
        self.status = next;
        self.assert_invariants();
        Ok(())
    }

    /// Manual payment-status edit by shop staff.
    ///
    /// Marking a booking paid completes it. `partial` is reserved for advance
    /// settlements, which carry the balance it implies.
    pub fn set_payment_status(&mut self, next: PaymentStatus) -> Result<(), SettlementError> {
        if next == self.payment_status {
            return Ok(());
        }
        let allowed = matches!(
            (self.payment_status, next),
            (PaymentStatus::Pending, PaymentStatus::Paid)
                | (PaymentStatus::Pending, PaymentStatus::Cancelled)
                | (PaymentStatus::Pending, PaymentStatus::Refunded)
                | (PaymentStatus::Partial, PaymentStatus::Paid)
                | (PaymentStatus::Partial, PaymentStatus::Refunded)
                | (PaymentStatus::Paid, PaymentStatus::Refunded)
        );
        if !allowed {
            return Err(SettlementError::validation(
                "paymentStatus",
                format!("cannot move from {} to {}", self.payment_status, next),
            ));
        }
        if next == PaymentStatus::Paid {
            if self.status == AppointmentStatus::Cancelled {
                return Err(SettlementError::validation(
                    "paymentStatus",
                    "appointment is cancelled",
                ));
            }
            self.status = AppointmentStatus::Completed;
            if let Some(total) = self.settlement_total {
                self.collected = total;
            }
        }
        self.payment_status = next;
        self.assert_invariants();
        Ok(())
    }
}

/// Failure of a conditional appointment write.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommitError {
    #[error("appointment no longer exists")]
    Missing,

    #[error("appointment changed concurrently (expected version {expected}, found {found})")]
    VersionConflict { expected: u64, found: u64 },

    #[error("appointment store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence for subjects and appointments.
///
/// [`commit`](AppointmentStore::commit) is a compare-and-swap on
/// [`Appointment::version`]: it succeeds only if the stored version still
/// equals the version the caller read.
pub trait AppointmentStore: Send + Sync {
    fn subject(&self, id: SubjectId) -> Option<Subject>;

    /// Looks a subject up by name within one shop.
    fn find_subject(&self, shop_id: ShopId, name: &str) -> Option<Subject>;

    fn insert_subject(&self, subject: NewSubject) -> Subject;

    fn appointment(&self, id: AppointmentId) -> Option<Appointment>;

    fn appointments_for_shop(&self, shop_id: ShopId) -> Vec<Appointment>;

    fn appointments_for_subject(&self, subject_id: SubjectId) -> Vec<Appointment>;

    fn insert_appointment(&self, shop_id: ShopId, booking: NewAppointment) -> Appointment;

    /// Writes `appointment` and returns it with its new version.
    fn commit(&self, appointment: Appointment) -> Result<Appointment, CommitError>;
}

#[derive(Debug, Default)]
pub struct InMemoryAppointments {
    subjects: DashMap<SubjectId, Subject>,
    appointments: DashMap<AppointmentId, Appointment>,
    next_subject: AtomicU32,
    next_appointment: AtomicU32,
}

impl InMemoryAppointments {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AppointmentStore for InMemoryAppointments {
    fn subject(&self, id: SubjectId) -> Option<Subject> {
        self.subjects.get(&id).map(|s| s.clone())
    }

    fn find_subject(&self, shop_id: ShopId, name: &str) -> Option<Subject> {
        let name = name.trim();
        self.subjects
            .iter()
            .filter(|s| s.shop_id == shop_id && s.name.eq_ignore_ascii_case(name))
            .min_by_key(|s| s.id)
            .map(|s| s.clone())
    }

    fn insert_subject(&self, subject: NewSubject) -> Subject {
        let id = SubjectId(self.next_subject.fetch_add(1, Ordering::SeqCst) + 1);
        let subject = Subject {
            id,
            shop_id: subject.shop_id,
            name: subject.name.trim().to_string(),
            kind: subject.kind.trim().to_string(),
            breed: subject.breed,
            owner_name: subject.owner_name,
            owner_phone: subject.owner_phone,
        };
        self.subjects.insert(id, subject.clone());
        subject
    }

    fn appointment(&self, id: AppointmentId) -> Option<Appointment> {
        self.appointments.get(&id).map(|a| a.clone())
    }

    fn appointments_for_shop(&self, shop_id: ShopId) -> Vec<Appointment> {
        let mut found: Vec<Appointment> = self
            .appointments
            .iter()
            .filter(|a| a.shop_id == shop_id)
            .map(|a| a.clone())
            .collect();
        found.sort_by_key(|a| (a.scheduled_for, a.id));
        found
    }

    fn appointments_for_subject(&self, subject_id: SubjectId) -> Vec<Appointment> {
        let mut found: Vec<Appointment> = self
            .appointments
            .iter()
            .filter(|a| a.subject_id == subject_id)
            .map(|a| a.clone())
            .collect();
        found.sort_by_key(|a| a.id);
        found
    }

    fn insert_appointment(&self, shop_id: ShopId, booking: NewAppointment) -> Appointment {
        let id = AppointmentId(self.next_appointment.fetch_add(1, Ordering::SeqCst) + 1);
        let appointment = Appointment::new(id, shop_id, booking);
        self.appointments.insert(id, appointment.clone());
        appointment
    }

    fn commit(&self, mut appointment: Appointment) -> Result<Appointment, CommitError> {
        let mut stored = self
            .appointments
            .get_mut(&appointment.id)
            .ok_or(CommitError::Missing)?;
        if stored.version != appointment.version {
            return Err(CommitError::VersionConflict {
                expected: appointment.version,
                found: stored.version,
            });
        }
        appointment.version += 1;
        *stored = appointment.clone();
        Ok(appointment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn booked() -> Appointment {
        Appointment::new(
            AppointmentId(1),
            ShopId(1),
            NewAppointment {
                subject_id: SubjectId(1),
                ..NewAppointment::default()
            },
        )
    }

    fn full(total: Decimal) -> SettlementAmount {
        SettlementAmount {
            amount_due: total,
            balance_remaining: Decimal::ZERO,
            advance_percentage: Decimal::ZERO,
        }
    }

    fn advance(due: Decimal, balance: Decimal) -> SettlementAmount {
        SettlementAmount {
            amount_due: due,
            balance_remaining: balance,
            advance_percentage: dec!(30),
        }
    }

    // === Settlement transitions ===

    #[test]
    fn full_settlement_pays_completes_and_backfills_price() {
        let mut appt = booked();
        appt.apply_settlement(PaymentId(1), dec!(590), &full(dec!(590))).unwrap();
        assert_eq!(appt.payment_status, PaymentStatus::Paid);
        assert_eq!(appt.status, AppointmentStatus::Completed);
        assert_eq!(appt.price, dec!(590));
        assert_eq!(appt.collected, dec!(590));
        assert_eq!(appt.payment_ids, vec![PaymentId(1)]);
    }

    #[test]
    fn full_settlement_keeps_quoted_price() {
        let mut appt = booked();
        appt.price = dec!(600);
        appt.apply_settlement(PaymentId(1), dec!(590), &full(dec!(590))).unwrap();
        assert_eq!(appt.price, dec!(600));
    }

    #[test]
    fn advance_moves_pending_to_in_progress() {
        let mut appt = booked();
        appt.apply_settlement(PaymentId(1), dec!(1000), &advance(dec!(300), dec!(700)))
            .unwrap();
        assert_eq!(appt.payment_status, PaymentStatus::Partial);
        assert_eq!(appt.status, AppointmentStatus::InProgress);
        assert_eq!(appt.outstanding(), Some(dec!(700)));
        assert_eq!(appt.price, Decimal::ZERO);
    }

    #[test]
    fn advance_leaves_confirmed_alone() {
        let mut appt = booked();
        appt.set_status(AppointmentStatus::Confirmed).unwrap();
        appt.apply_settlement(PaymentId(1), dec!(1000), &advance(dec!(300), dec!(700)))
            .unwrap();
        assert_eq!(appt.status, AppointmentStatus::Confirmed);
    }

    #[test]
    fn balance_settlement_completes_partial() {
        let mut appt = booked();
        appt.apply_settlement(PaymentId(1), dec!(1000), &advance(dec!(300), dec!(700)))
            .unwrap();
        appt.apply_settlement(PaymentId(2), dec!(1000), &full(dec!(700))).unwrap();
        assert_eq!(appt.payment_status, PaymentStatus::Paid);
        assert_eq!(appt.status, AppointmentStatus::Completed);
        assert_eq!(appt.collected, dec!(1000));
        assert_eq!(appt.price, dec!(1000));
    }

    #[test]
    fn follow_up_must_quote_same_total() {
        let mut appt = booked();
        appt.apply_settlement(PaymentId(1), dec!(1000), &advance(dec!(300), dec!(700)))
            .unwrap();
        let result = appt.apply_settlement(PaymentId(2), dec!(900), &full(dec!(700)));
        assert!(matches!(result, Err(SettlementError::Validation { field: "amount", .. })));
        assert_eq!(appt.collected, dec!(300));
    }

    #[test]
    fn cancelled_appointment_rejects_payment() {
        let mut appt = booked();
        appt.set_status(AppointmentStatus::Cancelled).unwrap();
        let result = appt.apply_settlement(PaymentId(1), dec!(590), &full(dec!(590)));
        assert!(result.is_err());
        assert_eq!(appt.payment_status, PaymentStatus::Cancelled);
    }

    #[test]
    fn paid_appointment_rejects_second_payment() {
        let mut appt = booked();
        appt.apply_settlement(PaymentId(1), dec!(590), &full(dec!(590))).unwrap();
        assert!(appt.check_settleable().is_err());
    }

    // === Manual edits ===

    #[test]
    fn status_never_moves_backward() {
        let mut appt = booked();
        appt.set_status(AppointmentStatus::InProgress).unwrap();
        let result = appt.set_status(AppointmentStatus::Confirmed);
        assert!(matches!(result, Err(SettlementError::Validation { field: "status", .. })));
    }

    #[test]
    fn terminal_status_is_final() {
        let mut appt = booked();
        appt.set_status(AppointmentStatus::Completed).unwrap();
        assert!(appt.set_status(AppointmentStatus::Cancelled).is_err());
        assert!(appt.set_status(AppointmentStatus::Pending).is_err());
    }

    #[test]
    fn cannot_complete_with_balance_outstanding() {
        let mut appt = booked();
        appt.apply_settlement(PaymentId(1), dec!(1000), &advance(dec!(300), dec!(700)))
            .unwrap();
        assert!(appt.set_status(AppointmentStatus::Completed).is_err());
    }

    #[test]
    fn manual_paid_completes_appointment() {
        let mut appt = booked();
        appt.set_payment_status(PaymentStatus::Paid).unwrap();
        assert_eq!(appt.status, AppointmentStatus::Completed);
    }

    #[test]
    fn manual_partial_is_rejected() {
        let mut appt = booked();
        let result = appt.set_payment_status(PaymentStatus::Partial);
        assert!(matches!(
            result,
            Err(SettlementError::Validation { field: "paymentStatus", .. })
        ));
    }

    #[test]
    fn refunded_is_final() {
        let mut appt = booked();
        appt.set_payment_status(PaymentStatus::Paid).unwrap();
        appt.set_payment_status(PaymentStatus::Refunded).unwrap();
        assert!(appt.set_payment_status(PaymentStatus::Paid).is_err());
    }

    #[test]
    fn parse_errors_name_the_field() {
        let err = "done".parse::<AppointmentStatus>().unwrap_err();
        assert!(matches!(err, SettlementError::Validation { field: "status", .. }));
        let err = "owed".parse::<PaymentStatus>().unwrap_err();
        assert!(matches!(err, SettlementError::Validation { field: "paymentStatus", .. }));
    }

    // === Store ===

    #[test]
    fn commit_bumps_version() {
        let store = InMemoryAppointments::new();
        let appt = store.insert_appointment(ShopId(1), NewAppointment::default());
        let committed = store.commit(appt.clone()).unwrap();
        assert_eq!(committed.version, 1);
        assert_eq!(store.appointment(appt.id).unwrap().version, 1);
    }

    #[test]
    fn commit_rejects_stale_version() {
        let store = InMemoryAppointments::new();
        let appt = store.insert_appointment(ShopId(1), NewAppointment::default());
        store.commit(appt.clone()).unwrap();
        let result = store.commit(appt);
        assert_eq!(
            result,
            Err(CommitError::VersionConflict {
                expected: 0,
                found: 1
            })
        );
    }

    #[test]
    fn find_subject_is_shop_scoped() {
        let store = InMemoryAppointments::new();
        store.insert_subject(NewSubject {
            shop_id: ShopId(1),
            name: "Bruno".into(),
            kind: "dog".into(),
            ..NewSubject::default()
        });
        assert!(store.find_subject(ShopId(1), "bruno").is_some());
        assert!(store.find_subject(ShopId(2), "Bruno").is_none());
    }

    #[test]
    fn serializes_in_progress_kebab_case() {
        let json = serde_json::to_string(&AppointmentStatus::InProgress).unwrap();
        assert_eq!(json, "\"in-progress\"");
    }
}
