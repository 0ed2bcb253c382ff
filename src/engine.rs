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

//! Settlement engine.
//!
//! The [`Engine`] records money collected against appointments and keeps the
//! payment and the appointment it funds consistent.
//!
//! # Settlement
//!
//! 1. Authorize the caller for the shop.
//! 2. Validate the request and resolve the appointment, payer and manager.
//! 3. Compute the amount due and its tax split.
//! 4. Write the payment as `pending`.
//! 5. Apply the appointment transition with a conditional write.
//! 6. Mark the payment `completed`.
//!
//! A failure in step 5 leaves the payment `pending`, flags it for
//! reconciliation and surfaces [`SettlementError::Consistency`].
//!
//! # Thread Safety
//!
//! Settlements and staff edits on the same appointment are serialized by a
//! per-appointment mutex; different appointments proceed in parallel.

use crate::appointment::{
    Appointment, AppointmentStatus, AppointmentStore, NewAppointment, NewSubject, PaymentStatus,
    Subject,
};
use crate::base::{AppointmentId, IdempotencyKey, PaymentId, ServiceId, ShopId, UserId};
use crate::config::Config;
use crate::directory::{Directory, Role, Service, Shop, User};
use crate::error::Resource;
use crate::money::{MoneyEngine, SettlementAmount, TaxRateProvider, TaxSplit};
use crate::payment::{Payment, PaymentMethod, PaymentState, PaymentType};
use crate::payment_log::{IdempotencyRegistry, Page, PaymentLog, PaymentQuery};
use crate::tenancy::{Credential, Grant, TenancyGuard};
use crate::SettlementError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A request to settle money against an appointment or a walk-in service.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementRequest {
    pub shop_id: ShopId,
    #[serde(default)]
    pub appointment_id: Option<AppointmentId>,
    /// Subject to look up within the shop when no appointment is given.
    #[serde(default)]
    pub subject_name: Option<String>,
    /// Defaults to the caller.
    #[serde(default)]
    pub payer_id: Option<UserId>,
    /// Used only when no subject on file names an owner.
    #[serde(default)]
    pub payer_name: Option<String>,
    #[serde(default)]
    pub service_id: Option<ServiceId>,
    /// Defaults to the shop's manager.
    #[serde(default)]
    pub manager_id: Option<UserId>,
    /// Tax-inclusive total being settled against.
    pub amount: Decimal,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub payment_type: PaymentType,
    #[serde(default)]
    pub advance_percentage: Option<Decimal>,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<IdempotencyKey>,
}

impl SettlementRequest {
    /// A full cash settlement of `amount`; adjust fields from there.
    pub fn new(shop_id: ShopId, amount: Decimal, payment_method: PaymentMethod) -> Self {
        Self {
            shop_id,
            appointment_id: None,
            subject_name: None,
            payer_id: None,
            payer_name: None,
            service_id: None,
            manager_id: None,
            amount,
            payment_method,
            payment_type: PaymentType::Full,
            advance_percentage: None,
            transaction_id: None,
            notes: None,
            idempotency_key: None,
        }
    }
}

/// Appointment state after a settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentOutcome {
    pub id: AppointmentId,
    pub status: AppointmentStatus,
    pub payment_status: PaymentStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementResult {
    pub payment: Payment,
    pub appointment: Option<AppointmentOutcome>,
    /// Set when the caller's credential carried a stale shop assignment.
    pub refresh_assignment: Option<ShopId>,
}

impl SettlementResult {
    pub fn payment_id(&self) -> PaymentId {
        self.payment.id
    }

    /// Amount actually collected.
    pub fn amount_collected(&self) -> Decimal {
        self.payment.amount
    }

    pub fn balance_remaining(&self) -> Decimal {
        self.payment.balance_amount
    }
}

/// A completed payment with the records an invoice is rendered from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceView {
    pub shop: Shop,
    pub payment: Payment,
    pub appointment: Option<Appointment>,
    pub subject: Option<Subject>,
    pub split: TaxSplit,
}

/// Everything a settlement resolved before any write.
struct Prepared {
    total: Decimal,
    payer: User,
    manager: User,
    service: Option<Service>,
    appointment_id: Option<AppointmentId>,
    subject_name: Option<String>,
    owner_name: Option<String>,
    transaction_id: String,
    notes: String,
}

pub struct Engine {
    config: Config,
    money: MoneyEngine,
    guard: TenancyGuard,
    directory: Arc<dyn Directory>,
    appointments: Arc<dyn AppointmentStore>,
    payments: PaymentLog,
    idempotency: IdempotencyRegistry,
    /// Per-appointment settlement locks.
    locks: DashMap<AppointmentId, Arc<Mutex<()>>>,
}

impl Engine {
    /// Creates an engine with the default configuration.
    pub fn new(directory: Arc<dyn Directory>, appointments: Arc<dyn AppointmentStore>) -> Self {
        let config = Config::default();
        Self::build(config, directory, appointments)
    }

    /// Creates an engine with `config`.
    ///
    /// # Errors
    ///
    /// Returns [`SettlementError::Configuration`] if `config` is invalid.
    pub fn with_config(
        config: Config,
        directory: Arc<dyn Directory>,
        appointments: Arc<dyn AppointmentStore>,
    ) -> Result<Self, SettlementError> {
        config.validate()?;
        Ok(Self::build(config, directory, appointments))
    }

    fn build(
        config: Config,
        directory: Arc<dyn Directory>,
        appointments: Arc<dyn AppointmentStore>,
    ) -> Self {
        Engine {
            money: MoneyEngine::new(&config),
            guard: TenancyGuard::new(Arc::clone(&directory)),
            idempotency: IdempotencyRegistry::new(config.idempotency_window),
            payments: PaymentLog::new(),
            locks: DashMap::new(),
            config,
            directory,
            appointments,
        }
    }

    /// Replaces the tax rate source.
    pub fn with_tax_rates(mut self, rates: Arc<dyn TaxRateProvider>) -> Self {
        self.money = MoneyEngine::with_rate_provider(&self.config, rates);
        self
    }

    pub fn money(&self) -> &MoneyEngine {
        &self.money
    }

    // === Settlement ===

    /// Settles `request` on behalf of `credential`.
    ///
    /// # Errors
    ///
    /// - [`SettlementError::Unauthenticated`], [`SettlementError::TenantMismatch`],
    ///   [`SettlementError::NotFound`] - Authorization or lookup failed; nothing written.
    /// - [`SettlementError::Validation`] - A field is invalid; nothing written.
    /// - [`SettlementError::Configuration`] - No manager resolvable for the shop.
    /// - [`SettlementError::DuplicateSettlement`] - Idempotency key reused within the window.
    /// - [`SettlementError::Consistency`] - The payment was written but the
    ///   appointment was not updated; the payment awaits reconciliation.
    pub fn settle(
        &self,
        credential: Option<&Credential>,
        request: SettlementRequest,
    ) -> Result<SettlementResult, SettlementError> {
        let grant = self.guard.authorize(credential, request.shop_id)?;
        let prepared = self.prepare(&grant, &request).inspect_err(|e| {
            tracing::debug!(shop_id = %request.shop_id, error = %e, "Settlement rejected");
        })?;

        let shop_id = grant.shop_id();
        if let Some(key) = &request.idempotency_key {
            self.idempotency.reserve(shop_id, key)?;
        }
        let result = match prepared.appointment_id {
            Some(id) => self.with_appointment_lock(id, || self.execute(&grant, &request, prepared)),
            None => self.execute(&grant, &request, prepared),
        };
        if result.is_err()
            && let Some(key) = &request.idempotency_key
        {
            // No-op once a payment was bound to the key.
            self.idempotency.release(shop_id, key);
        }
        result
    }

    fn prepare(&self, grant: &Grant, request: &SettlementRequest) -> Result<Prepared, SettlementError> {
        let total = self.money.check_amount("amount", request.amount)?;

        let transaction_id = request
            .transaction_id
            .as_deref()
            .map(str::trim)
            .unwrap_or_default();
        let transaction_id = if request.payment_method.requires_transaction_id() {
            if transaction_id.is_empty() {
                return Err(SettlementError::validation(
                    "transactionId",
                    "transaction ID required for non-cash payment",
                ));
            }
            if transaction_id.chars().count() > self.config.max_transaction_id_len {
                return Err(SettlementError::validation(
                    "transactionId",
                    format!(
                        "transaction ID cannot exceed {} characters",
                        self.config.max_transaction_id_len
                    ),
                ));
            }
            transaction_id.to_string()
        } else {
            String::new()
        };

        let notes = request.notes.as_deref().map(str::trim).unwrap_or_default();
        if notes.chars().count() > self.config.max_notes_len {
            return Err(SettlementError::validation(
                "notes",
                format!("notes cannot exceed {} characters", self.config.max_notes_len),
            ));
        }

        let payer_id = request.payer_id.unwrap_or(grant.caller.id);
        let payer = self
            .directory
            .user(payer_id)
            .ok_or_else(|| SettlementError::not_found(Resource::User, payer_id))?;

        let service = match request.service_id {
            Some(id) => {
                let service = self
                    .directory
                    .service(id)
                    .ok_or_else(|| SettlementError::not_found(Resource::Service, id))?;
                grant.ensure_owns(service.shop_id, "serviceId")?;
                Some(service)
            }
            None => None,
        };

        let (appointment, subject) = self.resolve_booking(grant, request)?;
        if let Some(appointment) = &appointment {
            check_against(appointment, total)?;
        }

        // Records on file win over anything the caller supplies.
        let subject_name = subject
            .as_ref()
            .map(|s| s.name.clone())
            .or_else(|| non_empty(request.subject_name.as_deref()));
        let owner_name = subject
            .as_ref()
            .and_then(|s| s.owner_name.clone())
            .or_else(|| non_empty(request.payer_name.as_deref()));

        let manager = self.resolve_manager(grant, request.manager_id)?;

        Ok(Prepared {
            total,
            payer,
            manager,
            service,
            appointment_id: appointment.map(|a| a.id),
            subject_name,
            owner_name,
            transaction_id,
            notes: notes.to_string(),
        })
    }

    /// Finds the appointment being settled, and the subject it books.
    fn resolve_booking(
        &self,
        grant: &Grant,
        request: &SettlementRequest,
    ) -> Result<(Option<Appointment>, Option<Subject>), SettlementError> {
        if let Some(id) = request.appointment_id {
            let appointment = self
                .appointments
                .appointment(id)
                .ok_or_else(|| SettlementError::not_found(Resource::Appointment, id))?;
            grant.ensure_owns(appointment.shop_id, "appointmentId")?;
            let subject = self.appointments.subject(appointment.subject_id);
            return Ok((Some(appointment), subject));
        }

        let Some(name) = non_empty(request.subject_name.as_deref()) else {
            return Ok((None, None));
        };
        let Some(subject) = self.appointments.find_subject(grant.shop_id(), &name) else {
            return Ok((None, None));
        };
        let open = self
            .appointments
            .appointments_for_subject(subject.id)
            .into_iter()
            .rev()
            .find(|a| a.status != AppointmentStatus::Cancelled && a.payment_status.accepts_payment());
        Ok((open, Some(subject)))
    }

    fn resolve_manager(&self, grant: &Grant, requested: Option<UserId>) -> Result<User, SettlementError> {
        match requested {
            Some(id) => {
                let manager = self
                    .directory
                    .user(id)
                    .filter(|u| u.role == Role::Manager && u.assigned_shop == Some(grant.shop_id()))
                    .ok_or_else(|| {
                        SettlementError::validation("managerId", "not a manager of this shop")
                    })?;
                Ok(manager)
            }
            None => self.directory.manager_of(grant.shop_id()).ok_or_else(|| {
                SettlementError::Configuration(format!(
                    "no manager found for shop {}",
                    grant.shop_id()
                ))
            }),
        }
    }

    /// Writes the settlement. The caller holds the appointment's lock, if any.
    fn execute(
        &self,
        grant: &Grant,
        request: &SettlementRequest,
        prepared: Prepared,
    ) -> Result<SettlementResult, SettlementError> {
        // Re-read under the lock; a concurrent settlement may have landed.
        let appointment = match prepared.appointment_id {
            Some(id) => {
                let appointment = self
                    .appointments
                    .appointment(id)
                    .ok_or_else(|| SettlementError::not_found(Resource::Appointment, id))?;
                check_against(&appointment, prepared.total)?;
                Some(appointment)
            }
            None => None,
        };

        let amount = match appointment.as_ref().and_then(|a| a.outstanding()) {
            Some(outstanding) => self.money.balance_settlement(
                prepared.total,
                outstanding,
                request.payment_type,
                request.advance_percentage,
            )?,
            None => self.money.settlement_amount(
                prepared.total,
                request.payment_type,
                request.advance_percentage,
            )?,
        };
        let split = self.money.base_from_gross(amount.amount_due)?;

        let payment = self.write_pending(grant, request, &prepared, &amount, &split)?;
        if let Some(key) = &request.idempotency_key {
            self.idempotency.bind(grant.shop_id(), key, payment.id);
        }

        let outcome = match appointment {
            Some(appointment) => Some(self.apply_to_appointment(&payment, appointment)?),
            None => None,
        };

        let payment = self
            .payments
            .update(payment.id, |p| p.transition(PaymentState::Completed, None))
            .map_err(|e| consistency(&payment, outcome.map(|o| o.id), e.to_string()))?;

        tracing::info!(
            payment_id = %payment.id,
            shop_id = %payment.shop_id,
            amount = %payment.amount,
            balance = %payment.balance_amount,
            payment_type = %payment.payment_type,
            "Settlement completed"
        );

        Ok(SettlementResult {
            payment,
            appointment: outcome,
            refresh_assignment: grant.refresh_assignment,
        })
    }

    fn write_pending(
        &self,
        grant: &Grant,
        request: &SettlementRequest,
        prepared: &Prepared,
        amount: &SettlementAmount,
        split: &TaxSplit,
    ) -> Result<Payment, SettlementError> {
        let now = Utc::now();
        let payment = Payment {
            id: self.payments.allocate_id(),
            shop_id: grant.shop_id(),
            payer_id: prepared.payer.id,
            manager_id: prepared.manager.id,
            appointment_id: prepared.appointment_id,
            subject_name: prepared.subject_name.clone(),
            owner_name: prepared.owner_name.clone(),
            service_id: prepared.service.as_ref().map(|s| s.id),
            service_name: prepared.service.as_ref().map(|s| s.name.clone()),
            amount: split.total,
            base_amount: split.base,
            tax_amount: split.tax,
            settlement_total: prepared.total,
            payment_type: request.payment_type,
            advance_percentage: amount.advance_percentage,
            balance_amount: amount.balance_remaining,
            method: request.payment_method,
            transaction_id: prepared.transaction_id.clone(),
            notes: prepared.notes.clone(),
            status: PaymentState::Pending,
            needs_reconciliation: false,
            paid_at: now,
            updated_at: now,
        };
        self.payments.insert(payment.clone())?;
        Ok(payment)
    }

    /// Applies a written payment to its appointment. The caller holds the
    /// appointment's lock.
    fn apply_to_appointment(
        &self,
        payment: &Payment,
        mut appointment: Appointment,
    ) -> Result<AppointmentOutcome, SettlementError> {
        let amount = SettlementAmount {
            amount_due: payment.amount,
            balance_remaining: payment.balance_amount,
            advance_percentage: payment.advance_percentage,
        };
        let committed = appointment
            .apply_settlement(payment.id, payment.settlement_total, &amount)
            .map_err(|e| e.to_string())
            .and_then(|()| self.appointments.commit(appointment).map_err(|e| e.to_string()));

        match committed {
            Ok(appointment) => Ok(AppointmentOutcome {
                id: appointment.id,
                status: appointment.status,
                payment_status: appointment.payment_status,
            }),
            Err(reason) => {
                self.payments.flag_for_reconciliation(payment.id);
                tracing::warn!(
                    payment_id = %payment.id,
                    appointment_id = ?payment.appointment_id,
                    reason = %reason,
                    "Payment written but appointment not updated"
                );
                Err(consistency(payment, payment.appointment_id, reason))
            }
        }
    }

    /// Runs `f` holding the appointment's lock.
    ///
    /// Lock entries live only while some caller holds or awaits them.
    fn with_appointment_lock<R>(&self, id: AppointmentId, f: impl FnOnce() -> R) -> R {
        let lock = Arc::clone(self.locks.entry(id).or_default().value());
        let result = {
            let _guard = lock.lock();
            f()
        };
        drop(lock);
        self.locks.remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Number of appointment locks currently held or awaited.
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }

    // === Reconciliation ===

    /// Payments written whose appointment update has not landed yet.
    pub fn pending_reconciliation(&self) -> Vec<Payment> {
        self.payments.flagged()
    }

    /// Re-applies a flagged payment to its appointment and completes it.
    ///
    /// # Errors
    ///
    /// - [`SettlementError::NotFound`] - Unknown payment or appointment.
    /// - [`SettlementError::Validation`] - The payment is not awaiting reconciliation.
    /// - [`SettlementError::Consistency`] - The appointment still cannot be updated.
    pub fn reconcile(&self, payment_id: PaymentId) -> Result<SettlementResult, SettlementError> {
        let appointment_id = self
            .payments
            .get(payment_id)
            .ok_or_else(|| SettlementError::not_found(Resource::Payment, payment_id))?
            .appointment_id
            .ok_or_else(|| SettlementError::validation("paymentId", "payment has no appointment"))?;

        let (payment, outcome) = self.with_appointment_lock(appointment_id, || {
            // Re-read under the lock; staff may have failed the payment meanwhile.
            let payment = self
                .payments
                .get(payment_id)
                .filter(|p| p.needs_reconciliation && p.status == PaymentState::Pending)
                .ok_or_else(|| {
                    SettlementError::validation("paymentId", "payment is not awaiting reconciliation")
                })?;
            let appointment = self.appointments.appointment(appointment_id).ok_or_else(|| {
                consistency(&payment, Some(appointment_id), "appointment no longer exists".into())
            })?;
            let outcome = if appointment.payment_ids.contains(&payment.id) {
                AppointmentOutcome {
                    id: appointment.id,
                    status: appointment.status,
                    payment_status: appointment.payment_status,
                }
            } else {
                self.apply_to_appointment(&payment, appointment)?
            };

            let payment = self.payments.update(payment_id, |p| {
                p.transition(PaymentState::Completed, Some("reconciled"))?;
                p.needs_reconciliation = false;
                Ok(())
            })?;
            Ok::<_, SettlementError>((payment, outcome))
        })?;
        tracing::info!(payment_id = %payment.id, appointment_id = %appointment_id, "Payment reconciled");

        Ok(SettlementResult {
            payment,
            appointment: Some(outcome),
            refresh_assignment: None,
        })
    }

    /// Drains the reconciliation queue, retrying each payment once.
    ///
    /// Payments that still fail stay flagged and are queued again.
    pub fn reconcile_pending(&self) -> Vec<(PaymentId, Result<SettlementResult, SettlementError>)> {
        let mut ids = self.payments.drain_reconciliation();
        ids.sort_unstable();
        ids.dedup();
        ids.into_iter()
            .map(|id| (id, self.reconcile(id)))
            .collect()
    }

    // === Subjects and appointments ===

    /// Registers a subject with a shop, booking it when `scheduled_for` is given.
    pub fn register_subject(
        &self,
        credential: Option<&Credential>,
        subject: NewSubject,
        scheduled_for: Option<DateTime<Utc>>,
        service_ids: Vec<ServiceId>,
    ) -> Result<(Subject, Option<Appointment>), SettlementError> {
        let grant = self.guard.authorize(credential, subject.shop_id)?;
        if subject.name.trim().is_empty() {
            return Err(SettlementError::validation("name", "name is required"));
        }
        if subject.kind.trim().is_empty() {
            return Err(SettlementError::validation("type", "type is required"));
        }
        let price = self.snapshot_price(&grant, &service_ids)?;

        let subject = self.appointments.insert_subject(subject);
        let appointment = scheduled_for.map(|when| {
            self.appointments.insert_appointment(
                grant.shop_id(),
                NewAppointment {
                    subject_id: subject.id,
                    scheduled_for: Some(when),
                    service_ids,
                    price,
                },
            )
        });
        Ok((subject, appointment))
    }

    /// Books an existing subject.
    pub fn book_appointment(
        &self,
        credential: Option<&Credential>,
        shop_id: ShopId,
        mut booking: NewAppointment,
    ) -> Result<Appointment, SettlementError> {
        let grant = self.guard.authorize(credential, shop_id)?;
        let subject = self
            .appointments
            .subject(booking.subject_id)
            .ok_or_else(|| SettlementError::not_found(Resource::Subject, booking.subject_id))?;
        grant.ensure_owns(subject.shop_id, "subjectId")?;
        if booking.price.is_zero() {
            booking.price = self.snapshot_price(&grant, &booking.service_ids)?;
        } else if booking.price < Decimal::ZERO {
            return Err(SettlementError::validation("price", "price cannot be negative"));
        }
        Ok(self.appointments.insert_appointment(shop_id, booking))
    }

    /// Sum of the catalog prices of `service_ids`, all of which must belong
    /// to the granted shop.
    fn snapshot_price(&self, grant: &Grant, service_ids: &[ServiceId]) -> Result<Decimal, SettlementError> {
        service_ids.iter().try_fold(Decimal::ZERO, |sum, id| {
            let service = self
                .directory
                .service(*id)
                .ok_or_else(|| SettlementError::not_found(Resource::Service, id))?;
            grant.ensure_owns(service.shop_id, "serviceIds")?;
            Ok(sum + service.price)
        })
    }

    pub fn appointments(
        &self,
        credential: Option<&Credential>,
        shop_id: ShopId,
    ) -> Result<Vec<Appointment>, SettlementError> {
        self.guard.authorize(credential, shop_id)?;
        Ok(self.appointments.appointments_for_shop(shop_id))
    }

    /// Staff edit of an appointment's status, e.g. `"confirmed"`.
    pub fn update_appointment_status(
        &self,
        credential: Option<&Credential>,
        shop_id: ShopId,
        appointment_id: AppointmentId,
        status: &str,
    ) -> Result<Appointment, SettlementError> {
        let status: AppointmentStatus = status.parse()?;
        self.edit_appointment(credential, shop_id, appointment_id, |a| a.set_status(status))
    }

    /// Staff edit of an appointment's payment status, e.g. `"refunded"`.
    pub fn update_appointment_payment_status(
        &self,
        credential: Option<&Credential>,
        shop_id: ShopId,
        appointment_id: AppointmentId,
        payment_status: &str,
    ) -> Result<Appointment, SettlementError> {
        let payment_status: PaymentStatus = payment_status.parse()?;
        self.edit_appointment(credential, shop_id, appointment_id, |a| {
            a.set_payment_status(payment_status)
        })
    }

    fn edit_appointment<F>(
        &self,
        credential: Option<&Credential>,
        shop_id: ShopId,
        appointment_id: AppointmentId,
        edit: F,
    ) -> Result<Appointment, SettlementError>
    where
        F: FnOnce(&mut Appointment) -> Result<(), SettlementError>,
    {
        let grant = self.guard.authorize(credential, shop_id)?;
        self.with_appointment_lock(appointment_id, || {
            self.commit_edit(&grant, appointment_id, edit)
        })
    }

    /// Applies a staff edit. The caller holds the appointment's lock.
    fn commit_edit<F>(
        &self,
        grant: &Grant,
        appointment_id: AppointmentId,
        edit: F,
    ) -> Result<Appointment, SettlementError>
    where
        F: FnOnce(&mut Appointment) -> Result<(), SettlementError>,
    {
        let mut appointment = self
            .appointments
            .appointment(appointment_id)
            .ok_or_else(|| SettlementError::not_found(Resource::Appointment, appointment_id))?;
        grant.ensure_owns(appointment.shop_id, "appointmentId")?;
        edit(&mut appointment)?;
        self.appointments
            .commit(appointment)
            .map_err(|e| SettlementError::validation("appointmentId", e.to_string()))
    }

    // === Payments ===

    /// Staff edit of a payment's status.
    ///
    /// Refunding a payment marks its appointment refunded. A `pending`
    /// payment is either still being settled, and cannot be edited, or
    /// awaiting reconciliation, and can only be marked failed.
    pub fn update_payment_status(
        &self,
        credential: Option<&Credential>,
        shop_id: ShopId,
        payment_id: PaymentId,
        status: &str,
        notes: Option<&str>,
    ) -> Result<Payment, SettlementError> {
        let status: PaymentState = status.parse()?;
        let grant = self.guard.authorize(credential, shop_id)?;
        let current = self
            .payments
            .get(payment_id)
            .ok_or_else(|| SettlementError::not_found(Resource::Payment, payment_id))?;
        grant.ensure_owns(current.shop_id, "paymentId")?;
        check_manual_transition(&current, status)?;
        if let Some(notes) = notes
            && notes.trim().chars().count() > self.config.max_notes_len
        {
            return Err(SettlementError::validation(
                "notes",
                format!("notes cannot exceed {} characters", self.config.max_notes_len),
            ));
        }

        let payment = match current.appointment_id {
            Some(appointment_id) => self.with_appointment_lock(appointment_id, || {
                self.transition_payment(&grant, payment_id, status, notes)
            })?,
            None => self.transition_payment(&grant, payment_id, status, notes)?,
        };

        tracing::info!(payment_id = %payment_id, status = %status, "Payment status updated");
        Ok(payment)
    }

    /// Moves a payment to `status`. The caller holds its appointment's lock, if any.
    fn transition_payment(
        &self,
        grant: &Grant,
        payment_id: PaymentId,
        status: PaymentState,
        notes: Option<&str>,
    ) -> Result<Payment, SettlementError> {
        let payment = self.payments.update(payment_id, |p| {
            check_manual_transition(p, status)?;
            p.transition(status, notes)?;
            if status == PaymentState::Failed {
                p.needs_reconciliation = false;
            }
            Ok(())
        })?;

        if status == PaymentState::Refunded
            && let Some(appointment_id) = payment.appointment_id
        {
            self.commit_edit(grant, appointment_id, |a| {
                a.set_payment_status(PaymentStatus::Refunded)
            })
            .map_err(|e| consistency(&payment, Some(appointment_id), e.to_string()))?;
        }
        Ok(payment)
    }

    /// A payment of the given shop.
    pub fn payment(
        &self,
        credential: Option<&Credential>,
        shop_id: ShopId,
        payment_id: PaymentId,
    ) -> Result<Payment, SettlementError> {
        self.guard.authorize(credential, shop_id)?;
        self.payments
            .get(payment_id)
            .filter(|p| p.shop_id == shop_id)
            .ok_or_else(|| SettlementError::not_found(Resource::Payment, payment_id))
    }

    /// The caller's own payments, newest first.
    pub fn payment_history(
        &self,
        credential: Option<&Credential>,
        query: &PaymentQuery,
    ) -> Result<Page<Payment>, SettlementError> {
        let caller = self.guard.authenticate(credential)?;
        Ok(self.payments.query(query, |p| p.payer_id == caller.id))
    }

    /// A shop's payments, newest first.
    pub fn shop_payments(
        &self,
        credential: Option<&Credential>,
        shop_id: ShopId,
        query: &PaymentQuery,
    ) -> Result<Page<Payment>, SettlementError> {
        self.guard.authorize(credential, shop_id)?;
        Ok(self.payments.query(query, |p| p.shop_id == shop_id))
    }

    /// Completed payments of a shop, for reporting.
    pub fn committed_payments(
        &self,
        credential: Option<&Credential>,
        shop_id: ShopId,
    ) -> Result<Vec<Payment>, SettlementError> {
        let query = PaymentQuery {
            status: Some(PaymentState::Completed),
            limit: usize::MAX,
            ..PaymentQuery::default()
        };
        let mut payments = Vec::new();
        let mut page = 1;
        loop {
            let batch = self.shop_payments(credential, shop_id, &PaymentQuery { page, ..query.clone() })?;
            let done = page >= batch.total_pages;
            payments.extend(batch.items.into_iter().filter(Payment::is_balanced));
            if done {
                return Ok(payments);
            }
            page += 1;
        }
    }

    /// A completed payment with its appointment, ready for invoicing.
    ///
    /// # Errors
    ///
    /// Returns [`SettlementError::Validation`] if the payment is not completed
    /// or its records do not agree.
    pub fn invoice_view(
        &self,
        credential: Option<&Credential>,
        shop_id: ShopId,
        payment_id: PaymentId,
    ) -> Result<InvoiceView, SettlementError> {
        let grant = self.guard.authorize(credential, shop_id)?;
        let payment = self
            .payments
            .get(payment_id)
            .filter(|p| p.shop_id == shop_id)
            .ok_or_else(|| SettlementError::not_found(Resource::Payment, payment_id))?;
        if payment.status != PaymentState::Completed {
            return Err(SettlementError::validation(
                "paymentId",
                format!("payment is {}", payment.status),
            ));
        }
        if !payment.is_balanced() {
            return Err(SettlementError::validation(
                "paymentId",
                "payment amounts do not add up",
            ));
        }

        let appointment = payment
            .appointment_id
            .and_then(|id| self.appointments.appointment(id));
        if payment.appointment_id.is_some()
            && !appointment
                .as_ref()
                .is_some_and(|a| a.payment_ids.contains(&payment.id))
        {
            return Err(SettlementError::validation(
                "paymentId",
                "appointment does not record this payment",
            ));
        }
        let subject = appointment
            .as_ref()
            .and_then(|a| self.appointments.subject(a.subject_id));

        Ok(InvoiceView {
            shop: grant.shop,
            split: TaxSplit {
                base: payment.base_amount,
                tax: payment.tax_amount,
                total: payment.amount,
            },
            payment,
            appointment,
            subject,
        })
    }

    /// Retrieves a payment by id, regardless of tenant.
    ///
    /// For trusted callers (reconcilers, tests); request paths use
    /// [`Engine::payment`].
    pub fn get_payment(&self, payment_id: PaymentId) -> Option<Payment> {
        self.payments.get(payment_id)
    }

    /// Retrieves an appointment by id, regardless of tenant.
    pub fn get_appointment(&self, appointment_id: AppointmentId) -> Option<Appointment> {
        self.appointments.appointment(appointment_id)
    }

    pub fn payment_count(&self) -> usize {
        self.payments.len()
    }
}

/// Fails unless staff may move `payment` to `next` by hand.
fn check_manual_transition(payment: &Payment, next: PaymentState) -> Result<(), SettlementError> {
    if payment.status != PaymentState::Pending {
        return Ok(());
    }
    if !payment.needs_reconciliation {
        return Err(SettlementError::validation(
            "status",
            "payment is still being settled",
        ));
    }
    if next == PaymentState::Completed {
        return Err(SettlementError::validation(
            "status",
            "payment is awaiting reconciliation",
        ));
    }
    Ok(())
}

/// Fails unless `appointment` accepts a settlement quoting `total`.
fn check_against(appointment: &Appointment, total: Decimal) -> Result<(), SettlementError> {
    appointment.check_settleable()?;
    match appointment.settlement_total {
        Some(settled) if settled != total => Err(SettlementError::validation(
            "amount",
            format!("total {} does not match the settled total {}", total, settled),
        )),
        _ => Ok(()),
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn consistency(payment: &Payment, appointment_id: Option<AppointmentId>, reason: String) -> SettlementError {
    SettlementError::Consistency {
        payment_id: payment.id,
        appointment_id: appointment_id.unwrap_or_default(),
        reason,
    }
}
