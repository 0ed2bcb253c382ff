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

//! # Groomer Settlement
//!
//! Settlement of appointment payments for multi-tenant pet-grooming shops.
//! Shop staff record money collected against an appointment; the engine
//! splits it into base and GST, supports advance payments with a balance
//! owed, and keeps the payment and the appointment it funds consistent.
//!
//! ## Core Components
//!
//! - [`Engine`]: Settlement coordinator and staff-facing operations
//! - [`TenancyGuard`]: Shop-scoped authorization against live user records
//! - [`MoneyEngine`]: Tax split and advance/balance arithmetic
//! - [`Appointment`]: Booking with its status and payment-status state machine
//! - [`Payment`]: A recorded settlement
//! - [`SettlementError`]: Error types for settlement and tenancy failures
//!
//! ## Example
//!
//! ```
//! use groomer_settlement::directory::{InMemoryDirectory, NewShop, NewUser, Role};
//! use groomer_settlement::{
//!     AppointmentStatus, AppointmentStore, Credential, Engine, InMemoryAppointments,
//!     NewAppointment, NewSubject, PaymentMethod, PaymentStatus, SettlementRequest,
//! };
//! use rust_decimal_macros::dec;
//! use std::sync::Arc;
//!
//! let directory = Arc::new(InMemoryDirectory::new());
//! let shop = directory.insert_shop(NewShop { name: "Paws".into(), ..NewShop::default() });
//! let manager = directory
//!     .insert_user(NewUser {
//!         full_name: "Asha".into(),
//!         email: "asha@paws.in".into(),
//!         phone: String::new(),
//!         role: Role::Manager,
//!         assigned_shop: Some(shop.id),
//!     })
//!     .unwrap();
//!
//! let appointments = Arc::new(InMemoryAppointments::new());
//! let subject = appointments.insert_subject(NewSubject {
//!     shop_id: shop.id,
//!     name: "Bruno".into(),
//!     kind: "dog".into(),
//!     ..NewSubject::default()
//! });
//! let booking = appointments.insert_appointment(
//!     shop.id,
//!     NewAppointment { subject_id: subject.id, ..NewAppointment::default() },
//! );
//!
//! let engine = Engine::new(directory.clone(), appointments.clone());
//! let credential = Credential::for_user(&manager);
//!
//! let mut request = SettlementRequest::new(shop.id, dec!(590), PaymentMethod::Upi);
//! request.appointment_id = Some(booking.id);
//! request.transaction_id = Some("TXN1".into());
//!
//! let result = engine.settle(Some(&credential), request).unwrap();
//! assert_eq!(result.payment.base_amount, dec!(500.00));
//! assert_eq!(result.payment.tax_amount, dec!(90.00));
//!
//! let booking = engine.get_appointment(booking.id).unwrap();
//! assert_eq!(booking.status, AppointmentStatus::Completed);
//! assert_eq!(booking.payment_status, PaymentStatus::Paid);
//! ```
//!
//! ## Thread Safety
//!
//! All stores are concurrent maps. Settlements on the same appointment are
//! serialized; settlements on different appointments run in parallel.

pub mod appointment;
mod base;
pub mod config;
pub mod directory;
mod engine;
pub mod error;
pub mod logger;
pub mod money;
pub mod payment;
pub mod payment_log;
pub mod tenancy;

pub use appointment::{
    Appointment, AppointmentStatus, AppointmentStore, CommitError, InMemoryAppointments,
    NewAppointment, NewSubject, PaymentStatus, Subject,
};
pub use base::{AppointmentId, IdempotencyKey, PaymentId, ServiceId, ShopId, SubjectId, UserId};
pub use config::Config;
pub use engine::{AppointmentOutcome, Engine, InvoiceView, SettlementRequest, SettlementResult};
pub use error::{ErrorKind, SettlementError};
pub use money::{FixedTaxRate, MoneyEngine, SettlementAmount, TaxRateProvider, TaxSplit};
pub use payment::{Payment, PaymentMethod, PaymentState, PaymentType};
pub use payment_log::{Page, PaymentQuery};
pub use tenancy::{Credential, Grant, TenancyGuard};
