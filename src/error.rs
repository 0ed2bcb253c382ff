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

//! Error types for settlement and tenancy failures.

use crate::base::{AppointmentId, PaymentId};
use std::fmt;
use thiserror::Error;

/// Kind of entity a [`SettlementError::NotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Shop,
    User,
    Subject,
    Appointment,
    Service,
    Payment,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resource::Shop => "shop",
            Resource::User => "user",
            Resource::Subject => "subject",
            Resource::Appointment => "appointment",
            Resource::Service => "service",
            Resource::Payment => "payment",
        };
        f.write_str(name)
    }
}

/// Settlement processing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettlementError {
    /// No credential, or the credential names an unknown or inactive user
    #[error("not authenticated")]
    Unauthenticated,

    /// Authenticated, but bound to a different shop than the one requested
    #[error("you can only access resources of your assigned shop")]
    TenantMismatch,

    /// Referenced shop, appointment, service, ... does not exist
    #[error("{resource} {id} not found")]
    NotFound { resource: Resource, id: String },

    /// A request field failed validation
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// The shop or engine is misconfigured (e.g. no manager on the shop)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The payment was persisted but the appointment could not be updated
    #[error(
        "payment {payment_id} persisted but appointment {appointment_id} was not updated: {reason}"
    )]
    Consistency {
        payment_id: PaymentId,
        appointment_id: AppointmentId,
        reason: String,
    },

    /// Idempotency key already used within the window
    #[error("settlement {key} was already submitted")]
    DuplicateSettlement {
        key: String,
        /// Payment written by the first attempt, if it got that far.
        payment_id: Option<PaymentId>,
    },
}

impl SettlementError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        SettlementError::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(resource: Resource, id: impl fmt::Display) -> Self {
        SettlementError::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SettlementError::Unauthenticated => ErrorKind::Unauthenticated,
            SettlementError::TenantMismatch => ErrorKind::TenantMismatch,
            SettlementError::NotFound { .. } => ErrorKind::NotFound,
            SettlementError::Validation { .. } => ErrorKind::ValidationFailed,
            SettlementError::Configuration(_) => ErrorKind::ConfigurationError,
            SettlementError::Consistency { .. } => ErrorKind::ConsistencyError,
            SettlementError::DuplicateSettlement { .. } => ErrorKind::Duplicate,
        }
    }
}

/// Caller-distinguishable error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unauthenticated,
    TenantMismatch,
    NotFound,
    ValidationFailed,
    ConfigurationError,
    ConsistencyError,
    Duplicate,
}

impl ErrorKind {
    /// HTTP status code a request/response boundary should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::Unauthenticated => 401,
            ErrorKind::TenantMismatch => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::ValidationFailed => 400,
            ErrorKind::ConfigurationError => 422,
            ErrorKind::ConsistencyError => 500,
            ErrorKind::Duplicate => 409,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Unauthenticated => "UNAUTHENTICATED",
            ErrorKind::TenantMismatch => "TENANT_MISMATCH",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::ValidationFailed => "VALIDATION_FAILED",
            ErrorKind::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorKind::ConsistencyError => "CONSISTENCY_ERROR",
            ErrorKind::Duplicate => "DUPLICATE_SETTLEMENT",
        }
    }
}
