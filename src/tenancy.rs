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

//! Shop-scoped authorization.
//!
//! Decisions are made against the live user record. The shop embedded in a
//! caller's [`Credential`] is only a cached hint: when it disagrees with the
//! live assignment and access is granted, the [`Grant`] tells the caller to
//! refresh its credential.

use crate::SettlementError;
use crate::base::{ShopId, UserId};
use crate::directory::{Directory, Role, Shop, User};
use crate::error::Resource;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Verified claims a caller presents, as issued at login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub user_id: UserId,
    pub role: Role,
    /// Shop assignment at the time the credential was issued.
    pub assigned_shop: Option<ShopId>,
}

impl Credential {
    /// A fresh credential reflecting a user's current record.
    pub fn for_user(user: &User) -> Self {
        Self {
            user_id: user.id,
            role: user.role,
            assigned_shop: user.assigned_shop,
        }
    }
}

/// Outcome of a successful authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    /// The caller's live record.
    pub caller: User,
    /// The shop the caller may act on.
    pub shop: Shop,
    /// Set when the credential's cached assignment was stale; the caller
    /// should reissue its credential with this shop.
    pub refresh_assignment: Option<ShopId>,
}

impl Grant {
    pub fn shop_id(&self) -> ShopId {
        self.shop.id
    }

    /// Fails unless a resource owned by `owner` belongs to the granted shop.
    pub fn ensure_owns(&self, owner: ShopId, field: &'static str) -> Result<(), SettlementError> {
        if owner != self.shop.id {
            return Err(SettlementError::validation(
                field,
                "referenced record does not belong to this shop",
            ));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct TenancyGuard {
    directory: Arc<dyn Directory>,
}

impl TenancyGuard {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }

    /// Resolves the live, active user behind a credential.
    pub fn authenticate(&self, credential: Option<&Credential>) -> Result<User, SettlementError> {
        let credential = credential.ok_or(SettlementError::Unauthenticated)?;
        self.directory
            .user(credential.user_id)
            .filter(|u| u.is_active)
            .ok_or_else(|| {
                tracing::debug!(user_id = %credential.user_id, "Unknown or inactive caller");
                SettlementError::Unauthenticated
            })
    }

    /// Decides whether `credential` may act on `shop_id`.
    ///
    /// # Errors
    ///
    /// - [`SettlementError::Unauthenticated`] - No credential, or its user is unknown or inactive.
    /// - [`SettlementError::NotFound`] - The shop does not exist.
    /// - [`SettlementError::TenantMismatch`] - The live record binds the caller to another shop.
    pub fn authorize(
        &self,
        credential: Option<&Credential>,
        shop_id: ShopId,
    ) -> Result<Grant, SettlementError> {
        let credential = credential.ok_or(SettlementError::Unauthenticated)?;
        let caller = self.authenticate(Some(credential))?;
        let shop = self
            .directory
            .shop(shop_id)
            .ok_or_else(|| SettlementError::not_found(Resource::Shop, shop_id))?;

        if caller.role == Role::Admin {
            return Ok(Grant {
                caller,
                shop,
                refresh_assignment: None,
            });
        }

        if caller.assigned_shop != Some(shop_id) {
            tracing::warn!(
                user_id = %caller.id,
                requested_shop = %shop_id,
                "Shop access denied"
            );
            return Err(SettlementError::TenantMismatch);
        }

        let refresh_assignment = if credential.assigned_shop != Some(shop_id) {
            tracing::info!(
                user_id = %caller.id,
                shop_id = %shop_id,
                "Credential had stale shop assignment; allowed on live record"
            );
            Some(shop_id)
        } else {
            None
        };

        tracing::debug!(user_id = %caller.id, shop_id = %shop_id, "Shop access granted");
        Ok(Grant {
            caller,
            shop,
            refresh_assignment,
        })
    }
}
