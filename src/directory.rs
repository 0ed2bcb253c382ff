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

//! Shops, users and catalog services.
//!
//! The [`Directory`] trait is the read side the settlement engine consumes.
//! [`InMemoryDirectory`] also owns the write side and keeps the shop/manager
//! binding one-to-one: assigning a manager clears whatever binding either
//! side held before.

use crate::SettlementError;
use crate::base::{ServiceId, ShopId, UserId};
use crate::error::Resource;
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    /// Shop staff and customers; stored as `user` by older records.
    #[serde(alias = "user")]
    Staff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShopStatus {
    #[default]
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceCategory {
    #[default]
    Basic,
    Premium,
    Luxury,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shop {
    pub id: ShopId,
    pub name: String,
    pub address: String,
    pub phone: String,
    pub email: String,
    pub manager_id: Option<UserId>,
    pub status: ShopStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub full_name: String,
    pub email: String,
    pub phone: String,
    pub role: Role,
    pub assigned_shop: Option<ShopId>,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: ServiceId,
    pub shop_id: ShopId,
    pub name: String,
    pub price: Decimal,
    pub duration_minutes: u32,
    pub category: ServiceCategory,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewShop {
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub full_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    pub role: Role,
    #[serde(default)]
    pub assigned_shop: Option<ShopId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewService {
    pub shop_id: ShopId,
    pub name: String,
    pub price: Decimal,
    #[serde(default)]
    pub duration_minutes: u32,
    #[serde(default)]
    pub category: ServiceCategory,
}

/// Read access to shops, users and services.
pub trait Directory: Send + Sync {
    fn shop(&self, id: ShopId) -> Option<Shop>;

    fn user(&self, id: UserId) -> Option<User>;

    fn service(&self, id: ServiceId) -> Option<Service>;

    /// The manager responsible for a shop.
    ///
    /// Prefers the shop's declared manager and falls back to an active
    /// manager user bound to the shop.
    fn manager_of(&self, shop_id: ShopId) -> Option<User>;
}

#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    shops: DashMap<ShopId, Shop>,
    users: DashMap<UserId, User>,
    services: DashMap<ServiceId, Service>,
    next_shop: AtomicU32,
    next_user: AtomicU32,
    next_service: AtomicU32,
    /// Serializes binding changes that touch a shop and two users.
    assignments: Mutex<()>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_shop(&self, shop: NewShop) -> Shop {
        let id = ShopId(self.next_shop.fetch_add(1, Ordering::SeqCst) + 1);
        let shop = Shop {
            id,
            name: shop.name,
            address: shop.address,
            phone: shop.phone,
            email: shop.email.to_lowercase(),
            manager_id: None,
            status: ShopStatus::Active,
        };
        self.shops.insert(id, shop.clone());
        shop
    }

    /// Adds a user. A manager created with a shop becomes that shop's manager.
    pub fn insert_user(&self, user: NewUser) -> Result<User, SettlementError> {
        if let Some(shop_id) = user.assigned_shop
            && !self.shops.contains_key(&shop_id)
        {
            return Err(SettlementError::not_found(Resource::Shop, shop_id));
        }
        let id = UserId(self.next_user.fetch_add(1, Ordering::SeqCst) + 1);
        let record = User {
            id,
            full_name: user.full_name,
            email: user.email.to_lowercase(),
            phone: user.phone,
            role: user.role,
            assigned_shop: None,
            is_active: true,
        };
        self.users.insert(id, record);
        match (user.role, user.assigned_shop) {
            (Role::Manager, Some(shop_id)) => self.assign_manager(shop_id, id)?,
            (Role::Staff, Some(shop_id)) => self.assign_staff(shop_id, id)?,
            _ => {}
        }
        self.user(id)
            .ok_or_else(|| SettlementError::not_found(Resource::User, id))
    }

    pub fn insert_service(&self, service: NewService) -> Result<Service, SettlementError> {
        if !self.shops.contains_key(&service.shop_id) {
            return Err(SettlementError::not_found(Resource::Shop, service.shop_id));
        }
        let id = ServiceId(self.next_service.fetch_add(1, Ordering::SeqCst) + 1);
        let service = Service {
            id,
            shop_id: service.shop_id,
            name: service.name,
            price: service.price,
            duration_minutes: service.duration_minutes,
            category: service.category,
            is_active: true,
        };
        self.services.insert(id, service.clone());
        Ok(service)
    }

    /// Binds `manager_id` to `shop_id`, clearing both previous bindings.
    pub fn assign_manager(&self, shop_id: ShopId, manager_id: UserId) -> Result<(), SettlementError> {
        let _guard = self.assignments.lock();

        let shop = self
            .shop(shop_id)
            .ok_or_else(|| SettlementError::not_found(Resource::Shop, shop_id))?;
        let manager = self
            .user(manager_id)
            .ok_or_else(|| SettlementError::not_found(Resource::User, manager_id))?;
        if manager.role != Role::Manager {
            return Err(SettlementError::validation(
                "managerId",
                format!("user {} is not a manager", manager_id),
            ));
        }

        if let Some(previous) = shop.manager_id.filter(|id| *id != manager_id)
            && let Some(mut user) = self.users.get_mut(&previous)
        {
            user.assigned_shop = None;
        }
        if let Some(old_shop) = manager.assigned_shop.filter(|id| *id != shop_id)
            && let Some(mut old) = self.shops.get_mut(&old_shop)
            && old.manager_id == Some(manager_id)
        {
            old.manager_id = None;
        }

        if let Some(mut shop) = self.shops.get_mut(&shop_id) {
            shop.manager_id = Some(manager_id);
        }
        if let Some(mut user) = self.users.get_mut(&manager_id) {
            user.assigned_shop = Some(shop_id);
        }

        tracing::info!(shop_id = %shop_id, manager_id = %manager_id, "Manager assigned to shop");
        Ok(())
    }

    /// Removes the shop's manager binding on both sides.
    pub fn unassign_manager(&self, shop_id: ShopId) -> Result<(), SettlementError> {
        let _guard = self.assignments.lock();

        let previous = {
            let mut shop = self
                .shops
                .get_mut(&shop_id)
                .ok_or_else(|| SettlementError::not_found(Resource::Shop, shop_id))?;
            shop.manager_id.take()
        };
        if let Some(manager_id) = previous
            && let Some(mut user) = self.users.get_mut(&manager_id)
            && user.assigned_shop == Some(shop_id)
        {
            user.assigned_shop = None;
        }
        Ok(())
    }

    /// Binds a staff user to a shop.
    pub fn assign_staff(&self, shop_id: ShopId, user_id: UserId) -> Result<(), SettlementError> {
        if !self.shops.contains_key(&shop_id) {
            return Err(SettlementError::not_found(Resource::Shop, shop_id));
        }
        let mut user = self
            .users
            .get_mut(&user_id)
            .ok_or_else(|| SettlementError::not_found(Resource::User, user_id))?;
        if user.role != Role::Staff {
            return Err(SettlementError::validation(
                "assignedShop",
                format!("user {} is not shop staff", user_id),
            ));
        }
        user.assigned_shop = Some(shop_id);
        Ok(())
    }

    pub fn set_user_active(&self, user_id: UserId, active: bool) -> Result<(), SettlementError> {
        let mut user = self
            .users
            .get_mut(&user_id)
            .ok_or_else(|| SettlementError::not_found(Resource::User, user_id))?;
        user.is_active = active;
        Ok(())
    }
}

impl Directory for InMemoryDirectory {
    fn shop(&self, id: ShopId) -> Option<Shop> {
        self.shops.get(&id).map(|s| s.clone())
    }

    fn user(&self, id: UserId) -> Option<User> {
        self.users.get(&id).map(|u| u.clone())
    }

    fn service(&self, id: ServiceId) -> Option<Service> {
        self.services.get(&id).map(|s| s.clone())
    }

    fn manager_of(&self, shop_id: ShopId) -> Option<User> {
        let declared = self
            .shop(shop_id)?
            .manager_id
            .and_then(|id| self.user(id))
            .filter(|u| u.role == Role::Manager && u.is_active);
        declared.or_else(|| {
            self.users
                .iter()
                .filter(|u| {
                    u.role == Role::Manager && u.is_active && u.assigned_shop == Some(shop_id)
                })
                .min_by_key(|u| u.id)
                .map(|u| u.clone())
        })
    }
}
