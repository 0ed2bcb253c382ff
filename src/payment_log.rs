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

//! Thread-safe payment log, reconciliation queue and idempotency registry.

use crate::SettlementError;
use crate::base::{IdempotencyKey, PaymentId, ShopId};
use crate::error::Resource;
use crate::payment::{Payment, PaymentState, PaymentType};
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const DEFAULT_PAGE_LIMIT: usize = 10;
const MAX_PAGE_LIMIT: usize = 100;

/// All payments ever written, keyed by id.
///
/// Payment ids are allocated here and never reused. Payments whose
/// appointment update failed are additionally queued for reconciliation.
#[derive(Debug, Default)]
pub struct PaymentLog {
    payments: DashMap<PaymentId, Payment>,
    next_id: AtomicU32,
    /// Payments waiting for their appointment to catch up, FIFO.
    reconciliation: SegQueue<PaymentId>,
}

impl PaymentLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_id(&self) -> PaymentId {
        PaymentId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Adds a payment.
    ///
    /// # Errors
    ///
    /// Returns [`SettlementError::Configuration`] if the id was already written.
    pub fn insert(&self, payment: Payment) -> Result<(), SettlementError> {
        match self.payments.entry(payment.id) {
            Entry::Occupied(_) => Err(SettlementError::Configuration(format!(
                "payment id {} allocated twice",
                payment.id
            ))),
            Entry::Vacant(entry) => {
                entry.insert(payment);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: PaymentId) -> Option<Payment> {
        self.payments.get(&id).map(|p| p.clone())
    }

    /// Applies `change` to a stored payment and returns the result.
    ///
    /// The stored payment is left untouched if `change` fails.
    pub fn update<F>(&self, id: PaymentId, change: F) -> Result<Payment, SettlementError>
    where
        F: FnOnce(&mut Payment) -> Result<(), SettlementError>,
    {
        let mut stored = self
            .payments
            .get_mut(&id)
            .ok_or_else(|| SettlementError::not_found(Resource::Payment, id))?;
        let mut draft = stored.clone();
        change(&mut draft)?;
        *stored = draft.clone();
        Ok(draft)
    }

    /// Flags a payment whose appointment update failed and queues it.
    pub fn flag_for_reconciliation(&self, id: PaymentId) {
        if let Some(mut payment) = self.payments.get_mut(&id) {
            payment.needs_reconciliation = true;
        }
        self.reconciliation.push(id);
    }

    /// Removes and returns every queued payment id, oldest first.
    pub fn drain_reconciliation(&self) -> Vec<PaymentId> {
        let mut drained = Vec::with_capacity(self.reconciliation.len());
        while let Some(id) = self.reconciliation.pop() {
            drained.push(id);
        }
        drained
    }

    /// Payments still flagged for reconciliation, oldest first.
    pub fn flagged(&self) -> Vec<Payment> {
        let mut flagged: Vec<Payment> = self
            .payments
            .iter()
            .filter(|p| p.needs_reconciliation)
            .map(|p| p.clone())
            .collect();
        flagged.sort_by_key(|p| p.id);
        flagged
    }

    /// Matching payments, newest first, one page at a time.
    pub fn query<P>(&self, query: &PaymentQuery, predicate: P) -> Page<Payment>
    where
        P: Fn(&Payment) -> bool,
    {
        let mut matching: Vec<Payment> = self
            .payments
            .iter()
            .filter(|p| predicate(p) && query.matches(p))
            .map(|p| p.clone())
            .collect();
        matching.sort_by(|a, b| b.paid_at.cmp(&a.paid_at).then(b.id.cmp(&a.id)));
        Page::slice(matching, query.page, query.limit)
    }

    pub fn len(&self) -> usize {
        self.payments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payments.is_empty()
    }
}

/// Filters for payment history.
#[derive(Debug, Clone, Default)]
pub struct PaymentQuery {
    pub status: Option<PaymentState>,
    pub payment_type: Option<PaymentType>,
    /// 1-based; zero is treated as the first page.
    pub page: usize,
    /// Clamped to `1..=100`; zero means the default of 10.
    pub limit: usize,
}

impl PaymentQuery {
    fn matches(&self, payment: &Payment) -> bool {
        self.status.is_none_or(|s| s == payment.status)
            && self.payment_type.is_none_or(|t| t == payment.payment_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub total_pages: usize,
    pub total: usize,
}

impl<T> Page<T> {
    fn slice(all: Vec<T>, page: usize, limit: usize) -> Self {
        let page = page.max(1);
        let limit = if limit == 0 {
            DEFAULT_PAGE_LIMIT
        } else {
            limit.min(MAX_PAGE_LIMIT)
        };
        let total = all.len();
        let skip = (page - 1).saturating_mul(limit);
        let items = all.into_iter().skip(skip).take(limit).collect();
        Page {
            items,
            page,
            total_pages: total.div_ceil(limit),
            total,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Reservation {
    payment_id: Option<PaymentId>,
    reserved_at: Instant,
}

/// Reservations between sweeps of expired keys.
const PURGE_EVERY: usize = 256;

/// Idempotency keys seen within a bounded window, scoped per shop.
#[derive(Debug)]
pub struct IdempotencyRegistry {
    keys: DashMap<(ShopId, IdempotencyKey), Reservation>,
    window: Duration,
    reservations: AtomicUsize,
}

impl IdempotencyRegistry {
    pub fn new(window: Duration) -> Self {
        Self {
            keys: DashMap::new(),
            window,
            reservations: AtomicUsize::new(0),
        }
    }

    /// Claims `key` within `shop` for a new settlement attempt.
    ///
    /// Every few hundred reservations also sweep expired keys.
    ///
    /// # Errors
    ///
    /// Returns [`SettlementError::DuplicateSettlement`] if the shop claimed
    /// the key within the window.
    pub fn reserve(&self, shop: ShopId, key: &IdempotencyKey) -> Result<(), SettlementError> {
        if self.reservations.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            self.purge_expired();
        }

        let now = Instant::now();
        let fresh = Reservation {
            payment_id: None,
            reserved_at: now,
        };
        match self.keys.entry((shop, key.clone())) {
            Entry::Occupied(mut entry) => {
                let existing = *entry.get();
                if now.duration_since(existing.reserved_at) < self.window {
                    return Err(SettlementError::DuplicateSettlement {
                        key: key.to_string(),
                        payment_id: existing.payment_id,
                    });
                }
                entry.insert(fresh);
                Ok(())
            }
            Entry::Vacant(entry) => {
                entry.insert(fresh);
                Ok(())
            }
        }
    }

    /// Records the payment written under `key`.
    pub fn bind(&self, shop: ShopId, key: &IdempotencyKey, payment_id: PaymentId) {
        if let Some(mut reservation) = self.keys.get_mut(&(shop, key.clone())) {
            reservation.payment_id = Some(payment_id);
        }
    }

    /// Frees a key whose attempt failed before anything was written.
    pub fn release(&self, shop: ShopId, key: &IdempotencyKey) {
        self.keys
            .remove_if(&(shop, key.clone()), |_, reservation| reservation.payment_id.is_none());
    }

    /// Drops keys older than the window.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.keys
            .retain(|_, reservation| now.duration_since(reservation.reserved_at) < self.window);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::UserId;
    use crate::payment::PaymentMethod;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn payment(id: PaymentId, payment_type: PaymentType) -> Payment {
        let now = Utc::now();
        Payment {
            id,
            shop_id: ShopId(1),
            payer_id: UserId(1),
            manager_id: UserId(2),
            appointment_id: None,
            subject_name: None,
            owner_name: None,
            service_id: None,
            service_name: None,
            amount: dec!(100),
            base_amount: dec!(84.75),
            tax_amount: dec!(15.25),
            settlement_total: dec!(100),
            payment_type,
            advance_percentage: Decimal::ZERO,
            balance_amount: Decimal::ZERO,
            method: PaymentMethod::Cash,
            transaction_id: String::new(),
            notes: String::new(),
            status: PaymentState::Completed,
            needs_reconciliation: false,
            paid_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn rejects_duplicate_ids() {
        let log = PaymentLog::new();
        log.insert(payment(PaymentId(1), PaymentType::Full)).unwrap();
        assert!(log.insert(payment(PaymentId(1), PaymentType::Full)).is_err());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn allocated_ids_are_unique() {
        let log = PaymentLog::new();
        let a = log.allocate_id();
        let b = log.allocate_id();
        assert_ne!(a, b);
    }

    #[test]
    fn failed_update_leaves_payment_untouched() {
        let log = PaymentLog::new();
        log.insert(payment(PaymentId(1), PaymentType::Full)).unwrap();
        let result = log.update(PaymentId(1), |p| {
            p.notes = "changed".into();
            Err(SettlementError::validation("status", "nope"))
        });
        assert!(result.is_err());
        assert_eq!(log.get(PaymentId(1)).unwrap().notes, "");
    }

    #[test]
    fn reconciliation_queue_drains_in_order() {
        let log = PaymentLog::new();
        log.insert(payment(PaymentId(1), PaymentType::Full)).unwrap();
        log.insert(payment(PaymentId(2), PaymentType::Full)).unwrap();
        log.flag_for_reconciliation(PaymentId(2));
        log.flag_for_reconciliation(PaymentId(1));

        assert_eq!(log.flagged().len(), 2);
        assert_eq!(log.drain_reconciliation(), vec![PaymentId(2), PaymentId(1)]);
        assert!(log.drain_reconciliation().is_empty());
    }

    #[test]
    fn query_filters_and_paginates() {
        let log = PaymentLog::new();
        for i in 1..=25 {
            let kind = if i % 5 == 0 { PaymentType::Advance } else { PaymentType::Full };
            log.insert(payment(PaymentId(i), kind)).unwrap();
        }

        let page = log.query(
            &PaymentQuery {
                page: 3,
                ..PaymentQuery::default()
            },
            |_| true,
        );
        assert_eq!(page.total, 25);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.items.len(), 5);

        let advances = log.query(
            &PaymentQuery {
                payment_type: Some(PaymentType::Advance),
                ..PaymentQuery::default()
            },
            |_| true,
        );
        assert_eq!(advances.total, 5);
    }

    #[test]
    fn page_limit_is_clamped() {
        let page = Page::slice((0..500).collect::<Vec<_>>(), 0, 1000);
        assert_eq!(page.page, 1);
        assert_eq!(page.items.len(), 100);
        assert_eq!(page.total_pages, 5);
    }

    #[test]
    fn page_past_the_end_is_empty() {
        let page = Page::slice((0..25).collect::<Vec<_>>(), usize::MAX, 10);
        assert_eq!(page.page, usize::MAX);
        assert!(page.items.is_empty());
        assert_eq!(page.total, 25);
        assert_eq!(page.total_pages, 3);
    }

    #[test]
    fn idempotency_key_blocks_resubmission() {
        let registry = IdempotencyRegistry::new(Duration::from_secs(60));
        let key = IdempotencyKey::from("attempt-1");
        registry.reserve(ShopId(1), &key).unwrap();
        registry.bind(ShopId(1), &key, PaymentId(7));

        assert_eq!(
            registry.reserve(ShopId(1), &key),
            Err(SettlementError::DuplicateSettlement {
                key: "attempt-1".into(),
                payment_id: Some(PaymentId(7)),
            })
        );
    }

    #[test]
    fn released_key_can_be_reused() {
        let registry = IdempotencyRegistry::new(Duration::from_secs(60));
        let key = IdempotencyKey::from("attempt-2");
        registry.reserve(ShopId(1), &key).unwrap();
        registry.release(ShopId(1), &key);
        assert!(registry.reserve(ShopId(1), &key).is_ok());
    }

    #[test]
    fn bound_key_survives_release() {
        let registry = IdempotencyRegistry::new(Duration::from_secs(60));
        let key = IdempotencyKey::from("attempt-3");
        registry.reserve(ShopId(1), &key).unwrap();
        registry.bind(ShopId(1), &key, PaymentId(1));
        registry.release(ShopId(1), &key);
        assert!(registry.reserve(ShopId(1), &key).is_err());
    }

    #[test]
    fn expired_keys_are_reusable() {
        let registry = IdempotencyRegistry::new(Duration::ZERO);
        let key = IdempotencyKey::from("attempt-4");
        registry.reserve(ShopId(1), &key).unwrap();
        assert!(registry.reserve(ShopId(1), &key).is_ok());
        registry.purge_expired();
        assert!(registry.is_empty());
    }

    #[test]
    fn keys_are_scoped_per_shop() {
        let registry = IdempotencyRegistry::new(Duration::from_secs(60));
        let key = IdempotencyKey::from("order-1");
        registry.reserve(ShopId(1), &key).unwrap();
        registry.bind(ShopId(1), &key, PaymentId(1));

        assert!(registry.reserve(ShopId(2), &key).is_ok());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn reservations_sweep_expired_keys() {
        let registry = IdempotencyRegistry::new(Duration::ZERO);
        for i in 0..PURGE_EVERY {
            registry
                .reserve(ShopId(1), &IdempotencyKey(format!("attempt-{}", i)))
                .unwrap();
        }
        assert!(registry.len() < PURGE_EVERY);
    }
}
