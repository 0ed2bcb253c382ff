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

//! Property-based tests for the money engine and settlement coordinator.
//!
//! These tests verify invariants that should hold for any amount and any
//! sequence of settlements.

use groomer_settlement::directory::{InMemoryDirectory, NewShop, NewUser, Role};
use groomer_settlement::money::round2;
use groomer_settlement::{
    AppointmentStatus, AppointmentStore, Config, Credential, Engine, InMemoryAppointments,
    MoneyEngine, NewAppointment, NewSubject, PaymentMethod, PaymentStatus, PaymentType,
    SettlementError, SettlementRequest,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

// =============================================================================
// Arbitrary Strategies
// =============================================================================

/// Generate a positive amount (0.01 to 100000.00).
fn arb_amount() -> impl Strategy<Value = Decimal> {
    (1i64..=10_000_000i64).prop_map(|paise| Decimal::new(paise, 2))
}

fn arb_percentage() -> impl Strategy<Value = Decimal> {
    (1i64..=100i64).prop_map(Decimal::from)
}

fn arb_method() -> impl Strategy<Value = PaymentMethod> {
    prop_oneof![
        Just(PaymentMethod::Cash),
        Just(PaymentMethod::Card),
        Just(PaymentMethod::Upi),
        Just(PaymentMethod::Netbanking),
        Just(PaymentMethod::Wallet),
    ]
}

fn money() -> MoneyEngine {
    MoneyEngine::new(&Config::default())
}

// =============================================================================
// Money Engine Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    /// Base plus tax equals the gross total to the paisa.
    #[test]
    fn gross_from_base_balances(base in arb_amount()) {
        let split = money().gross_from_base(base).unwrap();
        prop_assert_eq!(split.base + split.tax, split.total);
    }

    /// Splitting a total never changes the total.
    #[test]
    fn base_from_gross_keeps_total(total in arb_amount()) {
        let split = money().base_from_gross(total).unwrap();
        prop_assert_eq!(split.total, total);
        prop_assert_eq!(split.base + split.tax, total);
        prop_assert!(split.tax >= Decimal::ZERO);
    }

    /// Default advance collects 30%, leaving the rest as balance.
    #[test]
    fn default_advance_is_thirty_percent(total in arb_amount()) {
        let Ok(amount) = money().settlement_amount(total, PaymentType::Advance, None) else {
            // Totals under 0.02 round to a zero advance.
            prop_assert!(round2(total * dec!(0.30)).is_zero());
            return Ok(());
        };
        prop_assert_eq!(amount.amount_due, round2(total * dec!(0.30)));
        prop_assert_eq!(amount.balance_remaining, total - amount.amount_due);
    }

    /// Full settlements never leave a balance.
    #[test]
    fn full_leaves_no_balance(total in arb_amount(), pct in proptest::option::of(arb_percentage())) {
        let amount = money().settlement_amount(total, PaymentType::Full, pct).unwrap();
        prop_assert_eq!(amount.balance_remaining, Decimal::ZERO);
        prop_assert_eq!(amount.amount_due, total);
    }

    /// Advance plus balance always reconstructs the total.
    #[test]
    fn advance_and_balance_sum_to_total(total in arb_amount(), pct in arb_percentage()) {
        let money = money();
        let Ok(advance) = money.settlement_amount(total, PaymentType::Advance, Some(pct)) else {
            return Ok(());
        };
        prop_assert!(advance.amount_due <= total);
        if advance.balance_remaining.is_zero() {
            return Ok(());
        }
        let rest = money
            .balance_settlement(total, advance.balance_remaining, PaymentType::Full, None)
            .unwrap();
        prop_assert_eq!(advance.amount_due + rest.amount_due, total);
    }
}

// =============================================================================
// Settlement Properties
// =============================================================================

struct World {
    appointments: Arc<InMemoryAppointments>,
    engine: Engine,
    credential: Credential,
    shop: groomer_settlement::ShopId,
}

fn world() -> World {
    let directory = Arc::new(InMemoryDirectory::new());
    let shop = directory
        .insert_shop(NewShop { name: "Paws".into(), ..NewShop::default() })
        .id;
    let manager = directory
        .insert_user(NewUser {
            full_name: "Asha".into(),
            email: String::new(),
            phone: String::new(),
            role: Role::Manager,
            assigned_shop: Some(shop),
        })
        .unwrap();
    let appointments = Arc::new(InMemoryAppointments::new());
    let engine = Engine::new(directory, appointments.clone());
    World {
        appointments,
        engine,
        credential: Credential::for_user(&manager),
        shop,
    }
}

impl World {
    fn book(&self) -> groomer_settlement::Appointment {
        let subject = self.appointments.insert_subject(NewSubject {
            shop_id: self.shop,
            name: "Bruno".into(),
            kind: "dog".into(),
            ..NewSubject::default()
        });
        self.appointments.insert_appointment(
            self.shop,
            NewAppointment { subject_id: subject.id, ..NewAppointment::default() },
        )
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Non-cash settlements without a transaction id never write a payment.
    #[test]
    fn non_cash_without_transaction_id_never_persists(
        total in arb_amount(),
        method in arb_method().prop_filter("non-cash", |m| *m != PaymentMethod::Cash),
    ) {
        let w = world();
        let booking = w.book();
        let mut request = SettlementRequest::new(w.shop, total, method);
        request.appointment_id = Some(booking.id);

        let result = w.engine.settle(Some(&w.credential), request);
        let is_transaction_id_error = matches!(
            result,
            Err(SettlementError::Validation { field: "transactionId", .. })
        );
        prop_assert!(is_transaction_id_error);
        prop_assert_eq!(w.engine.payment_count(), 0);
        prop_assert_eq!(w.engine.get_appointment(booking.id), Some(booking));
    }

    /// Every payment balances and the appointment never collects more than its total.
    #[test]
    fn settlements_never_overcollect(
        total in arb_amount(),
        steps in prop::collection::vec(
            (prop_oneof![Just(PaymentType::Full), Just(PaymentType::Advance)], arb_percentage()),
            1..6,
        ),
    ) {
        let w = world();
        let booking = w.book();

        for (payment_type, pct) in steps {
            let mut request = SettlementRequest::new(w.shop, total, PaymentMethod::Cash);
            request.appointment_id = Some(booking.id);
            request.payment_type = payment_type;
            request.advance_percentage = Some(pct);
            if let Ok(result) = w.engine.settle(Some(&w.credential), request) {
                prop_assert!(result.payment.is_balanced());
                prop_assert_eq!(result.payment.settlement_total, total);
            }

            let current = w.engine.get_appointment(booking.id).unwrap();
            prop_assert!(current.collected <= total);
            if current.payment_status == PaymentStatus::Paid {
                prop_assert_eq!(current.collected, total);
                prop_assert_eq!(current.status, AppointmentStatus::Completed);
            }
        }
    }

    /// A full settlement of an unpriced appointment backfills its price.
    #[test]
    fn full_settlement_backfills_price(total in arb_amount(), method in arb_method()) {
        let w = world();
        let booking = w.book();
        let mut request = SettlementRequest::new(w.shop, total, method);
        request.appointment_id = Some(booking.id);
        request.transaction_id = Some("TXN".into());

        let result = w.engine.settle(Some(&w.credential), request).unwrap();
        prop_assert_eq!(result.amount_collected(), total);

        let settled = w.engine.get_appointment(booking.id).unwrap();
        prop_assert_eq!(settled.price, total);
        prop_assert_eq!(settled.payment_status, PaymentStatus::Paid);
        prop_assert_eq!(settled.status, AppointmentStatus::Completed);
    }
}
