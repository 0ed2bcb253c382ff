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

use chrono::{DateTime, Utc};
use clap::Parser;
use csv::{ReaderBuilder, Trim, Writer};
use groomer_settlement::directory::{Directory, InMemoryDirectory, NewService, NewShop, NewUser};
use groomer_settlement::{
    AppointmentId, AppointmentStore, Config, Credential, Engine, IdempotencyKey,
    InMemoryAppointments, NewAppointment, NewSubject, Payment, PaymentMethod, PaymentType,
    ServiceId, SettlementError, SettlementRequest, ShopId, SubjectId, UserId, logger,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use thiserror::Error;

/// Settlement replay - process a settlements CSV against seeded shop data
///
/// Loads shops, users, services, subjects and appointments from a JSON seed,
/// replays each settlement row as its caller, and writes the resulting
/// payments to stdout.
#[derive(Parser, Debug)]
#[command(name = "groomer-settlement")]
#[command(about = "Replays settlement CSVs against seeded shop data", long_about = None)]
struct Args {
    /// JSON seed with shops, users, services, subjects and appointments
    #[arg(long, value_name = "FILE")]
    seed: PathBuf,

    /// Path to CSV file with settlements
    ///
    /// Expected format: caller,shop,appointment,subject,type,method,amount,advance_pct,txn,key,notes
    /// Example: cargo run -- --seed shops.json settlements.csv > payments.csv
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Default log filter; `RUST_LOG` takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[derive(Error, Debug)]
enum ReplayError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid seed: {0}")]
    Seed(#[from] serde_json::Error),

    #[error("seed rejected: {0}")]
    Rejected(#[from] SettlementError),

    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
}

fn main() {
    let args = Args::parse();

    if let Err(e) = logger::init_logger(&args.log_level, args.json_logs) {
        eprintln!("Error initializing logger: {}", e);
        process::exit(1);
    }

    if let Err(e) = run(&args) {
        tracing::error!(error = %e, "Replay failed");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), ReplayError> {
    let seed = open(&args.seed)?;
    let input = open(&args.input)?;

    let world = World::from_seed(BufReader::new(seed), Config::from_env())?;
    let payments = replay(&world, BufReader::new(input))?;
    write_payments(&payments, std::io::stdout())?;
    Ok(())
}

fn open(path: &PathBuf) -> Result<File, ReplayError> {
    File::open(path).map_err(|source| ReplayError::Io {
        path: path.clone(),
        source,
    })
}

/// Records to load before replaying. Ids are assigned from 1 in file order.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Seed {
    shops: Vec<NewShop>,
    users: Vec<NewUser>,
    services: Vec<NewService>,
    subjects: Vec<NewSubject>,
    appointments: Vec<SeedAppointment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeedAppointment {
    shop_id: ShopId,
    subject_id: SubjectId,
    #[serde(default)]
    scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    service_ids: Vec<ServiceId>,
    #[serde(default)]
    price: Decimal,
}

/// Seeded stores and the engine running on them.
struct World {
    directory: Arc<InMemoryDirectory>,
    engine: Engine,
}

impl World {
    fn from_seed<R: Read>(reader: R, config: Config) -> Result<Self, ReplayError> {
        let seed: Seed = serde_json::from_reader(reader)?;
        let (shops, users, bookings) = (seed.shops.len(), seed.users.len(), seed.appointments.len());

        let directory = Arc::new(InMemoryDirectory::new());
        for shop in seed.shops {
            directory.insert_shop(shop);
        }
        for user in seed.users {
            directory.insert_user(user)?;
        }
        for service in seed.services {
            directory.insert_service(service)?;
        }

        let appointments = Arc::new(InMemoryAppointments::new());
        for subject in seed.subjects {
            appointments.insert_subject(subject);
        }
        for booking in seed.appointments {
            appointments.insert_appointment(
                booking.shop_id,
                NewAppointment {
                    subject_id: booking.subject_id,
                    scheduled_for: booking.scheduled_for,
                    service_ids: booking.service_ids,
                    price: booking.price,
                },
            );
        }

        let engine = Engine::with_config(config, directory.clone(), appointments)?;
        tracing::info!(shops, users, appointments = bookings, "Seed loaded");
        Ok(World { directory, engine })
    }
}

/// Raw CSV record matching the input format.
///
/// Fields: `caller, shop, appointment, subject, type, method, amount, advance_pct, txn, key, notes`
#[derive(Debug, Deserialize)]
struct CsvRecord {
    caller: u32,
    shop: u32,
    #[serde(deserialize_with = "csv::invalid_option")]
    appointment: Option<u32>,
    subject: Option<String>,
    #[serde(rename = "type")]
    payment_type: String,
    method: String,
    amount: Decimal,
    #[serde(deserialize_with = "csv::invalid_option")]
    advance_pct: Option<Decimal>,
    txn: Option<String>,
    key: Option<String>,
    notes: Option<String>,
}

impl CsvRecord {
    fn into_request(self) -> Result<(UserId, SettlementRequest), SettlementError> {
        let method: PaymentMethod = self.method.parse()?;
        let payment_type: PaymentType = self.payment_type.parse()?;

        let mut request = SettlementRequest::new(ShopId(self.shop), self.amount, method);
        request.appointment_id = self.appointment.map(AppointmentId);
        request.subject_name = self.subject;
        request.payment_type = payment_type;
        request.advance_percentage = self.advance_pct;
        request.transaction_id = self.txn;
        request.idempotency_key = self.key.map(IdempotencyKey);
        request.notes = self.notes;
        Ok((UserId(self.caller), request))
    }
}

/// Replays settlements from a CSV reader, returning the payments written.
///
/// Malformed rows and rejected settlements are logged and skipped.
///
/// # CSV Format
///
/// ```csv
/// caller,shop,appointment,subject,type,method,amount,advance_pct,txn,key,notes
/// 1,1,1,,full,upi,590,,TXN1,,
/// 1,1,2,,advance,cash,1000,30,,,first visit
/// ```
///
/// # Errors
///
/// Returns a CSV error if the reader fails or the CSV structure is invalid.
fn replay<R: Read>(world: &World, reader: R) -> Result<Vec<Payment>, csv::Error> {
    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    let mut payments = Vec::new();
    for (line, result) in rdr.deserialize::<CsvRecord>().enumerate() {
        let row = line + 2;
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(row, error = %e, "Skipping malformed row");
                continue;
            }
        };
        let (caller, request) = match record.into_request() {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(row, error = %e, "Skipping invalid row");
                continue;
            }
        };

        let credential = world.directory.user(caller).map(|u| Credential::for_user(&u));
        match world.engine.settle(credential.as_ref(), request) {
            Ok(result) => payments.push(result.payment),
            Err(SettlementError::Consistency { payment_id, .. }) => {
                tracing::warn!(row, payment_id = %payment_id, "Settlement awaiting reconciliation");
                if let Some(payment) = world.engine.get_payment(payment_id) {
                    payments.push(payment);
                }
            }
            Err(e) => {
                tracing::warn!(row, code = e.kind().code(), error = %e, "Settlement rejected");
            }
        }
    }

    Ok(payments)
}

#[derive(Debug, Serialize)]
struct PaymentRow {
    payment: u32,
    shop: u32,
    appointment: Option<u32>,
    #[serde(rename = "type")]
    payment_type: String,
    method: String,
    total: Decimal,
    amount: Decimal,
    base: Decimal,
    tax: Decimal,
    balance: Decimal,
    status: String,
}

impl From<&Payment> for PaymentRow {
    fn from(p: &Payment) -> Self {
        PaymentRow {
            payment: p.id.0,
            shop: p.shop_id.0,
            appointment: p.appointment_id.map(|a| a.0),
            payment_type: p.payment_type.to_string(),
            method: p.method.to_string(),
            total: p.settlement_total,
            amount: p.amount,
            base: p.base_amount,
            tax: p.tax_amount,
            balance: p.balance_amount,
            status: p.status.to_string(),
        }
    }
}

/// Writes payments as CSV.
///
/// # CSV Format
///
/// Columns: `payment, shop, appointment, type, method, total, amount, base, tax, balance, status`
fn write_payments<W: Write>(payments: &[Payment], writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);
    for payment in payments {
        wtr.serialize(PaymentRow::from(payment))?;
    }
    wtr.flush()?;
    Ok(())
}
