//! Simple REST API server example for the settlement engine.
//!
//! Run with: `cargo run --example server`
//!
//! Callers identify themselves with `x-user-id`; `x-assigned-shop` carries
//! the shop cached in their credential. Both stand in for a verified token.
//! When the cached shop is stale, responses carry `x-refresh-assignment`.
//!
//! ## Endpoints
//!
//! - `POST /settlements` - Settle an appointment or a walk-in
//! - `GET /shops/{shop}/appointments` - List a shop's appointments
//! - `PATCH /shops/{shop}/appointments/{id}/status` - Edit an appointment's status
//! - `PATCH /shops/{shop}/payments/{id}/status` - Edit a payment's status
//! - `GET /shops/{shop}/payments/{id}/invoice` - Invoice view of a completed payment
//! - `GET /payments/history` - The caller's own payments
//! - `POST /reconcile` - Retry payments awaiting reconciliation
//!
//! ## Example Usage
//!
//! ```bash
//! # Settle appointment 1 in full
//! curl -X POST http://localhost:3000/settlements \
//!   -H "Content-Type: application/json" -H "x-user-id: 1" -H "x-assigned-shop: 1" \
//!   -d '{"shopId": 1, "appointmentId": 1, "amount": "590", "paymentMethod": "upi", "transactionId": "TXN1"}'
//!
//! # Advance of 30% on appointment 2
//! curl -X POST http://localhost:3000/settlements \
//!   -H "Content-Type: application/json" -H "x-user-id: 1" -H "x-assigned-shop: 1" \
//!   -d '{"shopId": 1, "appointmentId": 2, "amount": "1000", "paymentMethod": "cash", "paymentType": "advance"}'
//!
//! # List appointments
//! curl -H "x-user-id: 1" http://localhost:3000/shops/1/appointments
//! ```

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use groomer_settlement::directory::{Directory, InMemoryDirectory, NewShop, NewUser, Role};
use groomer_settlement::{
    Appointment, AppointmentId, AppointmentStore, Credential, Engine, InMemoryAppointments,
    InvoiceView, NewAppointment, NewSubject, Page, Payment, PaymentId, PaymentQuery, PaymentState,
    PaymentType, SettlementError, SettlementRequest, SettlementResult, ShopId, UserId, logger,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;

// === Request/Response DTOs ===

#[derive(Debug, Deserialize)]
pub struct StatusUpdate {
    pub status: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryParams {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub payment_type: Option<String>,
    #[serde(default)]
    pub page: usize,
    #[serde(default)]
    pub limit: usize,
}

impl HistoryParams {
    fn into_query(self) -> Result<PaymentQuery, SettlementError> {
        Ok(PaymentQuery {
            status: self.status.as_deref().map(str::parse::<PaymentState>).transpose()?,
            payment_type: self
                .payment_type
                .as_deref()
                .map(str::parse::<PaymentType>)
                .transpose()?,
            page: self.page,
            limit: self.limit,
        })
    }
}

/// Response body for errors.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// === Application State ===

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub directory: Arc<dyn Directory>,
}

impl AppState {
    /// Rebuilds the caller's credential from request headers.
    fn credential(&self, headers: &HeaderMap) -> Option<Credential> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u32>().ok())
        };
        let user = self.directory.user(UserId(header("x-user-id")?))?;
        Some(Credential {
            user_id: user.id,
            role: user.role,
            assigned_shop: header("x-assigned-shop").map(ShopId),
        })
    }
}

// === Error Handling ===

/// Wrapper for converting `SettlementError` into HTTP responses.
pub struct AppError(SettlementError);

impl From<SettlementError> for AppError {
    fn from(err: SettlementError) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status =
            StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: kind.code().to_string(),
            }),
        )
            .into_response()
    }
}

// === Handlers ===

/// POST /settlements - Settle an appointment or a walk-in.
async fn settle(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SettlementRequest>,
) -> Result<Response, AppError> {
    let credential = state.credential(&headers);
    let result: SettlementResult = state.engine.settle(credential.as_ref(), request)?;

    let mut response = (StatusCode::CREATED, Json(&result)).into_response();
    if let Some(shop) = result.refresh_assignment
        && let Ok(value) = HeaderValue::from_str(&shop.to_string())
    {
        response.headers_mut().insert("x-refresh-assignment", value);
    }
    Ok(response)
}

/// GET /shops/{shop}/appointments
async fn list_appointments(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(shop): Path<u32>,
) -> Result<Json<Vec<Appointment>>, AppError> {
    let credential = state.credential(&headers);
    Ok(Json(state.engine.appointments(credential.as_ref(), ShopId(shop))?))
}

/// PATCH /shops/{shop}/appointments/{id}/status
async fn update_appointment_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((shop, id)): Path<(u32, u32)>,
    Json(update): Json<StatusUpdate>,
) -> Result<Json<Appointment>, AppError> {
    let credential = state.credential(&headers);
    let appointment = state.engine.update_appointment_status(
        credential.as_ref(),
        ShopId(shop),
        AppointmentId(id),
        &update.status,
    )?;
    Ok(Json(appointment))
}

/// PATCH /shops/{shop}/payments/{id}/status
async fn update_payment_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((shop, id)): Path<(u32, u32)>,
    Json(update): Json<StatusUpdate>,
) -> Result<Json<Payment>, AppError> {
    let credential = state.credential(&headers);
    let payment = state.engine.update_payment_status(
        credential.as_ref(),
        ShopId(shop),
        PaymentId(id),
        &update.status,
        update.notes.as_deref(),
    )?;
    Ok(Json(payment))
}

/// GET /shops/{shop}/payments/{id}/invoice
async fn invoice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((shop, id)): Path<(u32, u32)>,
) -> Result<Json<InvoiceView>, AppError> {
    let credential = state.credential(&headers);
    let view = state
        .engine
        .invoice_view(credential.as_ref(), ShopId(shop), PaymentId(id))?;
    Ok(Json(view))
}

/// GET /payments/history?status=&paymentType=&page=&limit=
async fn payment_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Page<Payment>>, AppError> {
    let credential = state.credential(&headers);
    let query = params.into_query()?;
    Ok(Json(state.engine.payment_history(credential.as_ref(), &query)?))
}

/// POST /reconcile - Retry payments awaiting reconciliation.
async fn reconcile(State(state): State<AppState>) -> Json<Vec<Payment>> {
    let settled = state
        .engine
        .reconcile_pending()
        .into_iter()
        .filter_map(|(_, result)| result.ok())
        .map(|r| r.payment)
        .collect();
    Json(settled)
}

// === Router ===

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/settlements", post(settle))
        .route("/shops/{shop}/appointments", get(list_appointments))
        .route(
            "/shops/{shop}/appointments/{id}/status",
            patch(update_appointment_status),
        )
        .route("/shops/{shop}/payments/{id}/status", patch(update_payment_status))
        .route("/shops/{shop}/payments/{id}/invoice", get(invoice))
        .route("/payments/history", get(payment_history))
        .route("/reconcile", post(reconcile))
        .with_state(state)
}

// === Main ===

/// One shop with a manager and two bookings to settle against.
fn seed() -> Result<(Arc<InMemoryDirectory>, Arc<InMemoryAppointments>), SettlementError> {
    let directory = Arc::new(InMemoryDirectory::new());
    let shop = directory.insert_shop(NewShop {
        name: "Paws & Claws".into(),
        ..NewShop::default()
    });
    directory.insert_user(NewUser {
        full_name: "Asha Rao".into(),
        email: "asha@pawsandclaws.in".into(),
        phone: String::new(),
        role: Role::Manager,
        assigned_shop: Some(shop.id),
    })?;

    let appointments = Arc::new(InMemoryAppointments::new());
    for (name, kind) in [("Bruno", "dog"), ("Milo", "cat")] {
        let subject = appointments.insert_subject(NewSubject {
            shop_id: shop.id,
            name: name.into(),
            kind: kind.into(),
            ..NewSubject::default()
        });
        appointments.insert_appointment(
            shop.id,
            NewAppointment {
                subject_id: subject.id,
                ..NewAppointment::default()
            },
        );
    }
    Ok((directory, appointments))
}

#[tokio::main]
async fn main() {
    if let Err(e) = logger::init_logger("info", false) {
        eprintln!("Error initializing logger: {}", e);
    }

    let (directory, appointments) = seed().expect("demo seed is valid");
    let state = AppState {
        engine: Arc::new(Engine::new(directory.clone(), appointments)),
        directory,
    };

    let app = create_router(state);

    let listener = TcpListener::bind("127.0.0.1:3000").await.unwrap();
    println!("Settlement API server running on http://127.0.0.1:3000");
    println!();
    println!("Endpoints:");
    println!("  POST  /settlements                          - Settle an appointment");
    println!("  GET   /shops/:shop/appointments              - List appointments");
    println!("  PATCH /shops/:shop/appointments/:id/status   - Edit appointment status");
    println!("  PATCH /shops/:shop/payments/:id/status       - Edit payment status");
    println!("  GET   /shops/:shop/payments/:id/invoice      - Invoice view");
    println!("  GET   /payments/history                      - Caller's payments");
    println!("  POST  /reconcile                             - Retry reconciliation");

    axum::serve(listener, app).await.unwrap();
}
