// =============================================================================
// ERROR MODULE
// =============================================================================
// Error taxonomy for the reservation engine and its HTTP rendering.
//
// ERROR HANDLING PHILOSOPHY:
// - Every user-facing error carries a stable machine-readable kind plus a
//   human-readable message; localization belongs to the UI
// - Conflicts, unavailability and policy rejections are expected outcomes,
//   so they are logged quietly, never as system errors
// - Storage failures surface only as `EngineUnavailable`
// =============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use uuid::Uuid;

use crate::models::ErrorResponse;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    // -------------------------------------------------------------------------
    // CLIENT ERRORS
    // -------------------------------------------------------------------------
    /// Malformed input (inverted range, retroactive booking, bad header)
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    /// Actor lacks the role required for the operation
    #[error("{0}")]
    Forbidden(String),

    /// Duplicate plate or identifier
    #[error("{0}")]
    AlreadyExists(String),

    // -------------------------------------------------------------------------
    // BOOKING OUTCOMES
    // -------------------------------------------------------------------------
    #[error("slot {slot_id} is already claimed for the requested window")]
    SlotConflict { slot_id: Uuid },

    #[error("parking lot {lot_id} has no free slot for the requested window")]
    NoAvailability { lot_id: Uuid },

    #[error("cannot move reservation from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("reservations cannot be cancelled less than {lead_minutes} minutes before start")]
    CancellationWindowExpired { lead_minutes: i64 },

    #[error("subscription {0} is not active")]
    SubscriptionNotActive(Uuid),

    // -------------------------------------------------------------------------
    // INFRASTRUCTURE
    // -------------------------------------------------------------------------
    /// Storage unavailable after bounded retries
    #[error("reservation engine unavailable: {0}")]
    EngineUnavailable(String),
}

impl AppError {
    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::AlreadyExists(_) => "ALREADY_EXISTS",
            AppError::SlotConflict { .. } => "SLOT_CONFLICT",
            AppError::NoAvailability { .. } => "NO_AVAILABILITY",
            AppError::InvalidTransition { .. } => "INVALID_TRANSITION",
            AppError::CancellationWindowExpired { .. } => "CANCELLATION_WINDOW_EXPIRED",
            AppError::SubscriptionNotActive(_) => "SUBSCRIPTION_NOT_ACTIVE",
            AppError::EngineUnavailable(_) => "ENGINE_UNAVAILABLE",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::AlreadyExists(_)
            | AppError::SlotConflict { .. }
            | AppError::NoAvailability { .. }
            | AppError::InvalidTransition { .. }
            | AppError::SubscriptionNotActive(_) => StatusCode::CONFLICT,
            AppError::CancellationWindowExpired { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::EngineUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

// =============================================================================
// HTTP RESPONSE CONVERSION
// =============================================================================
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind();
        let message = self.to_string();

        // Expected outcomes stay out of the error log
        match &self {
            AppError::EngineUnavailable(_) => {
                tracing::error!(error_code = kind, message = %message, "Request failed");
            }
            AppError::SlotConflict { .. }
            | AppError::NoAvailability { .. }
            | AppError::CancellationWindowExpired { .. } => {
                tracing::info!(error_code = kind, message = %message, "Request rejected");
            }
            _ => {
                tracing::debug!(error_code = kind, message = %message, "Request rejected");
            }
        }

        (status, Json(ErrorResponse::new(kind, message))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

// =============================================================================
// CONVERSION HELPERS
// =============================================================================

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => AppError::NotFound(msg),
            StoreError::Duplicate(msg) => AppError::AlreadyExists(msg),
            StoreError::Conflict { slot_id } => AppError::SlotConflict { slot_id },
            StoreError::Transient(msg) | StoreError::Fatal(msg) => {
                AppError::EngineUnavailable(msg)
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::EngineUnavailable(err.to_string())
    }
}
