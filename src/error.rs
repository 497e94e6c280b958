/// Centralized error types for the trading runtime
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    // Storage Errors
    #[error("Persist failed: {0}")]
    Persist(String),

    #[error("Uniqueness conflict on {key}: {detail}")]
    UniquenessConflict { key: String, detail: String },

    #[error("Row not found: {0}")]
    NotFound(String),

    #[error("Stale row version for {0}")]
    StaleVersion(String),

    // Broker Errors
    #[error("Broker call timed out: {0}")]
    BrokerTimeout(String),

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Broker rejected order: {code} - {message}")]
    BrokerReject { code: String, message: String },

    #[error("Broker adapter not registered: {0}")]
    BrokerNotRegistered(String),

    // Qualification Errors
    #[error("Validation rejected: {0:?}")]
    ValidationReject(Vec<String>),

    #[error("Exit cooldown active for trade {trade_id} reason {reason}")]
    ExitCooldownActive { trade_id: String, reason: String },

    // Guards
    #[error("Guard failed: {0}")]
    GuardFailed(String),

    #[error("Startup gate failed: {0}")]
    StartupGateFailed(String),

    // State machine
    #[error("Invalid trade transition: {0}")]
    InvalidTransition(String),

    // Network / Feed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Feed disconnected: {0}")]
    FeedDisconnected(String),

    // Data Errors
    #[error("Invalid candle data: {0}")]
    InvalidCandleData(String),

    #[error("Deserialization failed: {0}")]
    Deserialization(#[from] serde_json::Error),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    // File I/O Errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Market Session Errors
    #[error("Market closed: {0}")]
    MarketClosed(String),

    // Event Bus Errors
    #[error("Event dispatch failed: {0}")]
    EventDispatchFailed(String),

    // System Errors
    #[error("System shutdown: {0}")]
    SystemShutdown(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(code, msg)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                EngineError::UniquenessConflict {
                    key: "constraint".to_string(),
                    detail: msg.clone().unwrap_or_else(|| e.to_string()),
                }
            }
            _ => EngineError::Persist(e.to_string()),
        }
    }
}

impl EngineError {
    /// Check if error is recoverable (reconciler or retry will heal)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::BrokerTimeout(_)
                | EngineError::BrokerUnavailable(_)
                | EngineError::FeedDisconnected(_)
                | EngineError::StaleVersion(_)
                | EngineError::Http(_)
        )
    }

    /// Expected outcome, not a failure (idempotent success or throttled)
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            EngineError::UniquenessConflict { .. } | EngineError::ExitCooldownActive { .. }
        )
    }

    /// Get error code for logging/monitoring
    pub fn error_code(&self) -> &str {
        match self {
            EngineError::Persist(_) => "STORE_001",
            EngineError::UniquenessConflict { .. } => "STORE_002",
            EngineError::NotFound(_) => "STORE_003",
            EngineError::StaleVersion(_) => "STORE_004",
            EngineError::BrokerTimeout(_) => "BROKER_001",
            EngineError::BrokerUnavailable(_) => "BROKER_002",
            EngineError::BrokerReject { .. } => "BROKER_003",
            EngineError::BrokerNotRegistered(_) => "BROKER_004",
            EngineError::ValidationReject(_) => "QUAL_001",
            EngineError::ExitCooldownActive { .. } => "QUAL_002",
            EngineError::GuardFailed(_) => "GUARD_001",
            EngineError::StartupGateFailed(_) => "GUARD_002",
            EngineError::InvalidTransition(_) => "TRADE_001",
            EngineError::Http(_) => "NET_001",
            EngineError::WebSocket(_) => "NET_002",
            EngineError::FeedDisconnected(_) => "NET_003",
            EngineError::InvalidCandleData(_) => "DATA_001",
            EngineError::Deserialization(_) => "DATA_002",
            EngineError::Config(_) => "CFG_001",
            EngineError::InvalidParameter(_) => "CFG_002",
            EngineError::Io(_) => "FILE_001",
            EngineError::MarketClosed(_) => "MKT_001",
            EngineError::EventDispatchFailed(_) => "EVENT_001",
            EngineError::SystemShutdown(_) => "SYS_001",
            EngineError::Internal(_) => "INT_001",
        }
    }
}
