use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    InvalidInput(#[from] ConfigurationError),
    #[error("operation failed: {0}")]
    OperationFailed(String),
}

pub type DomainResult<T> = Result<T, DomainError>;

/// Operator-supplied configuration rejected at the point of change.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("invalid configuration for {field}: {message}")]
pub struct ConfigurationError {
    pub field: String,
    pub message: String,
}

impl ConfigurationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self { field: field.into(), message: message.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionFailure {
    Timeout,
    Auth,
    Unreachable,
    Unsupported,
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("camera connection failed ({reason:?}): {detail}")]
pub struct ConnectionError {
    pub reason: ConnectionFailure,
    pub detail: String,
}

impl ConnectionError {
    pub fn new(reason: ConnectionFailure, detail: impl Into<String>) -> Self {
        Self { reason, detail: detail.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InferenceFailure {
    ModelNotReady,
    IncompatibleInput,
    RuntimeFault,
    Timeout,
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("inference failed ({reason:?}): {detail}")]
pub struct InferenceError {
    pub reason: InferenceFailure,
    pub detail: String,
}

impl InferenceError {
    pub fn new(reason: InferenceFailure, detail: impl Into<String>) -> Self {
        Self { reason, detail: detail.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PersistenceFailure {
    ConnectionLost,
    ConstraintViolation,
    DiskFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModbusFailure {
    ConnectTimeout,
    IllegalAddress,
    DeviceBusy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MqttFailure {
    BrokerUnreachable,
    AuthRejected,
    PublishTimeout,
}

/// Failure reported by one result sink.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SinkError {
    #[error("persistence error ({reason:?}): {detail}")]
    Persistence { reason: PersistenceFailure, detail: String },
    #[error("modbus error ({reason:?}): {detail}")]
    Modbus { reason: ModbusFailure, detail: String },
    #[error("mqtt error ({reason:?}): {detail}")]
    Mqtt { reason: MqttFailure, detail: String },
}

impl SinkError {
    pub fn persistence(reason: PersistenceFailure, detail: impl Into<String>) -> Self {
        Self::Persistence { reason, detail: detail.into() }
    }

    pub fn modbus(reason: ModbusFailure, detail: impl Into<String>) -> Self {
        Self::Modbus { reason, detail: detail.into() }
    }

    pub fn mqtt(reason: MqttFailure, detail: impl Into<String>) -> Self {
        Self::Mqtt { reason, detail: detail.into() }
    }

    /// Whether another attempt may succeed without operator intervention.
    pub fn is_transient(&self) -> bool {
        match self {
            SinkError::Persistence { reason, .. } => {
                !matches!(reason, PersistenceFailure::ConstraintViolation)
            }
            SinkError::Modbus { reason, .. } => !matches!(reason, ModbusFailure::IllegalAddress),
            SinkError::Mqtt { reason, .. } => !matches!(reason, MqttFailure::AuthRejected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_sink_failures_are_not_retried() {
        assert!(!SinkError::modbus(ModbusFailure::IllegalAddress, "x").is_transient());
        assert!(!SinkError::mqtt(MqttFailure::AuthRejected, "x").is_transient());
        assert!(!SinkError::persistence(PersistenceFailure::ConstraintViolation, "x").is_transient());
        assert!(SinkError::modbus(ModbusFailure::ConnectTimeout, "x").is_transient());
        assert!(SinkError::mqtt(MqttFailure::PublishTimeout, "x").is_transient());
    }

    #[test]
    fn configuration_error_converts_to_invalid_input() {
        let err: DomainError = ConfigurationError::new("roi", "outside frame").into();
        assert!(matches!(err, DomainError::InvalidInput(_)));
        assert_eq!(err.to_string(), "invalid configuration for roi: outside frame");
    }
}
