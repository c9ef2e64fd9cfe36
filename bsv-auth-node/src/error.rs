//! Error handling for the transport bridge.
//!
//! Every error except [`Error::Configuration`] is caught at the coordinator
//! boundary and rendered as the JSON error body
//! `{"status": "error", "code": ..., "description": ...}` with the status code
//! returned by [`Error::status_code`].

use bytes::Bytes;
use http::{header, Response, StatusCode};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures to match a `send` with its pending request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    /// Nothing is waiting under this key, or it was already resolved.
    #[error("No open handle for {0}")]
    NoOpenHandle(String),

    /// A general request id is already in flight.
    #[error("Duplicate correlation id {0}")]
    DuplicateCorrelationId(String),
}

/// Payment verification failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaymentError {
    #[error("Malformed payment envelope: {0}")]
    MalformedPayment(String),

    #[error("Invalid payment nonce: {0}")]
    InvalidNonce(String),

    #[error("Derivation prefix mismatch: expected {expected}, got {actual}")]
    InvalidDerivationPrefix { expected: String, actual: String },

    #[error("Payment rejected: {0}")]
    Rejected(String),

    /// Wallet or price function failure.
    #[error("Payment processing failed: {0}")]
    Internal(String),
}

/// Error types for the transport bridge.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing wallet, price function or other startup requirement.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Framing or header layout violation.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Correlation error: {0}")]
    Correlation(#[from] CorrelationError),

    /// Handshake or signature verification failed, or no session.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// A priced resource was requested without an authenticated identity.
    #[error("Authentication required: {0}")]
    AuthenticationRequired(String),

    /// Certificate exchange ended without acceptable certificates.
    #[error("Missing certificates: {0}")]
    MissingCertificates(String),

    #[error("Payment error: {0}")]
    Payment(#[from] PaymentError),

    /// Unexpected failure in a collaborator.
    #[error("Internal error: {0}")]
    Internal(String),

    /// A pending handle or wait outlived its time-to-live.
    #[error("Timed out: {0}")]
    Timeout(String),
}

/// Error severity for logging and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Client mistakes (malformed input, failed payment)
    Info,
    /// Authentication failures and timeouts
    Warning,
    /// Protocol bugs and server failures
    Critical,
}

/// Machine-readable error codes carried in the `code` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ServerMisconfigured,
    InvalidAuth,
    NoOpenHandle,
    DuplicateRequestId,
    Unauthorized,
    AuthenticationRequired,
    MissingCertificates,
    MalformedPayment,
    InvalidPayment,
    InvalidDerivationPrefix,
    PaymentRequired,
    PaymentRejected,
    PaymentInternal,
    Internal,
    Timeout,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ServerMisconfigured => "ERR_SERVER_MISCONFIGURED",
            ErrorCode::InvalidAuth => "ERR_INVALID_AUTH",
            ErrorCode::NoOpenHandle => "ERR_NO_OPEN_HANDLE",
            ErrorCode::DuplicateRequestId => "ERR_DUPLICATE_REQUEST_ID",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::AuthenticationRequired => "ERR_AUTHENTICATION_REQUIRED",
            ErrorCode::MissingCertificates => "ERR_MISSING_CERTIFICATES",
            ErrorCode::MalformedPayment => "ERR_MALFORMED_PAYMENT",
            ErrorCode::InvalidPayment => "ERR_INVALID_PAYMENT",
            ErrorCode::InvalidDerivationPrefix => "ERR_INVALID_DERIVATION_PREFIX",
            ErrorCode::PaymentRequired => "ERR_PAYMENT_REQUIRED",
            ErrorCode::PaymentRejected => "ERR_PAYMENT_REJECTED",
            ErrorCode::PaymentInternal => "ERR_PAYMENT_INTERNAL",
            ErrorCode::Internal => "ERR_INTERNAL",
            ErrorCode::Timeout => "ERR_TIMEOUT",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Configuration(_) => ErrorCode::ServerMisconfigured,
            Error::MalformedMessage(_) => ErrorCode::InvalidAuth,
            Error::Correlation(CorrelationError::NoOpenHandle(_)) => ErrorCode::NoOpenHandle,
            Error::Correlation(CorrelationError::DuplicateCorrelationId(_)) => {
                ErrorCode::DuplicateRequestId
            }
            Error::Authentication(_) => ErrorCode::Unauthorized,
            Error::AuthenticationRequired(_) => ErrorCode::AuthenticationRequired,
            Error::MissingCertificates(_) => ErrorCode::MissingCertificates,
            Error::Payment(PaymentError::MalformedPayment(_)) => ErrorCode::MalformedPayment,
            Error::Payment(PaymentError::InvalidNonce(_)) => ErrorCode::InvalidPayment,
            Error::Payment(PaymentError::InvalidDerivationPrefix { .. }) => {
                ErrorCode::InvalidDerivationPrefix
            }
            Error::Payment(PaymentError::Rejected(_)) => ErrorCode::PaymentRejected,
            Error::Payment(PaymentError::Internal(_)) => ErrorCode::PaymentInternal,
            Error::Internal(_) => ErrorCode::Internal,
            Error::Timeout(_) => ErrorCode::Timeout,
        }
    }

    /// Returns the HTTP status code that should be used for this error.
    pub fn status_code(&self) -> StatusCode {
        match self.code() {
            ErrorCode::InvalidAuth
            | ErrorCode::DuplicateRequestId
            | ErrorCode::MissingCertificates
            | ErrorCode::MalformedPayment
            | ErrorCode::InvalidPayment
            | ErrorCode::InvalidDerivationPrefix => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized | ErrorCode::AuthenticationRequired => {
                StatusCode::UNAUTHORIZED
            }
            ErrorCode::PaymentRequired | ErrorCode::PaymentRejected => {
                StatusCode::PAYMENT_REQUIRED
            }
            ErrorCode::ServerMisconfigured
            | ErrorCode::NoOpenHandle
            | ErrorCode::PaymentInternal
            | ErrorCode::Internal
            | ErrorCode::Timeout => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the severity level of this error.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Error::MalformedMessage(_)
            | Error::MissingCertificates(_)
            | Error::AuthenticationRequired(_) => ErrorSeverity::Info,
            Error::Payment(PaymentError::Internal(_)) => ErrorSeverity::Critical,
            Error::Payment(_) => ErrorSeverity::Info,
            Error::Authentication(_) | Error::Timeout(_) => ErrorSeverity::Warning,
            Error::Configuration(_) | Error::Correlation(_) | Error::Internal(_) => {
                ErrorSeverity::Critical
            }
        }
    }

    /// Human-readable description for the error body.
    pub fn description(&self) -> String {
        match self {
            Error::Authentication(_) => "Mutual-authentication failed!".to_string(),
            Error::MissingCertificates(_) => "No certificates provided".to_string(),
            other => other.to_string(),
        }
    }

    /// JSON error body for this error.
    pub fn to_body(&self) -> Value {
        error_body(self.code(), &self.description(), Map::new())
    }

    /// Creates an error response for this error.
    pub fn to_response(&self) -> Response<Bytes> {
        json_response(self.status_code(), &self.to_body())
    }
}

/// Build `{"status":"error","code":..,"description":..}` plus extra fields.
pub fn error_body(code: ErrorCode, description: &str, extra: Map<String, Value>) -> Value {
    let mut body = Map::new();
    body.insert("status".to_string(), json!("error"));
    body.insert("code".to_string(), json!(code.as_str()));
    body.insert("description".to_string(), json!(description));
    body.extend(extra);
    Value::Object(body)
}

/// Serialize a JSON value into a response with the given status.
pub fn json_response(status: StatusCode, body: &Value) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

impl From<bsv_auth_msg::Error> for Error {
    fn from(err: bsv_auth_msg::Error) -> Self {
        Error::MalformedMessage(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::MalformedMessage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = Error::Configuration("wallet is required".to_string());
        assert_eq!(error.to_string(), "Configuration error: wallet is required");

        let error = Error::from(CorrelationError::NoOpenHandle("abc".to_string()));
        assert_eq!(error.to_string(), "Correlation error: No open handle for abc");
    }

    #[test]
    fn test_status_and_codes() {
        let cases = [
            (
                Error::MalformedMessage("x".into()),
                "ERR_INVALID_AUTH",
                StatusCode::BAD_REQUEST,
            ),
            (
                Error::Authentication("x".into()),
                "UNAUTHORIZED",
                StatusCode::UNAUTHORIZED,
            ),
            (
                Error::Payment(PaymentError::InvalidDerivationPrefix {
                    expected: "a".into(),
                    actual: "b".into(),
                }),
                "ERR_INVALID_DERIVATION_PREFIX",
                StatusCode::BAD_REQUEST,
            ),
            (
                Error::Payment(PaymentError::Rejected("x".into())),
                "ERR_PAYMENT_REJECTED",
                StatusCode::PAYMENT_REQUIRED,
            ),
            (
                Error::Correlation(CorrelationError::DuplicateCorrelationId("k".into())),
                "ERR_DUPLICATE_REQUEST_ID",
                StatusCode::BAD_REQUEST,
            ),
            (
                Error::Timeout("x".into()),
                "ERR_TIMEOUT",
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, code, status) in cases {
            assert_eq!(error.code().as_str(), code);
            assert_eq!(error.status_code(), status);
        }
    }

    #[test]
    fn test_correlation_errors_are_critical() {
        let error = Error::from(CorrelationError::NoOpenHandle("k".into()));
        assert_eq!(error.severity(), ErrorSeverity::Critical);
        assert_eq!(
            Error::Payment(PaymentError::InvalidNonce("n".into())).severity(),
            ErrorSeverity::Info
        );
    }

    #[test]
    fn test_error_body_shape() {
        let mut extra = Map::new();
        extra.insert("satoshisRequired".to_string(), json!(100));
        let body = error_body(ErrorCode::PaymentRequired, "pay", extra);
        assert_eq!(body["status"], "error");
        assert_eq!(body["code"], "ERR_PAYMENT_REQUIRED");
        assert_eq!(body["description"], "pay");
        assert_eq!(body["satoshisRequired"], 100);

        let response = Error::Authentication("bad signature".into()).to_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["description"], "Mutual-authentication failed!");
    }
}
