//! Error types and stable denial codes for the permission gate

use thiserror::Error;

/// Stable denial codes carried on the wire.
///
/// Every code here is a contract with callers: the constants never change
/// once published, and new failures get new codes.
pub mod codes {
    // Credential presence / integrity
    pub const PASSPORT_MISSING: &str = "passport_missing";
    pub const INVALID_SIGNATURE: &str = "invalid_signature";
    pub const PASSPORT_EXPIRED: &str = "passport_expired";
    pub const PASSPORT_REVOKED: &str = "passport_revoked";
    pub const ISSUER_NOT_ALLOWED: &str = "issuer_not_allowed";

    // Catalog
    pub const CATALOG_VERSION_DEPRECATED: &str = "catalog_version_deprecated";
    pub const CATALOG_VERSION_UNKNOWN: &str = "catalog_version_unknown";

    // Authorization
    pub const PERMISSION_DENIED: &str = "permission_denied";
    pub const CONSTRAINT_VIOLATED: &str = "constraint_violated";
    pub const APPROVAL_REQUIRED: &str = "approval_required";
    pub const RATE_LIMITED: &str = "rate_limited";

    // Session
    pub const SESSION_INVALID: &str = "session_invalid";

    // Integrity safety rails
    pub const ANTI_DOWNGRADE: &str = "anti_downgrade";

    // Normalizer
    pub const INVALID_NUMERIC: &str = "invalid_numeric";
    pub const PRECISION_EXCEEDED: &str = "precision_exceeded";
    pub const OVERFLOW: &str = "overflow";
    pub const CONSTRAINT_TYPE_ERROR: &str = "constraint_type_error";

    // Receipt verification
    pub const NONCE_MISMATCH: &str = "nonce_mismatch";
    pub const COST_MISMATCH: &str = "cost_mismatch";
    pub const PLATFORM_FEE_MISMATCH: &str = "platform_fee_mismatch";
    pub const SIGNATURE_MISMATCH: &str = "signature_mismatch";
}

/// Human-readable text for a denial code.
///
/// Unknown codes fall back to a generic line so a response is never empty.
pub fn human_message(code: &str) -> &'static str {
    match code {
        codes::PASSPORT_MISSING => "No passport was presented for this action",
        codes::INVALID_SIGNATURE => "Passport signature verification failed",
        codes::PASSPORT_EXPIRED => "Passport has expired",
        codes::PASSPORT_REVOKED => "Passport has been revoked",
        codes::ISSUER_NOT_ALLOWED => "Passport issuer is not trusted by this gate",
        codes::CATALOG_VERSION_DEPRECATED => {
            "Passport pins a catalog version below the minimum compatible version"
        }
        codes::CATALOG_VERSION_UNKNOWN => "No catalog is available to authorize this action",
        codes::PERMISSION_DENIED => "Permission denied for this action",
        codes::CONSTRAINT_VIOLATED => "A declared constraint forbids this action",
        codes::APPROVAL_REQUIRED => "This action requires approval before it can proceed",
        codes::RATE_LIMITED => "Rate limit exceeded for this action",
        codes::SESSION_INVALID => "Session is unknown or no longer valid",
        codes::ANTI_DOWNGRADE => "A presented passport failed; anonymous fallback is not permitted",
        codes::INVALID_NUMERIC => "Value is not a valid decimal number",
        codes::PRECISION_EXCEEDED => "Value has more fractional digits than permitted",
        codes::OVERFLOW => "Value is outside the safe integer range",
        codes::CONSTRAINT_TYPE_ERROR => "Constraint value has the wrong type",
        codes::NONCE_MISMATCH => "Receipt nonce does not match the expected nonce",
        codes::COST_MISMATCH => "Receipt cost does not match its pricing snapshot",
        codes::PLATFORM_FEE_MISMATCH => "Receipt platform fee does not match its pricing snapshot",
        codes::SIGNATURE_MISMATCH => "Receipt signature verification failed",
        _ => "Request denied",
    }
}

#[derive(Error, Debug)]
pub enum GateError {
    #[error("Invalid numeric value: {0}")]
    InvalidNumeric(String),

    #[error("Precision exceeded: {digits} fractional digits, max {precision}")]
    PrecisionExceeded { digits: usize, precision: u32 },

    #[error("Value outside safe integer range")]
    Overflow,

    #[error("Constraint type error: {0}")]
    ConstraintTypeError(String),

    #[error("Invalid passport: {0}")]
    InvalidPassport(String),

    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("Invalid signature encoding: {0}")]
    InvalidSignatureEncoding(String),

    #[error("Signature verification failed")]
    SignatureInvalid,

    #[error("Unknown issuer: {0}")]
    UnknownIssuer(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid session: {0}")]
    SessionInvalid(String),

    #[error("Mixed receipts: {0}")]
    MixedReceipts(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Handler error: {0}")]
    Handler(String),
}

impl GateError {
    /// The stable denial code this error maps to on the wire, if any.
    pub fn denial_code(&self) -> Option<&'static str> {
        match self {
            GateError::InvalidNumeric(_) => Some(codes::INVALID_NUMERIC),
            GateError::PrecisionExceeded { .. } => Some(codes::PRECISION_EXCEEDED),
            GateError::Overflow => Some(codes::OVERFLOW),
            GateError::ConstraintTypeError(_) => Some(codes::CONSTRAINT_TYPE_ERROR),
            GateError::SignatureInvalid => Some(codes::INVALID_SIGNATURE),
            GateError::UnknownIssuer(_) => Some(codes::ISSUER_NOT_ALLOWED),
            GateError::SessionInvalid(_) => Some(codes::SESSION_INVALID),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for GateError {
    fn from(e: serde_json::Error) -> Self {
        GateError::SerializationError(e.to_string())
    }
}

impl From<reqwest::Error> for GateError {
    fn from(e: reqwest::Error) -> Self {
        GateError::Upstream(e.to_string())
    }
}
