//! Stateless checks on decoded messages.
//!
//! These run after signature verification and before the reducer sees a
//! message. They cover everything that can be judged from the message
//! alone:
//! - Payload size and format limits
//! - Timestamp sanity against the receiver clock
//! - Delegation proof shape
//!
//! Reference checks need reducer state and happen in the gap detector.

use crate::forum::constants::{MAX_ADDRESS_SIZE, MAX_CLOCK_SKEW_MS, MIN_VALID_TIMESTAMP_MS};
use crate::forum::message::SignedMessage;
use crate::forum::payload::Payload;
use crate::forum::types::ModerationTarget;

/// Result of validation containing detailed information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    /// Whether the message is valid.
    pub is_valid: bool,
    /// Validation errors, if any.
    pub errors: Vec<String>,
}

impl ValidationResult {
    /// Creates a successful validation result.
    pub fn ok() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
        }
    }

    /// Creates a failed validation result with errors.
    pub fn err(errors: Vec<String>) -> Self {
        Self {
            is_valid: false,
            errors,
        }
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, error: String) {
        self.is_valid = false;
        self.errors.push(error);
    }

    /// Joins all errors into one line.
    pub fn summary(&self) -> String {
        self.errors.join("; ")
    }
}

/// Checks a timestamp against the receiver clock.
pub fn validate_timestamp(timestamp: u64, now_ms: u64, result: &mut ValidationResult) {
    if timestamp < MIN_VALID_TIMESTAMP_MS {
        result.add_error("Timestamp is unreasonably old or invalid".to_string());
    }
    if timestamp > now_ms.saturating_add(MAX_CLOCK_SKEW_MS) {
        result.add_error(format!(
            "Timestamp is {} ms in the future (max skew {})",
            timestamp - now_ms,
            MAX_CLOCK_SKEW_MS
        ));
    }
}

/// Validates a decoded message.
///
/// `now_ms` is the receiver's clock.
pub fn validate_message(message: &SignedMessage, now_ms: u64) -> ValidationResult {
    let mut result = ValidationResult::ok();

    validate_timestamp(message.timestamp(), now_ms, &mut result);

    if let Err(e) = message.payload().validate() {
        result.add_error(e.to_string());
    }

    if let Payload::Moderate(moderate) = message.payload() {
        if let ModerationTarget::User { address, .. } = &moderate.target {
            if address.as_str().len() > MAX_ADDRESS_SIZE {
                result.add_error(format!(
                    "Moderated address too long: {} bytes (max {})",
                    address.as_str().len(),
                    MAX_ADDRESS_SIZE
                ));
            }
        }
    }

    if let Some(proof) = message.delegation_proof() {
        let address = proof.wallet_address.as_str();
        if address.is_empty() || address.len() > MAX_ADDRESS_SIZE {
            result.add_error(format!(
                "Wallet address must be 1..={} bytes, got {}",
                MAX_ADDRESS_SIZE,
                address.len()
            ));
        }
        if proof.wallet_address.is_anonymous() {
            result.add_error("Delegation proof names an anonymous address".to_string());
        }
        if proof.expires_at <= proof.issued_at {
            result.add_error("Delegation window is empty".to_string());
        }
    }

    result
}
