// ============================================================================
// Numeric Errors
// Error types for exact decimal arithmetic
// ============================================================================

use thiserror::Error;

/// Errors that can occur during amount arithmetic.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumericError {
    /// Result exceeded the representable maximum
    #[error("arithmetic overflow: result exceeded maximum value")]
    Overflow,
    /// Result below the representable minimum
    #[error("arithmetic underflow: result below minimum value")]
    Underflow,
    /// The exact result would need more digits than can be stored
    #[error("precision loss: exact result cannot be represented")]
    PrecisionLoss,
    /// Input string or value is invalid
    #[error("invalid input: could not parse value")]
    InvalidInput,
}

/// Result type alias for numeric operations
pub type NumericResult<T> = Result<T, NumericError>;
