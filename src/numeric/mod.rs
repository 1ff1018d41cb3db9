// ============================================================================
// Numeric Module
// Exact decimal arithmetic for currency and cryptocurrency quantities
// ============================================================================
//
// This module provides:
// - Amount: exact signed decimal backed by rust_decimal
// - NumericError: Error types for arithmetic operations
//
// Design principles:
// - No floating-point operations
// - All arithmetic returns Result (no panics, no silent rounding)
// - Prices, quantities, fees and fiat totals share one type

mod amount;
mod errors;

pub use amount::Amount;
pub use errors::{NumericError, NumericResult};
