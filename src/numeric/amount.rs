// ============================================================================
// Amount
// Exact signed decimal for prices, quantities, fees and fiat totals
// ============================================================================

use super::errors::{NumericError, NumericResult};
use rust_decimal::Decimal;
use std::fmt;
use std::ops::Neg;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Exact signed decimal quantity.
///
/// Backed by a 96-bit mantissa with up to 28 fractional digits. Every
/// arithmetic operation is checked: overflow is reported as an error and a
/// product that cannot be represented exactly fails with
/// [`NumericError::PrecisionLoss`] instead of being rounded.
///
/// # Example
/// ```
/// use peer_exchange::numeric::Amount;
///
/// let price: Amount = "101.25".parse().unwrap();
/// let qty = Amount::from_integer(4);
/// assert_eq!(price.checked_mul(qty).unwrap(), Amount::from_integer(405));
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct Amount(Decimal);

impl Amount {
    /// Zero value
    pub const ZERO: Self = Self(Decimal::ZERO);

    /// One (1)
    pub const ONE: Self = Self(Decimal::ONE);

    /// Largest supported number of fractional digits.
    pub const MAX_SCALE: u32 = 28;

    // ========================================================================
    // Construction
    // ========================================================================

    /// Create from an integer value.
    #[inline]
    pub fn from_integer(value: i64) -> Self {
        Self(Decimal::from(value))
    }

    /// Create from a mantissa and a number of fractional digits.
    ///
    /// `Amount::new(12345, 2)` is `123.45`.
    ///
    /// # Errors
    /// Returns `InvalidInput` if `scale` exceeds [`Amount::MAX_SCALE`].
    pub fn new(mantissa: i64, scale: u32) -> NumericResult<Self> {
        Decimal::try_new(mantissa, scale)
            .map(Self)
            .map_err(|_| NumericError::InvalidInput)
    }

    /// Wrap an existing decimal.
    #[inline]
    pub const fn from_decimal(value: Decimal) -> Self {
        Self(value)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Get the underlying decimal.
    #[inline]
    pub const fn as_decimal(&self) -> Decimal {
        self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Strictly greater than zero.
    #[inline]
    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    /// Strictly less than zero.
    #[inline]
    pub fn is_negative(&self) -> bool {
        self.0 < Decimal::ZERO
    }

    /// Number of fractional digits currently carried.
    #[inline]
    pub fn scale(&self) -> u32 {
        self.0.scale()
    }

    // ========================================================================
    // Arithmetic Operations
    // ========================================================================

    /// Checked addition.
    ///
    /// # Errors
    /// Returns `Overflow` or `Underflow` if the result is out of range.
    pub fn checked_add(self, rhs: Self) -> NumericResult<Self> {
        self.0.checked_add(rhs.0).map(Self).ok_or_else(|| {
            if rhs.is_negative() {
                NumericError::Underflow
            } else {
                NumericError::Overflow
            }
        })
    }

    /// Checked subtraction.
    ///
    /// # Errors
    /// Returns `Overflow` or `Underflow` if the result is out of range.
    pub fn checked_sub(self, rhs: Self) -> NumericResult<Self> {
        self.0.checked_sub(rhs.0).map(Self).ok_or_else(|| {
            if rhs.is_negative() {
                NumericError::Overflow
            } else {
                NumericError::Underflow
            }
        })
    }

    /// Exact multiplication.
    ///
    /// # Errors
    /// Returns `Overflow` when the magnitude is out of range and
    /// `PrecisionLoss` when the exact product needs more than
    /// [`Amount::MAX_SCALE`] fractional digits or more mantissa bits than
    /// are available.
    pub fn checked_mul(self, rhs: Self) -> NumericResult<Self> {
        let lhs = self.0.normalize();
        let rhs = rhs.0.normalize();
        let exact_scale = lhs.scale() + rhs.scale();
        if exact_scale > Self::MAX_SCALE {
            return Err(NumericError::PrecisionLoss);
        }

        let product = lhs.checked_mul(rhs).ok_or(NumericError::Overflow)?;
        // rust_decimal drops fractional digits to make a product fit
        if product.scale() != exact_scale {
            return Err(NumericError::PrecisionLoss);
        }
        Ok(Self(product))
    }

    /// Sum a sequence of amounts, failing on the first overflow.
    pub fn checked_sum<'a, I>(amounts: I) -> NumericResult<Self>
    where
        I: IntoIterator<Item = &'a Amount>,
    {
        amounts
            .into_iter()
            .try_fold(Self::ZERO, |acc, amount| acc.checked_add(*amount))
    }

    #[inline]
    pub fn min(self, other: Self) -> Self {
        std::cmp::min(self, other)
    }

    #[inline]
    pub fn max(self, other: Self) -> Self {
        std::cmp::max(self, other)
    }

    /// Same value with trailing fractional zeros removed.
    #[inline]
    pub fn normalize(self) -> Self {
        Self(self.0.normalize())
    }
}

// ============================================================================
// Trait Implementations
// ============================================================================

impl Neg for Amount {
    type Output = Self;

    #[inline]
    fn neg(self) -> Self::Output {
        Self(-self.0)
    }
}

impl From<i64> for Amount {
    fn from(value: i64) -> Self {
        Self::from_integer(value)
    }
}

impl From<Decimal> for Amount {
    fn from(value: Decimal) -> Self {
        Self(value)
    }
}

impl fmt::Debug for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Amount({})", self.0)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for Amount {
    type Err = NumericError;

    /// Parse a decimal string such as `"-12.5"`.
    ///
    /// Inputs that would need rounding to fit are rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(NumericError::InvalidInput);
        }
        Decimal::from_str_exact(trimmed).map(Self).map_err(|err| {
            match err {
                rust_decimal::Error::ExceedsMaximumPossibleValue => NumericError::Overflow,
                rust_decimal::Error::LessThanMinimumPossibleValue => NumericError::Underflow,
                rust_decimal::Error::Underflow => NumericError::PrecisionLoss,
                _ => NumericError::InvalidInput,
            }
        })
    }
}
