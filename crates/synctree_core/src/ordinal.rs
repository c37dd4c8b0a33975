//! Order-preserving sibling positions.
//!
//! An [`Ordinal`] is a string of radix-256 digits read as a fraction in
//! `[0, 1)`. Because the digit string can always be extended, a new ordinal
//! can be minted strictly between any two existing ones without renumbering
//! anything else. Comparison is plain lexicographic byte comparison.
//!
//! ## Validity
//!
//! A valid ordinal:
//! - is at least [`Ordinal::MIN_LENGTH`] digits long
//! - is not all zero digits (so something can always be placed before it)
//! - has no trailing zero digit past the minimum length (so that
//!   lexicographic order and numeric order agree)
//!
//! ## Legacy integer positions
//!
//! [`Ordinal::from_i64`] embeds a signed 64-bit position into the first eight
//! digits, preserving order. [`Ordinal::to_i64`] reads those digits back and
//! is therefore lossy once an ordinal has been subdivided past them.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An arbitrary-precision, lexicographically ordered position key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ordinal {
    bytes: Vec<u8>,
}

impl Ordinal {
    /// The smallest digit.
    pub const ZERO_DIGIT: u8 = 0x00;
    /// The digit with value one.
    pub const ONE_DIGIT: u8 = 0x01;
    /// The digit halfway through the alphabet.
    pub const MID_DIGIT: u8 = 0x80;
    /// The largest digit.
    pub const MAX_DIGIT: u8 = 0xff;
    /// Number of distinct digits.
    pub const RADIX: u16 = 256;
    /// Minimum number of digits in a valid ordinal.
    pub const MIN_LENGTH: usize = 8;

    const SIGN_BIT: u64 = 0x8000_0000_0000_0000;

    /// Wraps raw digits without validation. Check [`Ordinal::is_valid`].
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Returns the ordinal everyone starts from: `80 00 00 00 00 00 00 00`.
    #[must_use]
    pub fn create_initial() -> Self {
        let mut bytes = vec![Self::ZERO_DIGIT; Self::MIN_LENGTH];
        bytes[0] = Self::MID_DIGIT;
        Self { bytes }
    }

    /// Returns the raw digits.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns true if this ordinal satisfies the validity rules.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        is_valid_ordinal_bytes(&self.bytes)
    }

    /// Compares two possibly-invalid ordinals: equal if both are invalid or
    /// both are valid with the same digits.
    #[must_use]
    pub fn equals_or_both_invalid(&self, other: &Ordinal) -> bool {
        match (self.is_valid(), other.is_valid()) {
            (false, false) => true,
            (true, true) => self.bytes == other.bytes,
            _ => false,
        }
    }

    /// Returns an ordinal strictly between `self` and `other`.
    ///
    /// The argument order does not matter.
    ///
    /// # Errors
    ///
    /// Fails if either ordinal is invalid or the two are equal.
    pub fn create_between(&self, other: &Ordinal) -> CoreResult<Ordinal> {
        self.ensure_valid()?;
        other.ensure_valid()?;
        if self == other {
            return Err(CoreError::invalid_operation(
                "cannot create an ordinal between two equal ordinals",
            ));
        }
        let (start, end) = if self < other {
            (self, other)
        } else {
            (other, self)
        };
        Ok(create_ordinal_between(&start.bytes, &end.bytes))
    }

    /// Returns an ordinal strictly less than `self`.
    ///
    /// # Errors
    ///
    /// Fails if `self` is invalid.
    pub fn create_before(&self) -> CoreResult<Ordinal> {
        self.ensure_valid()?;
        // Smallest valid ordinal of our length. We don't return it directly,
        // since that would leave no room to insert in front of it later.
        let length = self.bytes.len();
        let mut start = vec![Self::ZERO_DIGIT; length];
        start[length - 1] = Self::ONE_DIGIT;
        if start == self.bytes {
            start[length - 1] = Self::ZERO_DIGIT;
            start.push(Self::ONE_DIGIT);
        }
        Ok(create_ordinal_between(&start, &self.bytes))
    }

    /// Returns an ordinal strictly greater than `self`.
    ///
    /// # Errors
    ///
    /// Fails if `self` is invalid.
    pub fn create_after(&self) -> CoreResult<Ordinal> {
        self.ensure_valid()?;
        let mut end = vec![Self::MAX_DIGIT; self.bytes.len()];
        if end == self.bytes {
            end.push(Self::MAX_DIGIT);
        }
        Ok(create_ordinal_between(&self.bytes, &end))
    }

    /// Places a new ordinal relative to optional neighbours.
    ///
    /// - no bounds: [`Ordinal::create_initial`]
    /// - only `before`: something after it
    /// - only `after`: something before it
    /// - both: something strictly between
    ///
    /// # Errors
    ///
    /// Fails if a bound is invalid or both bounds are equal.
    pub fn between(before: Option<&Ordinal>, after: Option<&Ordinal>) -> CoreResult<Ordinal> {
        match (before, after) {
            (None, None) => Ok(Self::create_initial()),
            (Some(before), None) => before.create_after(),
            (None, Some(after)) => after.create_before(),
            (Some(before), Some(after)) => before.create_between(after),
        }
    }

    /// Converts a legacy integer position, preserving order.
    #[must_use]
    pub fn from_i64(x: i64) -> Self {
        let y = (x as u64) ^ Self::SIGN_BIT;
        let mut bytes = vec![Self::ZERO_DIGIT; Self::MIN_LENGTH];
        if y == 0 {
            // All zero digits are not a valid ordinal.
            bytes.push(Self::MID_DIGIT);
        } else {
            bytes.copy_from_slice(&y.to_be_bytes());
        }
        Self { bytes }
    }

    /// Converts back to a legacy integer position.
    ///
    /// Only the first [`Ordinal::MIN_LENGTH`] digits are read, so ordinals
    /// that were subdivided past them collapse onto their prefix.
    #[must_use]
    pub fn to_i64(&self) -> i64 {
        let mut prefix = [Self::ZERO_DIGIT; Self::MIN_LENGTH];
        let len = self.bytes.len().min(Self::MIN_LENGTH);
        prefix[..len].copy_from_slice(&self.bytes[..len]);
        (u64::from_be_bytes(prefix) ^ Self::SIGN_BIT) as i64
    }

    /// Renders the digits as lowercase hex.
    #[must_use]
    pub fn to_hex(&self) -> String {
        self.bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Parses digits from hex, as printed by [`Ordinal::to_hex`].
    ///
    /// # Errors
    ///
    /// Fails on odd length or non-hex characters. The result may still be an
    /// invalid ordinal.
    pub fn from_hex(text: &str) -> CoreResult<Self> {
        if !text.is_ascii() || text.len() % 2 != 0 {
            return Err(CoreError::invalid_operation(format!(
                "malformed hex ordinal {text:?}"
            )));
        }
        let bytes = (0..text.len())
            .step_by(2)
            .map(|i| {
                u8::from_str_radix(&text[i..i + 2], 16)
                    .map_err(|_| CoreError::invalid_operation(format!("bad hex digit in {text:?}")))
            })
            .collect::<CoreResult<Vec<u8>>>()?;
        Ok(Self { bytes })
    }

    fn ensure_valid(&self) -> CoreResult<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(CoreError::invalid_operation(format!(
                "invalid ordinal {}",
                self.to_hex()
            )))
        }
    }
}

impl fmt::Debug for Ordinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ordinal({})", self.to_hex())
    }
}

impl fmt::Display for Ordinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

fn is_valid_ordinal_bytes(bytes: &[u8]) -> bool {
    if bytes.len() < Ordinal::MIN_LENGTH {
        return false;
    }
    if bytes.iter().all(|&b| b == Ordinal::ZERO_DIGIT) {
        return false;
    }
    if bytes.len() > Ordinal::MIN_LENGTH && bytes.last() == Some(&Ordinal::ZERO_DIGIT) {
        return false;
    }
    true
}

fn digit_value(bytes: &[u8], i: usize) -> u16 {
    bytes.get(i).copied().map_or(0, u16::from)
}

/// Adds `value` at position `i`, carrying leftwards. Returns false on
/// overflow past the first digit.
fn add_digit_value(bytes: &mut [u8], i: usize, value: u16) -> bool {
    let mut carry = value;
    let mut j = i + 1;
    while j > 0 && carry > 0 {
        j -= 1;
        let sum = u16::from(bytes[j]) + carry;
        bytes[j] = (sum % Ordinal::RADIX) as u8;
        carry = sum / Ordinal::RADIX;
    }
    carry == 0
}

/// Computes `(start + end) / 2` left to right with a forward carry that is
/// either zero or half the radix. One extra digit always suffices.
fn compute_midpoint(start: &[u8], end: &[u8]) -> Vec<u8> {
    let max_size = start.len().max(end.len()) + 1;
    let mut midpoint = vec![Ordinal::ZERO_DIGIT; max_size];
    let mut forward_carry = 0u16;
    for i in 0..max_size {
        let sum = digit_value(start, i) + digit_value(end, i);
        let value = sum / 2 + forward_carry;
        let no_overflow = add_digit_value(&mut midpoint, i, value);
        debug_assert!(no_overflow, "midpoint overflowed");
        forward_carry = if sum % 2 == 1 {
            Ordinal::RADIX / 2
        } else {
            0
        };
    }
    debug_assert_eq!(forward_carry, 0);
    midpoint
}

/// `start` must be strictly less than `end`.
fn create_ordinal_between(start: &[u8], end: &[u8]) -> Ordinal {
    let mut midpoint = compute_midpoint(start, end);
    let significant = midpoint
        .iter()
        .rposition(|&b| b != Ordinal::ZERO_DIGIT)
        .map_or(0, |pos| pos + 1);
    midpoint.truncate(significant.max(Ordinal::MIN_LENGTH));
    let ordinal = Ordinal { bytes: midpoint };
    debug_assert!(ordinal.is_valid());
    ordinal
}
