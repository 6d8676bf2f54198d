//! Subscriber phone number normalization.
//!
//! Intake receives numbers in whatever format the purchaser typed (`"032 12 345 67"`,
//! `"+261 32 12 345 67"`, `"0321234567"`), while confirmations quote them in local format
//! inside parentheses. Both sides are reduced to the last nine digits so that they
//! compare equal regardless of country code or trunk prefix.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Number of trailing digits kept by [`PhoneNumber::normalize`].
pub const SIGNIFICANT_DIGITS: usize = 9;

/// A normalized subscriber number: ASCII digits only, at most [`SIGNIFICANT_DIGITS`] long.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PhoneNumber(String);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PhoneNumberError {
    #[error("Phone number contains no digits")]
    NoDigits,
}

impl PhoneNumber {
    /// Drops every non-digit character and keeps the last nine digits.
    pub fn normalize(input: &str) -> Result<Self, PhoneNumberError> {
        let digits: Vec<char> = input.chars().filter(char::is_ascii_digit).collect();
        if digits.is_empty() {
            return Err(PhoneNumberError::NoDigits);
        }
        let start = digits.len().saturating_sub(SIGNIFICANT_DIGITS);
        Ok(PhoneNumber(digits[start..].iter().collect()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for PhoneNumber {
    type Err = PhoneNumberError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PhoneNumber::normalize(s)
    }
}

impl TryFrom<String> for PhoneNumber {
    type Error = PhoneNumberError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        PhoneNumber::normalize(&value)
    }
}

impl From<PhoneNumber> for String {
    fn from(value: PhoneNumber) -> Self {
        value.0
    }
}

impl Display for PhoneNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
