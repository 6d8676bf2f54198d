//! Parsing of inbound payment confirmations.
//!
//! The payment provider confirms a transfer with a free-text message relayed from the
//! merchant's handset, e.g.:
//!
//! ```text
//! sender:  MVOLA
//! message: 1 000 Ar recu de RAKOTO (0321234567) le 12/03/24 a 10:15. Ref: 123456789
//! ```
//!
//! [`ConfirmationParser`] keeps only what reconciliation needs: the amount preceding the
//! currency marker and the phone number between parentheses.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::phone::PhoneNumber;

pub const DEFAULT_SENDER_PATTERN: &str = "(?i)^mvola$";
pub const DEFAULT_CURRENCY_MARKER: &str = "Ar";

static PHONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(\s*(\+?\d[\d ]{5,}\d)\s*\)").expect("valid phone regex"));

/// A notification as delivered by the ingestion transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub sender: String,
    pub message: String,
}

/// The reconciliation key extracted from a [`Confirmation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedConfirmation {
    pub amount: u64,
    pub phone: PhoneNumber,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Sender {0:?} is not the payment provider")]
    UnexpectedSender(String),
    #[error("No amount found in message")]
    MissingAmount,
    #[error("Amount is not a positive whole number: {0}")]
    InvalidAmount(String),
    #[error("No parenthesized phone number found in message")]
    MissingPhone,
}

#[derive(Debug, Clone)]
pub struct ConfirmationParser {
    sender: Regex,
    amount: Regex,
}

impl Default for ConfirmationParser {
    fn default() -> Self {
        Self::new(DEFAULT_SENDER_PATTERN, DEFAULT_CURRENCY_MARKER)
            .expect("default confirmation patterns are valid")
    }
}

impl ConfirmationParser {
    /// Builds a parser accepting senders that match `sender_pattern`, with amounts written
    /// before `currency_marker`.
    ///
    /// Amounts may carry thousands separators (space, dot, comma, no-break spaces):
    /// `1000 Ar`, `1 000 Ar`, `1.000Ar` all read as 1000.
    pub fn new(sender_pattern: &str, currency_marker: &str) -> Result<Self, regex::Error> {
        let sender = Regex::new(sender_pattern)?;
        let amount = Regex::new(&format!(
            r"(\d{{1,3}}(?:[ .,\u{{00A0}}\u{{202F}}]\d{{3}})+|\d+)\s*{}\b",
            regex::escape(currency_marker)
        ))?;
        Ok(Self { sender, amount })
    }

    pub fn parse(&self, confirmation: &Confirmation) -> Result<ParsedConfirmation, ParseError> {
        if !self.sender.is_match(confirmation.sender.trim()) {
            return Err(ParseError::UnexpectedSender(confirmation.sender.clone()));
        }
        let amount = self.parse_amount(&confirmation.message)?;
        let phone = PHONE
            .captures(&confirmation.message)
            .and_then(|captures| captures.get(1))
            .and_then(|raw| PhoneNumber::normalize(raw.as_str()).ok())
            .ok_or(ParseError::MissingPhone)?;
        Ok(ParsedConfirmation { amount, phone })
    }

    fn parse_amount(&self, message: &str) -> Result<u64, ParseError> {
        let raw = self
            .amount
            .captures(message)
            .and_then(|captures| captures.get(1))
            .ok_or(ParseError::MissingAmount)?
            .as_str();
        let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
        match digits.parse::<u64>() {
            Ok(amount) if amount > 0 => Ok(amount),
            _ => Err(ParseError::InvalidAmount(raw.to_string())),
        }
    }
}
