//! Purchase intents awaiting a payment confirmation.
//!
//! A [`PurchaseSession`] is created `Pending` by intake, flips to `Confirmed` when a
//! confirmation is reconciled against it, and is dropped from the [`SessionRegistry`]
//! right after the voucher attempt. Sessions that never get confirmed are evicted by the
//! expiry sweeper.

mod registry;

pub use registry::*;

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use tokio::time::Instant;

use crate::offer::OfferCode;
use crate::phone::PhoneNumber;

/// Opaque session identifier: 128 random bits, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn random() -> Self {
        Self(hex::encode(rand::random::<[u8; 16]>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Short code shown to the purchaser for manual reconciliation, e.g. `AB12CD`.
///
/// Unrelated to [`SessionId`] and not guaranteed unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reference(String);

impl Reference {
    pub const LEN: usize = 6;
    const ALPHABET: &'static [u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

    pub fn random() -> Self {
        let mut rng = rand::rng();
        let code = (0..Self::LEN)
            .map(|_| Self::ALPHABET[rng.random_range(0..Self::ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Reference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    Confirmed,
}

/// A purchase intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseSession {
    pub id: SessionId,
    pub phone: PhoneNumber,
    /// Expected payment, in whole currency units.
    pub amount: u64,
    pub offer: OfferCode,
    pub reference: Reference,
    pub status: SessionStatus,
    pub created_at: Instant,
}

impl PurchaseSession {
    pub fn is_pending(&self) -> bool {
        self.status == SessionStatus::Pending
    }

    fn matches(&self, amount: u64, phone: &PhoneNumber) -> bool {
        self.is_pending() && self.amount == amount && &self.phone == phone
    }
}
