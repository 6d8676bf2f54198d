//! Hotspot credentials and where they are kept once issued.

mod issuer;

pub use issuer::*;

use dashmap::DashMap;
use rand::distr::{Alphanumeric, SampleString};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::Mutex;

use crate::session::SessionId;

/// A device-local login. Carries no purchase data.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voucher {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Voucher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Voucher")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Issued vouchers by session, kept for the lifetime of the process.
///
/// Writes to different sessions do not contend; a second write for the same session
/// replaces the first.
#[derive(Debug, Default)]
pub struct VoucherStore {
    vouchers: DashMap<SessionId, Voucher>,
}

impl VoucherStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session_id: SessionId, voucher: Voucher) {
        self.vouchers.insert(session_id, voucher);
    }

    pub fn get(&self, session_id: &SessionId) -> Option<Voucher> {
        self.vouchers.get(session_id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.vouchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vouchers.is_empty()
    }
}

/// Random credential pairs.
///
/// Usernames are 8 characters from `[a-z0-9]` (about 2.8e12 values) and passwords 8
/// alphanumerics. Nothing checks a new username against ones already on the device; a
/// collision makes the device reject the create command.
pub struct CredentialGenerator {
    rng: Mutex<StdRng>,
}

impl CredentialGenerator {
    pub const USERNAME_LEN: usize = 8;
    pub const PASSWORD_LEN: usize = 8;
    const USERNAME_ALPHABET: &'static [u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

    pub fn from_os_rng() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Deterministic sequence, for tests.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub async fn generate(&self) -> Voucher {
        let mut rng = self.rng.lock().await;
        let username = (0..Self::USERNAME_LEN)
            .map(|_| {
                let index = rng.random_range(0..Self::USERNAME_ALPHABET.len());
                Self::USERNAME_ALPHABET[index] as char
            })
            .collect();
        let password = Alphanumeric.sample_string(&mut *rng, Self::PASSWORD_LEN);
        Voucher { username, password }
    }
}

impl Default for CredentialGenerator {
    fn default() -> Self {
        Self::from_os_rng()
    }
}

impl fmt::Debug for CredentialGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialGenerator").finish_non_exhaustive()
    }
}
