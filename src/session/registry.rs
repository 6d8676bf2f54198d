use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{PurchaseSession, Reference, SessionId, SessionStatus};
use crate::offer::OfferCode;
use crate::phone::PhoneNumber;

/// In-memory registry of purchase sessions.
///
/// Every read-modify-write sequence (match then confirm, sweep, removal) runs under a
/// single lock, so a session is consumed by at most one of: a confirmation, or the
/// sweeper. Whoever takes the lock first wins; the other sees the entry gone or no
/// longer `Pending`.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    sessions: HashMap<SessionId, Slot>,
    /// Creation order; breaks ties between sessions created at the same instant.
    next_seq: u64,
}

#[derive(Debug)]
struct Slot {
    seq: u64,
    session: PurchaseSession,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new `Pending` session and returns its identifiers.
    pub async fn create(
        &self,
        phone: PhoneNumber,
        amount: u64,
        offer: OfferCode,
    ) -> (SessionId, Reference) {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let reference = Reference::random();
        let mut id = SessionId::random();
        while inner.sessions.contains_key(&id) {
            id = SessionId::random();
        }
        let session = PurchaseSession {
            id: id.clone(),
            phone,
            amount,
            offer,
            reference: reference.clone(),
            status: SessionStatus::Pending,
            created_at: Instant::now(),
        };
        inner.sessions.insert(id.clone(), Slot { seq, session });
        (id, reference)
    }

    pub async fn get(&self, id: &SessionId) -> Option<PurchaseSession> {
        let inner = self.inner.lock().await;
        inner.sessions.get(id).map(|slot| slot.session.clone())
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Oldest `Pending` session with exactly this amount and phone.
    ///
    /// Read-only: the session is not claimed. Reconciliation goes through
    /// [`SessionRegistry::claim_pending_match`], which selects with the same rule.
    pub async fn find_pending_match(&self, amount: u64, phone: &PhoneNumber) -> Option<SessionId> {
        let inner = self.inner.lock().await;
        inner.oldest_match(amount, phone)
    }

    /// Atomically selects the oldest matching `Pending` session and marks it `Confirmed`.
    ///
    /// The session stays registered (and invisible to matching and sweeping) until
    /// [`SessionRegistry::confirm_and_remove`] drops it.
    pub async fn claim_pending_match(
        &self,
        amount: u64,
        phone: &PhoneNumber,
    ) -> Option<PurchaseSession> {
        let mut inner = self.inner.lock().await;
        let id = inner.oldest_match(amount, phone)?;
        let slot = inner.sessions.get_mut(&id)?;
        slot.session.status = SessionStatus::Confirmed;
        Some(slot.session.clone())
    }

    /// Removes a session, returning it in the `Confirmed` state.
    pub async fn confirm_and_remove(&self, id: &SessionId) -> Option<PurchaseSession> {
        let mut inner = self.inner.lock().await;
        let mut session = inner.sessions.remove(id)?.session;
        session.status = SessionStatus::Confirmed;
        Some(session)
    }

    /// Evicts every `Pending` session older than `max_age`; returns how many were removed.
    pub async fn remove_if_older_than(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let before = inner.sessions.len();
        inner.sessions.retain(|_, slot| {
            !(slot.session.is_pending()
                && now.saturating_duration_since(slot.session.created_at) > max_age)
        });
        before - inner.sessions.len()
    }
}

impl RegistryInner {
    fn oldest_match(&self, amount: u64, phone: &PhoneNumber) -> Option<SessionId> {
        self.sessions
            .values()
            .filter(|slot| slot.session.matches(amount, phone))
            .min_by_key(|slot| (slot.session.created_at, slot.seq))
            .map(|slot| slot.session.id.clone())
    }
}
