//! Reconciliation of payments against purchase sessions.
//!
//! [`Engine`] is the explicitly-owned service state behind the three boundary operations:
//! intake ([`Engine::create_session`]), confirmation ingestion
//! ([`Engine::ingest_confirmation`]) and voucher lookup ([`Engine::get_voucher`]). It is
//! shared by reference (`Arc<Engine>`) between the HTTP handlers and the expiry sweeper.

use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, instrument};

use crate::device::ConnectionState;
use crate::notification::{Confirmation, ConfirmationParser, ParseError};
use crate::offer::{OfferCatalog, ProfileName};
use crate::phone::PhoneNumber;
use crate::session::{PurchaseSession, Reference, SessionId, SessionRegistry};
use crate::voucher::{Voucher, VoucherIssuer, VoucherStore};

/// Intake validation failures. Surfaced to the caller, never retried.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Missing field: {0}")]
    MissingField(&'static str),
    #[error("Invalid phone number: {0:?}")]
    InvalidPhone(String),
    #[error("Amount must be a positive whole number")]
    InvalidAmount,
    #[error("Unknown offer: {0}")]
    UnknownOffer(String),
}

/// What happened to one confirmation. Never reported to the confirmation source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// Not from the provider, or the amount or phone could not be read.
    Rejected(ParseError),
    /// No `Pending` session has this amount and phone.
    Unmatched,
    /// The session's offer no longer maps to a profile; the session was discarded.
    UnmappedOffer(SessionId),
    Issued(SessionId),
    /// The device could not create the user; the session was discarded.
    IssueFailed(SessionId),
}

pub struct Engine {
    registry: Arc<SessionRegistry>,
    vouchers: Arc<VoucherStore>,
    parser: ConfirmationParser,
    catalog: OfferCatalog,
    issuer: VoucherIssuer,
    issuances: TaskTracker,
}

impl Engine {
    pub fn new(catalog: OfferCatalog, parser: ConfirmationParser, issuer: VoucherIssuer) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            vouchers: Arc::new(VoucherStore::new()),
            parser,
            catalog,
            issuer,
            issuances: TaskTracker::new(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn device_state(&self) -> ConnectionState {
        self.issuer.device().state().await
    }

    /// Registers a purchase intent.
    #[instrument(skip_all, err, fields(amount = amount, offer = %offer))]
    pub async fn create_session(
        &self,
        phone: &str,
        amount: u64,
        offer: &str,
    ) -> Result<(SessionId, Reference), SessionError> {
        if phone.trim().is_empty() {
            return Err(SessionError::MissingField("phone"));
        }
        let normalized =
            PhoneNumber::normalize(phone).map_err(|_| SessionError::InvalidPhone(phone.to_string()))?;
        if amount == 0 {
            return Err(SessionError::InvalidAmount);
        }
        let (offer, _profile) = self
            .catalog
            .lookup(offer)
            .ok_or_else(|| SessionError::UnknownOffer(offer.to_string()))?;
        let (session_id, reference) = self
            .registry
            .create(normalized, amount, offer.clone())
            .await;
        tracing::info!(%session_id, %reference, "Session created");
        Ok((session_id, reference))
    }

    /// Reconciles one inbound confirmation.
    ///
    /// Every failure is absorbed here; the outcome is only returned for observability.
    /// Once a session is claimed, issuance runs on its own task: dropping the returned
    /// future does not cancel it, and the claimed session is always removed.
    #[instrument(skip_all, fields(sender = %confirmation.sender))]
    pub async fn ingest_confirmation(&self, confirmation: &Confirmation) -> Reconciliation {
        let parsed = match self.parser.parse(confirmation) {
            Ok(parsed) => parsed,
            Err(error) => {
                tracing::debug!(%error, "Confirmation ignored");
                return Reconciliation::Rejected(error);
            }
        };
        let Some(session) = self
            .registry
            .claim_pending_match(parsed.amount, &parsed.phone)
            .await
        else {
            tracing::info!(amount = parsed.amount, phone = %parsed.phone, "No pending session matches confirmation");
            return Reconciliation::Unmatched;
        };
        let session_id = session.id.clone();
        tracing::info!(%session_id, amount = session.amount, "Confirmation matched session");

        let profile = self.catalog.profile(&session.offer).cloned();
        let issuance = self.issuances.spawn(settle(
            session,
            profile,
            self.issuer.clone(),
            Arc::clone(&self.vouchers),
            Arc::clone(&self.registry),
        )
        .in_current_span());
        match issuance.await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(%session_id, %error, "Issuance task failed");
                self.registry.confirm_and_remove(&session_id).await;
                Reconciliation::IssueFailed(session_id)
            }
        }
    }

    /// Waits for in-flight issuances. Call once confirmations are no longer accepted.
    pub async fn drain(&self) {
        self.issuances.close();
        self.issuances.wait().await;
    }

    /// Pure read; safe to poll.
    pub fn get_voucher(&self, session_id: &SessionId) -> Option<Voucher> {
        self.vouchers.get(session_id)
    }
}

/// Issues the voucher for a claimed session, then removes the session.
async fn settle(
    session: PurchaseSession,
    profile: Option<ProfileName>,
    issuer: VoucherIssuer,
    vouchers: Arc<VoucherStore>,
    registry: Arc<SessionRegistry>,
) -> Reconciliation {
    let session_id = session.id.clone();
    let outcome = match profile {
        None => {
            tracing::warn!(%session_id, offer = %session.offer, "Offer has no profile, dropping session");
            Reconciliation::UnmappedOffer(session_id.clone())
        }
        Some(profile) => match issuer.issue(&profile).await {
            Ok(voucher) => {
                vouchers.insert(session_id.clone(), voucher);
                tracing::info!(%session_id, "Voucher issued");
                Reconciliation::Issued(session_id.clone())
            }
            Err(error) => {
                tracing::error!(%session_id, %error, "Voucher issuance failed");
                Reconciliation::IssueFailed(session_id.clone())
            }
        },
    };
    registry.confirm_and_remove(&session_id).await;
    outcome
}
