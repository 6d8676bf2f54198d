//! Hotspot access sold for mobile-money payments.
//!
//! A purchaser registers an intent (phone, amount, offer) and pays out of band. The payment
//! provider's confirmation arrives later as a free-text message; the engine parses it,
//! reconciles it against the oldest matching pending intent, and provisions a hotspot user
//! on a RouterOS controller. The purchaser then polls for the credentials.
//!
//! # Modules
//!
//! - [`session`] - purchase intents and the [`SessionRegistry`](session::SessionRegistry).
//! - [`notification`] - parsing of payment confirmations.
//! - [`device`] - the single controller connection and its reconnect state machine;
//!   [`device::routeros`] speaks the RouterOS API.
//! - [`voucher`] - credential generation, issuance with one bounded retry, and the store.
//! - [`engine`] - the service state tying the above together.
//! - [`sweeper`] - eviction of unpaid sessions.
//! - [`handlers`] - HTTP endpoints.
//! - [`config`] - JSON/CLI/env configuration.
//! - [`util`] - telemetry, graceful shutdown, env-resolved config values.
//!
//! All state lives in memory for the lifetime of the process.

pub mod config;
pub mod device;
pub mod engine;
pub mod handlers;
pub mod notification;
pub mod offer;
pub mod phone;
pub mod session;
pub mod sweeper;
pub mod util;
pub mod voucher;
