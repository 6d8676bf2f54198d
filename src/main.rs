//! Hotspot voucher HTTP entrypoint.
//!
//! Launches an Axum server that sells hotspot access for mobile-money payments:
//!
//! - `POST /sessions` – register a purchase intent
//! - `POST /confirmations` – ingest a payment notification
//! - `GET /vouchers/{session_id}` – poll for the issued voucher
//! - `GET /health` – liveness and device connection state
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `CONFIG` points at the JSON config file
//! - `HOST`, `PORT`, `ROUTER_*` fill in what the config file leaves out
//! - `OTEL_*` variables enable OpenTelemetry export

use axum::Router;
use axum::http::Method;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors;

use hotspot_voucher::config::Config;
use hotspot_voucher::device::DeviceManager;
use hotspot_voucher::device::routeros::RouterOsConnector;
use hotspot_voucher::engine::Engine;
use hotspot_voucher::handlers;
use hotspot_voucher::sweeper::ExpirySweeper;
use hotspot_voucher::util::{SigDown, Telemetry};
use hotspot_voucher::voucher::{CredentialGenerator, VoucherIssuer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env variables
    dotenv().ok();

    let telemetry = Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    let config = Config::load()?;
    let sig_down = SigDown::try_new()?;

    let device_config = config.device();
    tracing::info!(address = %device_config.address, "Using hotspot controller");
    let device = DeviceManager::with_options(
        RouterOsConnector::new(device_config.routeros()),
        device_config.reconnect_delay(),
        sig_down.cancellation_token(),
    );
    let issuer = VoucherIssuer::new(device.clone(), CredentialGenerator::from_os_rng());
    let engine = Arc::new(Engine::new(
        config.offers().clone(),
        config.confirmation_parser()?,
        issuer,
    ));

    let sweeper = ExpirySweeper::new(Arc::clone(engine.registry()))
        .with_interval(config.expiry().sweep_interval())
        .with_max_age(config.expiry().max_age())
        .spawn(sig_down.cancellation_token());

    // Connect eagerly; a failure here is healed on the first confirmation.
    if let Err(error) = device.ensure_ready().await {
        tracing::warn!(%error, "Hotspot controller not reachable at startup");
    }

    let http_endpoints = Router::new()
        .merge(handlers::routes().with_state(Arc::clone(&engine)))
        .layer(telemetry.http_tracing())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host(), config.port());
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .inspect_err(|e| tracing::error!("Failed to bind to {}: {}", addr, e))?;

    axum::serve(listener, http_endpoints)
        .with_graceful_shutdown(sig_down.shutdown_signal())
        .await?;

    sig_down.recv().await;
    engine.drain().await;
    sweeper.await?;
    device.force_disconnect().await;
    tracing::info!("Server stopped");

    Ok(())
}
