//! Coordinating-station daemon.
//!
//! Runs the station side of the OTA protocol on a radio modem and exposes the
//! sessions over a small HTTP API.
//!
//! # HTTP API Routes
//!
//! ## List All Sessions
//! `GET /`
//!
//! Returns every live session as a JSON array, ordered by address.
//!
//! ## Get Session Details
//! `GET /{address}`
//!
//! ## Request Test
//! `POST /{address}/test`
//!
//! The request body is the test configuration as `configId.role.startTime`,
//! with the start time in Unix epoch seconds.
//!
//! ## Cancel Test
//! `POST /{address}/cancel`
//!
//! Sends `CANC` without waiting for the unit to confirm.
//!
//! ## Disconnect
//! `POST /{address}/disconnect`
//!
//! Drops the session locally.
//!
//! # Error Responses
//!
//! - `400 Bad Request`: malformed address or test configuration
//! - `404 Not Found`: no session for the address
//! - `409 Conflict`: the session is not connected or already has a test

use std::{net::SocketAddr, path::PathBuf};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use clap::Parser;
use ota_core::{Address, SessionError, SessionSummary, TestConfig, TestConfigError};
use ota_tokio::{LineTransport, SessionEvent, Settings, Station, StationHandle};
use serde::Serialize;
use tokio::{
    net::{TcpListener, TcpStream},
    select, signal, spawn,
    sync::broadcast::error::RecvError,
    task::JoinSet,
};
use tracing::{debug, error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _};

#[derive(Parser)]
#[command(name = "ota-station")]
#[command(about = "OTA coordinating station with an HTTP control API")]
struct Args {
    /// Settings file
    #[arg(long, short, default_value = "config.yaml")]
    config: PathBuf,

    /// Serial port of the modem, overrides `ota_port`
    #[arg(long)]
    port: Option<String>,

    /// Baud rate, overrides `ota_baudrate`
    #[arg(long)]
    baudrate: Option<u32>,

    /// Talk plain lines to a TCP radio bridge instead of a serial modem
    #[arg(long)]
    connect: Option<String>,

    /// Address the HTTP API listens on
    #[arg(long, default_value = "127.0.0.1:8000")]
    listen: SocketAddr,
}

#[derive(Clone)]
struct AppState {
    station: StationHandle,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("OTA_LOG")
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let mut settings = Settings::load(&args.config)?;
    if let Some(port) = args.port {
        settings.ota_port = port;
    }
    if let Some(baudrate) = args.baudrate {
        settings.ota_baudrate = baudrate;
    }
    let config = settings.config()?;

    let station = Station::new(config.clone());
    let handle = station.handle();
    let tasks = if let Some(bridge) = args.connect {
        info!("connecting to radio bridge at {bridge}");
        let socket = TcpStream::connect(&bridge).await?;
        station.run(LineTransport::new(socket))?
    } else {
        open_modem(station, &settings)?
    };

    spawn(log_events(handle.clone()));
    let daemon = spawn(async move {
        tasks.join_all().await.iter().for_each(|res| {
            if let Err(e) = res {
                error!("station error: {e}");
            }
        });
        info!("station finished");
    });

    let app = router(AppState {
        station: handle.clone(),
    });
    let listener = TcpListener::bind(args.listen).await?;
    info!(address = %config.address, "HTTP API listening on {}", args.listen);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            select! {
                res = signal::ctrl_c() => {
                    if let Err(e) = res {
                        error!("cannot listen for ctrl-c: {e}");
                    }
                    handle.shutdown();
                }
                () = handle.stopped() => {}
            }
        })
        .await?;

    daemon.await?;
    Ok(())
}

#[cfg(feature = "serial")]
fn open_modem(
    station: Station,
    settings: &Settings,
) -> anyhow::Result<JoinSet<anyhow::Result<()>>> {
    let modem = ota_tokio::open_serial(&settings.ota_port, settings.ota_baudrate)?;
    station.run(modem)
}

#[cfg(not(feature = "serial"))]
fn open_modem(
    _station: Station,
    _settings: &Settings,
) -> anyhow::Result<JoinSet<anyhow::Result<()>>> {
    anyhow::bail!("built without the `serial` feature, use --connect")
}

/// Mirrors what the station learns about its units into the log.
async fn log_events(station: StationHandle) {
    let mut events = station.subscribe();
    loop {
        match events.recv().await {
            Ok(SessionEvent::Report { address, report }) => info!(%address, "{report:?}"),
            Ok(SessionEvent::ConnectionStateChanged { address, state }) => {
                info!(%address, "connection {state}");
            }
            Ok(SessionEvent::TestStateChanged { address, state }) => {
                debug!(%address, "test state {state:?}");
            }
            Ok(SessionEvent::TransportFailed(reason)) => {
                error!("radio lost: {reason}");
                return;
            }
            Ok(SessionEvent::MessageReceived(_)) => {}
            Err(RecvError::Lagged(skipped)) => warn!("event log missed {skipped} events"),
            Err(RecvError::Closed) => return,
        }
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(get_all))
        .route("/{address}", get(session_get))
        .route("/{address}/test", post(session_test))
        .route("/{address}/cancel", post(session_cancel))
        .route("/{address}/disconnect", post(session_disconnect))
        .with_state(state)
}

/// JSON form of a [`SessionSummary`].
#[derive(Debug, Serialize, PartialEq)]
struct SessionView {
    address: Option<u16>,
    connection: String,
    test: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    rssi: Option<i16>,
    snr: Option<i16>,
    /// Seconds since the unit was last heard.
    last_heard: Option<f64>,
}

impl From<SessionSummary> for SessionView {
    fn from(summary: SessionSummary) -> Self {
        Self {
            address: summary.address.map(Address::get),
            connection: summary.connection.to_string(),
            test: summary.test.map(|test| test.to_string()),
            latitude: summary.position.map(|p| p.latitude),
            longitude: summary.position.map(|p| p.longitude),
            rssi: summary.rssi,
            snr: summary.snr,
            last_heard: summary.last_heard.map(|at| at.elapsed().as_secs_f64()),
        }
    }
}

type ApiError = (StatusCode, String);

fn parse_address(raw: &str) -> Result<Address, ApiError> {
    raw.parse::<Address>()
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

fn session_error(e: SessionError) -> ApiError {
    let status = match e {
        SessionError::UnknownSession(_) => StatusCode::NOT_FOUND,
        SessionError::NotConnected(_) | SessionError::TestInProgress(_) => StatusCode::CONFLICT,
    };
    (status, e.to_string())
}

async fn get_all(State(state): State<AppState>) -> Json<Vec<SessionView>> {
    Json(
        state
            .station
            .list_sessions()
            .await
            .into_iter()
            .map(SessionView::from)
            .collect(),
    )
}

async fn session_get(
    Path(address): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<SessionView>, ApiError> {
    let address = parse_address(&address)?;
    state
        .station
        .session(address)
        .await
        .map(|summary| Json(summary.into()))
        .ok_or_else(|| session_error(SessionError::UnknownSession(address)))
}

async fn session_test(
    Path(address): Path<String>,
    State(state): State<AppState>,
    body: String,
) -> Result<(), ApiError> {
    let address = parse_address(&address)?;
    let config: TestConfig = body
        .parse()
        .map_err(|e: TestConfigError| (StatusCode::BAD_REQUEST, e.to_string()))?;
    info!(%address, %config, "test requested over HTTP");
    state
        .station
        .request_test(address, config)
        .await
        .map_err(session_error)
}

async fn session_cancel(
    Path(address): Path<String>,
    State(state): State<AppState>,
) -> Result<(), ApiError> {
    let address = parse_address(&address)?;
    state
        .station
        .cancel_test(address)
        .await
        .map_err(session_error)
}

async fn session_disconnect(
    Path(address): Path<String>,
    State(state): State<AppState>,
) -> Result<(), ApiError> {
    let address = parse_address(&address)?;
    state
        .station
        .disconnect(address)
        .await
        .map_err(session_error)
}
