//! Remote unit service: joins the station over the radio and runs the test
//! procedures it is assigned.

use std::path::PathBuf;

use clap::Parser;
use ota_core::Config;
use ota_tokio::{LineTransport, ProcedureRunner, Settings, Transport, Unit};
use tokio::{net::TcpStream, select, signal, task::JoinSet};
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _};

#[derive(Parser)]
#[command(name = "ota-unit")]
#[command(about = "OTA remote unit: joins a station and runs assigned tests")]
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

    let handles = if let Some(bridge) = args.connect {
        info!("connecting to radio bridge at {bridge}");
        let socket = TcpStream::connect(&bridge).await?;
        start(config, &settings, LineTransport::new(socket))?
    } else {
        open_modem(config, &settings)?
    };

    handles.join_all().await.iter().for_each(|res| {
        if let Err(e) = res {
            error!("remote unit error: {e}");
        }
    });
    info!("remote unit finished");

    Ok(())
}

#[cfg(feature = "serial")]
fn open_modem(config: Config, settings: &Settings) -> anyhow::Result<JoinSet<anyhow::Result<()>>> {
    let modem = ota_tokio::open_serial(&settings.ota_port, settings.ota_baudrate)?;
    start(config, settings, modem)
}

#[cfg(not(feature = "serial"))]
fn open_modem(
    _config: Config,
    _settings: &Settings,
) -> anyhow::Result<JoinSet<anyhow::Result<()>>> {
    anyhow::bail!("built without the `serial` feature, use --connect")
}

fn start<T: Transport>(
    config: Config,
    settings: &Settings,
    transport: T,
) -> anyhow::Result<JoinSet<anyhow::Result<()>>> {
    let unit = Unit::new(config);
    let handle = unit.handle();
    let runner = ProcedureRunner::new(
        handle.clone(),
        settings.procedures.clone(),
        settings.update_interval(),
    );

    let mut handles = unit.run(transport)?;
    handles.spawn(runner.run());
    handles.spawn(async move {
        select! {
            res = signal::ctrl_c() => {
                res?;
                handle.shutdown();
            }
            () = handle.stopped() => {}
        }
        Ok(())
    });
    Ok(handles)
}
