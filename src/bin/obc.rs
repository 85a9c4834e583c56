use std::path::Path;

use clap::{App, Arg};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cubesat_obc::{
    now_ms, run, LineTransport, ObcAgent, ObcConfig, ObcEvent, RunOutcome,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("cubesat-obc")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Cubesat onboard decision core")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Broker bridge host, overrides broker.host")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Broker bridge port, overrides broker.port")
                .takes_value(true)
                .validator(|v| match v.parse::<u16>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Port must be a number between 0 and 65535".into()),
                }),
        )
        .arg(
            Arg::with_name("client-id")
                .long("client-id")
                .value_name("ID")
                .help("Client identifier presented to the broker")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("log-level")
                .short("l")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log filter when RUST_LOG is unset")
                .takes_value(true)
                .possible_values(&["trace", "debug", "info", "warn", "error"]),
        )
        .get_matches();

    let mut config = ObcConfig::load(matches.value_of("config").map(Path::new))?;
    if let Some(host) = matches.value_of("host") {
        config.broker.host = host.to_string();
    }
    if let Some(port) = matches.value_of("port") {
        config.broker.port = port.parse()?;
    }
    if let Some(client_id) = matches.value_of("client-id") {
        config.broker.client_id = client_id.to_string();
    }
    if let Some(level) = matches.value_of("log-level") {
        config.logging.level = level.to_string();
    }
    config.validate()?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        host = %config.broker.host,
        port = config.broker.port,
        client_id = %config.broker.client_id,
        "starting OBC core"
    );

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    let signal_tx = events_tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = signal_tx.send(ObcEvent::ShutdownRequested);
            }
            Err(e) => error!(error = %e, "failed to listen for ctrl-c"),
        }
    });

    let mut transport = LineTransport::new(config.transport_config(), events_tx);
    let mut agent = ObcAgent::new(config.agent_config(), now_ms());

    let outcome = run(
        &mut agent,
        &mut transport,
        &mut events_rx,
        config.runtime_config(),
    )
    .await;

    match outcome {
        RunOutcome::Stopped => info!(state = %agent.state(), "OBC core stopped"),
        RunOutcome::QueueClosed => error!("event queue closed unexpectedly"),
    }
    Ok(())
}
