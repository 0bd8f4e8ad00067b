use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use pumpe_core::config::{SetConfig, Settings};
use pumpe_core::wgconf::{WgParseMode, load_wg_configs};
use pumpe_core::{GateError, Kind};

use pumpe_proxy::gate::{DirectGate, GateSet, TorGate, WireGuardGate};
use pumpe_proxy::service::GateAdmin;
use pumpe_proxy::{admin, server};

#[tokio::main]
async fn main() {
    let settings = Settings::from_env();
    let guard = init_tracing(&settings);

    // One crypto provider for every TLS client in the process.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("crypto provider was already installed");
    }

    let code = match run(settings).await {
        Ok(()) => {
            info!("finished");
            0
        }
        Err(err) => {
            error!(error = %err, "finished with error");
            1
        }
    };

    drop(guard);
    std::process::exit(code);
}

async fn run(settings: Settings) -> Result<(), GateError> {
    if settings.wg_dir.is_empty() {
        return Err(GateError::Transport(
            "invalid wireguard config directory".into(),
        ));
    }

    let default_kind = Kind::parse(&settings.default_kind)?;

    let mode = WgParseMode::from_u8(settings.wg_parse_mode);
    let outcome = load_wg_configs(mode, Path::new(&settings.wg_dir))?;
    for failure in &outcome.failures {
        warn!(kind = "wireguard", file = %failure.file, error = %failure.error, "unable to parse config");
    }

    if default_kind == Kind::WireGuard && outcome.configs.is_empty() {
        return Err(GateError::Transport(
            "cannot start: unable to use wireguard as default without configs".into(),
        ));
    }

    if settings.randomise_kinds && (outcome.configs.is_empty() || settings.tor_num == 0) {
        return Err(GateError::Transport(
            "cannot start: unable to randomise kinds without both configured".into(),
        ));
    }

    let wg_dns: IpAddr = settings
        .wg_dns
        .parse()
        .map_err(|_| GateError::Transport("invalid wireguard dns address".into()))?;

    let set_cfg = SetConfig::from_settings(&settings, default_kind);

    let mut wgs = Vec::with_capacity(outcome.configs.len());
    for cfg in &outcome.configs {
        match WireGuardGate::create(cfg, wg_dns, settings.http_client_timeout).await {
            Ok(gate) => wgs.push(gate),
            Err(err) => {
                // Stop what already came up before bailing out.
                let partial = GateSet::new(
                    set_cfg.clone(),
                    DirectGate::new(settings.http_client_timeout),
                    Vec::new(),
                    wgs,
                );
                let _ = partial.shutdown().await;

                return Err(err);
            }
        }
    }
    debug!(kind = "wireguard", count = wgs.len(), "initialised gates");

    let mut tors = Vec::with_capacity(settings.tor_num);
    for _ in 0..settings.tor_num {
        match TorGate::create(settings.tor_startup_timeout, settings.http_client_timeout).await {
            Ok(gate) => tors.push(gate),
            Err(err) => {
                let partial = GateSet::new(
                    set_cfg.clone(),
                    DirectGate::new(settings.http_client_timeout),
                    tors,
                    wgs,
                );
                let _ = partial.shutdown().await;

                return Err(err);
            }
        }
    }
    debug!(kind = "tor", count = tors.len(), "initialised gates");

    let set = Arc::new(GateSet::new(
        set_cfg,
        DirectGate::new(settings.http_client_timeout),
        tors,
        wgs,
    ));

    if let Err(err) = set.warmup().await {
        let _ = set.shutdown().await;
        return Err(err);
    }
    debug!("warmed up gates");

    let admin = admin::router(Arc::new(GateAdmin::new(Arc::clone(&set))));

    let listener = TcpListener::bind(("0.0.0.0", settings.port)).await?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    info!(port = settings.port, "starting http server");

    server::run(listener, Arc::clone(&set), admin, shutdown.clone()).await?;

    info!("draining gates");

    match tokio::time::timeout(settings.shutdown_timeout, set.shutdown()).await {
        Ok(result) => result?,
        Err(_) => return Err(GateError::DeadlineExceeded),
    }

    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let term = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut term) => {
                    term.recv().await;
                }
                Err(err) => {
                    warn!(error = %err, "cannot listen for sigterm");
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term => {}
        }

        info!("shutdown signal received");
        shutdown.cancel();
    });
}

fn init_tracing(settings: &Settings) -> tracing_appender::non_blocking::WorkerGuard {
    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.to_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_writer(writer)
        .with_env_filter(filter)
        .with_file(settings.log_add_source)
        .with_line_number(settings.log_add_source);

    if settings.log_format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }

    guard
}
