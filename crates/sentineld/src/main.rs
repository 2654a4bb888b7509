mod config;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use config::Config;
use sentinel_certs::CertStore;
use sentinel_cloud::{CloudProvider, HetznerProvider, NoopProvider};
use sentinel_core::{Supervisor, SupervisorConfig};
use sentinel_nat::NatActuator;
use sentinel_ssh::SshKeyStore;

#[derive(Debug, Parser)]
#[command(name = "sentineld", about = "Always-on sentinel fronting a preemptible backend")]
struct Cli {
    #[arg(long, env = "SENTINEL_CONFIG_FILE", default_value = "/etc/sentinel/config.toml")]
    config: String,

    #[arg(long, short = 'v')]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("sentineld={log_level}").parse().unwrap())
        .add_directive(format!("sentinel_core={log_level}").parse().unwrap())
        .add_directive(format!("sentinel_cloud={log_level}").parse().unwrap())
        .add_directive(format!("sentinel_nat={log_level}").parse().unwrap())
        .add_directive(format!("sentinel_certs={log_level}").parse().unwrap())
        .add_directive(format!("sentinel_ssh={log_level}").parse().unwrap())
        .add_directive(format!("sentinel_web={log_level}").parse().unwrap())
        .add_directive(format!("sentinel_health={log_level}").parse().unwrap());
    tracing_subscriber::fmt().with_env_filter(filter).json().init();
}

fn build_cloud_provider(config: &Config) -> Arc<dyn CloudProvider> {
    match config.cloud.provider.as_str() {
        "hetzner" => Arc::new(HetznerProvider::new(
            config.cloud.hetzner.api_token.clone(),
            config.cloud.hetzner.server_id,
        )),
        _ => Arc::new(NoopProvider::new(config.cloud.noop.instance_ip.clone())),
    }
}

fn into_supervisor_config(config: &Config) -> SupervisorConfig {
    SupervisorConfig {
        probe_port: config.probe.port,
        probe_interval: config.probe_interval(),
        probe_timeout: config.probe_timeout(),
        healthy_threshold: config.probe.healthy_threshold,
        unhealthy_threshold: config.probe.unhealthy_threshold,
        forwarded_ports: config.forward.ports.clone(),
        http_addr: config.web.http_addr,
        https_addr: config.web.https_addr,
        binary_addr: config.binary.addr,
        binary_path: config.binary.path.clone(),
        recovery_timeout: config.recovery_timeout(),
        cert_sync_interval: config.cert_sync_interval(),
        key_sync_interval: config.key_sync_interval(),
        backend_api_port: config.sync.backend_api_port,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "sentineld exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config))?;
    config.validate().context("configuration is invalid")?;

    let cert_store = Arc::new(CertStore::new().context("failed to initialize cert store")?);
    let key_store =
        Arc::new(SshKeyStore::new(&config.ssh.etc_dir).context("failed to initialize SSH key store")?);
    let nat = NatActuator::new().with_bridge_iface(config.nat.bridge_iface.clone());
    let cloud = build_cloud_provider(&config);

    info!(
        cloud = cloud.name(),
        forwarded_ports = ?config.forward.ports,
        http_addr = %config.web.http_addr,
        https_addr = %config.web.https_addr,
        binary_surface = config.binary.addr.is_some(),
        "starting sentineld"
    );

    let supervisor = Supervisor::new(cloud, cert_store, key_store, nat, into_supervisor_config(&config));

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        signal_cancel.cancel();
    });

    supervisor.run(cancel).await.context("supervisor exited with an error")
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
