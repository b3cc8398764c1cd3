mod adapters;
mod admin;
mod cli;
mod client;
mod wiring;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use portico_ca::CaResolver;
use portico_router::RouterRuntime;

use cli::{Cli, Command, Config, DaemonArgs, RouterArgs};

/// Maximum time to wait for orderly shutdown before forcing exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(20);

/// Brief pause after cancellation to let in-flight requests complete.
const SHUTDOWN_DRAIN: Duration = Duration::from_millis(500);

/// Default admin endpoint when no breadcrumb is present.
const DEFAULT_ADMIN_ENDPOINT: &str = "http://127.0.0.1:5721";

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => cli.log_level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // Hold the non-blocking guards for the lifetime of main so logs flush on exit.
    let _log_guards = init_logging(env_filter, cli.log_file.as_deref())?;

    // ── Synchronous subcommands (no runtime needed) ──────────────────
    match &cli.command {
        Command::Version => {
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "version": env!("CARGO_PKG_VERSION"),
                        "platform": std::env::consts::OS,
                    })
                );
            } else {
                println!("portico {}", env!("CARGO_PKG_VERSION"));
            }
            return Ok(());
        }
        Command::Status => return admin::status(&resolve_endpoint(&cli)?, cli.json),
        Command::Pair { cancel: false } => return admin::pair(&resolve_endpoint(&cli)?, cli.json),
        Command::Pair { cancel: true } => {
            return admin::pair_cancel(&resolve_endpoint(&cli)?, cli.json)
        }
        Command::Pending => return admin::pending(&resolve_endpoint(&cli)?, cli.json),
        Command::Approve { session } => {
            return admin::approve(&resolve_endpoint(&cli)?, session, cli.json)
        }
        Command::Reject { session } => {
            return admin::reject(&resolve_endpoint(&cli)?, session, cli.json)
        }
        Command::Devices => return admin::devices(&resolve_endpoint(&cli)?, cli.json),
        Command::Revoke { device } => {
            return admin::revoke(&resolve_endpoint(&cli)?, device, cli.json)
        }
        Command::CaExport { out } => return ca_export(&cli, out.as_deref()),
        Command::Daemon(_) | Command::Router(_) => {}
    }

    // ── Everything below needs a Tokio runtime ──────────────────────
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> anyhow::Result<()> {
    match &cli.command {
        Command::Daemon(args) => run_daemon(&cli, args).await,
        Command::Router(args) => run_router(&cli, args).await,
        _ => Ok(()),
    }
}

// ── Daemon mode ─────────────────────────────────────────────────────

async fn run_daemon(cli: &Cli, args: &DaemonArgs) -> anyhow::Result<()> {
    let config = Config::for_daemon(cli, args)?;
    portico_config::dirs::ensure_data_dir(&config.data_dir);
    startup_diagnostics(&config);

    let cancel = CancellationToken::new();
    let mdns = wiring::mdns_advertiser(&config);
    let mut cores =
        wiring::build_cores(&config, wiring::advertiser(mdns.as_ref()), cancel.clone())?;

    // Router first: binding 443 is the step most likely to fail.
    let router = if config.with_router {
        let strategy = wiring::passthrough_strategy(
            &config.settings.router.passthrough,
            Duration::from_secs(config.settings.router.connect_timeout_secs),
        );
        let runtime =
            RouterRuntime::start(wiring::router_config(&config), strategy, cancel.child_token())
                .await?;
        cores.router = Some(runtime.core());
        Some(runtime)
    } else {
        tracing::info!("Router: not started (run `portico router` or pass --with-router)");
        None
    };

    let admin_listener =
        adapters::http::bind_admin(config.settings.daemon.admin_listen).await?;
    let admin_endpoint = format!("http://{}", admin_listener.local_addr()?);

    let tls = CaResolver::new(
        Arc::clone(&cores.ca),
        &config.canonical_domain,
        config.settings.daemon.aliases.clone(),
    )
    .into_server_config()?;

    let mut tasks = Vec::new();
    {
        let app = adapters::http::api_router(&cores);
        let addr = config.settings.daemon.api_listen;
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = adapters::http::serve_api(app, addr, tls, token).await {
                tracing::error!(error = %e, "TLS API failed");
            }
        }));
    }
    {
        let app = adapters::http::admin_router(&cores);
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = adapters::http::serve_admin(app, admin_listener, token).await {
                tracing::error!(error = %e, "Admin listener failed");
            }
        }));
    }
    let sweeper = cores.pairing.spawn_sweeper(cancel.clone());

    portico_config::breadcrumb::write_breadcrumb(&admin_endpoint);
    tracing::info!(admin = %admin_endpoint, "Ready.");

    shutdown_signal().await;
    tracing::info!("Shutting down...");

    let shutdown = async {
        cancel.cancel();
        cores.pairing.shutdown();
        tokio::time::sleep(SHUTDOWN_DRAIN).await;
        if let Some(router) = router {
            router.stop().await;
        }
        for task in tasks {
            let _ = task.await;
        }
        let _ = sweeper.await;
        if let Some(mdns) = &mdns {
            if let Err(e) = mdns.shutdown().await {
                tracing::warn!(error = %e, "mDNS shutdown failed");
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown)
        .await
        .is_err()
    {
        tracing::warn!(
            "Shutdown timed out after {:?}, forcing exit",
            SHUTDOWN_TIMEOUT
        );
    }

    portico_config::breadcrumb::delete_breadcrumb();
    Ok(())
}

// ── Router-only mode ────────────────────────────────────────────────

async fn run_router(cli: &Cli, args: &RouterArgs) -> anyhow::Result<()> {
    let config = Config::for_router(cli, args)?;
    tracing::info!("Portico router v{} starting", env!("CARGO_PKG_VERSION"));

    let strategy = wiring::passthrough_strategy(
        &config.settings.router.passthrough,
        Duration::from_secs(config.settings.router.connect_timeout_secs),
    );
    let cancel = CancellationToken::new();
    let runtime = RouterRuntime::start(wiring::router_config(&config), strategy, cancel).await?;
    tracing::info!("Ready.");

    shutdown_signal().await;
    tracing::info!("Shutting down...");
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, runtime.stop())
        .await
        .is_err()
    {
        tracing::warn!("Router shutdown timed out");
    }
    Ok(())
}

// ── Client helpers ──────────────────────────────────────────────────

/// Admin endpoint: `--endpoint`, then the breadcrumb, then the default.
fn resolve_endpoint(cli: &Cli) -> anyhow::Result<String> {
    let endpoint = cli
        .endpoint
        .clone()
        .or_else(portico_config::breadcrumb::read_breadcrumb)
        .unwrap_or_else(|| DEFAULT_ADMIN_ENDPOINT.to_string());
    let url = url::Url::parse(&endpoint)
        .map_err(|e| anyhow::anyhow!("Invalid endpoint {endpoint:?}: {e}"))?;
    if url.scheme() != "http" {
        anyhow::bail!("Admin endpoint must be plain http on loopback, got {endpoint}");
    }
    Ok(endpoint)
}

/// Root certificate from the daemon, or from the data directory when no
/// daemon is running.
fn ca_export(cli: &Cli, out: Option<&std::path::Path>) -> anyhow::Result<()> {
    let endpoint = resolve_endpoint(cli)?;
    if client::PorticoClient::new(&endpoint).health().is_ok() {
        return admin::ca_export(&endpoint, out);
    }

    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(portico_common::paths::portico_data_dir);
    let path = data_dir.join("ca").join("root.pem");
    let pem = std::fs::read_to_string(&path).map_err(|e| {
        anyhow::anyhow!(
            "Daemon not reachable and no root certificate at {}: {e}",
            path.display()
        )
    })?;
    match out {
        Some(out) => std::fs::write(out, &pem)?,
        None => print!("{pem}"),
    }
    Ok(())
}

// ── Infrastructure helpers ──────────────────────────────────────────

/// Wait for Ctrl+C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// ── Daemon startup diagnostics ──────────────────────────────────────

fn startup_diagnostics(config: &Config) {
    tracing::info!("Portico v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!("Platform: {}", std::env::consts::OS);

    match hostname::get() {
        Ok(h) => tracing::info!("Hostname: {}", h.to_string_lossy()),
        Err(e) => tracing::warn!(error = %e, "Could not determine hostname"),
    }

    let daemon = &config.settings.daemon;
    tracing::info!("Data directory: {}", config.data_dir.display());
    tracing::info!("Canonical domain: {}", config.canonical_domain);
    tracing::info!("TLS API: {}", daemon.api_listen);
    tracing::info!("Admin: {} (loopback only)", daemon.admin_listen);
    if config.ephemeral {
        tracing::info!("Device store: memory (ephemeral)");
    }
    if config.with_router {
        tracing::info!("Router: {}", config.settings.router.listen);
    }
}

// ── Logging setup ───────────────────────────────────────────────────

/// Initialize tracing with stderr + optional file output.
/// Returns guards that must be held for the lifetime of the program
/// to ensure the non-blocking writers flush on shutdown.
fn init_logging(
    env_filter: tracing_subscriber::EnvFilter,
    log_file: Option<&std::path::Path>,
) -> anyhow::Result<Vec<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::prelude::*;

    let (nb_stderr, stderr_guard) = tracing_appender::non_blocking(std::io::stderr());
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(nb_stderr);

    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let (nb_file, file_guard) = tracing_appender::non_blocking(file);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(nb_file);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();

        Ok(vec![stderr_guard, file_guard])
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();

        Ok(vec![stderr_guard])
    }
}
