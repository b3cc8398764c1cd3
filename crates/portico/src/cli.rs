use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

use portico_config::settings::{Settings, CONFIG_FILENAME};

#[derive(Parser, Debug)]
#[command(
    name = "portico",
    version,
    about = "Local-first control plane: TLS bridge, local CA and device pairing"
)]
pub struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "PORTICO_LOG", default_value = "info", global = true)]
    pub log_level: String,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Write logs to file (in addition to stderr)
    #[arg(long, env = "PORTICO_LOG_FILE", value_name = "PATH", global = true)]
    pub log_file: Option<PathBuf>,

    /// Data directory (CA, device records, leaf mirror)
    #[arg(long, env = "PORTICO_DATA_DIR", value_name = "DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Config file (default: config.toml in the data directory)
    #[arg(long, env = "PORTICO_CONFIG", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Output JSON instead of human-readable text
    #[arg(long, global = true)]
    pub json: bool,

    /// Admin endpoint of a running daemon (e.g. "http://127.0.0.1:5721")
    #[arg(long, env = "PORTICO_ENDPOINT", global = true)]
    pub endpoint: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the control-plane daemon (CA, pairing, authenticated API)
    Daemon(DaemonArgs),
    /// Run only the port-443 router (for a separately privileged process)
    Router(RouterArgs),
    /// Show daemon status
    Status,
    /// Make the daemon discoverable and print the pairing QR code
    Pair {
        /// Leave discoverable mode instead
        #[arg(long)]
        cancel: bool,
    },
    /// List pairing requests awaiting approval
    Pending,
    /// Approve a pending pairing request
    Approve {
        /// Session ID from `portico pending`
        session: String,
    },
    /// Reject a pending pairing request
    Reject {
        /// Session ID from `portico pending`
        session: String,
    },
    /// List paired devices
    Devices,
    /// Revoke a paired device
    Revoke {
        /// Device ID from `portico devices`
        device: String,
    },
    /// Export the root CA certificate (PEM)
    CaExport {
        /// Write to a file instead of stdout
        #[arg(long, short, value_name = "PATH")]
        out: Option<PathBuf>,
    },
    /// Show version information
    Version,
}

#[derive(Args, Debug, Default)]
pub struct DaemonArgs {
    /// Canonical domain (default: <hostname>.local)
    #[arg(long, env = "PORTICO_DOMAIN")]
    pub domain: Option<String>,

    /// TLS API listen address
    #[arg(long, env = "PORTICO_API_LISTEN")]
    pub api_listen: Option<SocketAddr>,

    /// Loopback admin listen address
    #[arg(long, env = "PORTICO_ADMIN_LISTEN")]
    pub admin_listen: Option<SocketAddr>,

    /// Keep device records in memory only
    #[arg(long)]
    pub ephemeral: bool,

    /// Run the port-443 router in this process
    #[arg(long, env = "PORTICO_WITH_ROUTER")]
    pub with_router: bool,

    /// Router listen address (with --with-router)
    #[arg(long, env = "PORTICO_ROUTER_LISTEN")]
    pub router_listen: Option<SocketAddr>,

    /// Do not publish the mDNS pairing record
    #[arg(long, env = "PORTICO_NO_MDNS")]
    pub no_mdns: bool,
}

#[derive(Args, Debug, Default)]
pub struct RouterArgs {
    /// Canonical domain (default: <hostname>.local)
    #[arg(long, env = "PORTICO_DOMAIN")]
    pub domain: Option<String>,

    /// Router listen address
    #[arg(long, env = "PORTICO_ROUTER_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Internal API address the canonical domain is bridged to
    #[arg(long, env = "PORTICO_API_LISTEN")]
    pub internal: Option<SocketAddr>,
}

/// Resolved configuration used at runtime: config file, then CLI flags.
#[derive(Debug)]
pub struct Config {
    pub data_dir: PathBuf,
    pub settings: Settings,
    pub canonical_domain: String,
    pub ephemeral: bool,
    pub with_router: bool,
}

impl Config {
    pub fn for_daemon(cli: &Cli, args: &DaemonArgs) -> anyhow::Result<Self> {
        let data_dir = data_dir(cli);
        let mut settings = load_settings(cli, &data_dir)?;
        if let Some(domain) = &args.domain {
            settings.daemon.canonical_domain = Some(domain.clone());
        }
        if let Some(addr) = args.api_listen {
            settings.daemon.api_listen = addr;
        }
        if let Some(addr) = args.admin_listen {
            settings.daemon.admin_listen = addr;
        }
        if let Some(addr) = args.router_listen {
            settings.router.listen = addr;
        }
        if args.no_mdns {
            settings.daemon.mdns = false;
        }
        settings.validate()?;

        Ok(Self {
            data_dir,
            canonical_domain: settings.canonical_domain(),
            settings,
            ephemeral: args.ephemeral,
            with_router: args.with_router,
        })
    }

    pub fn for_router(cli: &Cli, args: &RouterArgs) -> anyhow::Result<Self> {
        let data_dir = data_dir(cli);
        let mut settings = load_settings(cli, &data_dir)?;
        if let Some(domain) = &args.domain {
            settings.daemon.canonical_domain = Some(domain.clone());
        }
        if let Some(addr) = args.listen {
            settings.router.listen = addr;
        }
        if let Some(addr) = args.internal {
            settings.daemon.api_listen = addr;
        }
        settings.validate()?;

        Ok(Self {
            data_dir,
            canonical_domain: settings.canonical_domain(),
            settings,
            ephemeral: true,
            with_router: true,
        })
    }
}

fn data_dir(cli: &Cli) -> PathBuf {
    cli.data_dir
        .clone()
        .unwrap_or_else(portico_common::paths::portico_data_dir)
}

fn load_settings(cli: &Cli, data_dir: &std::path::Path) -> anyhow::Result<Settings> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| data_dir.join(CONFIG_FILENAME));
    Ok(Settings::load(&path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn daemon_flags_override_config_file() {
        let dir = portico_common::test::unique_temp_dir("cli");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(CONFIG_FILENAME),
            "[daemon]\ncanonical_domain = \"file.local\"\nmdns = true\n",
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "portico",
            "--data-dir",
            dir.to_str().unwrap(),
            "daemon",
            "--domain",
            "Flag.Local",
            "--no-mdns",
            "--ephemeral",
        ])
        .unwrap();
        let Command::Daemon(args) = &cli.command else {
            panic!("expected daemon command");
        };
        let config = Config::for_daemon(&cli, args).unwrap();
        assert_eq!(config.canonical_domain, "flag.local");
        assert!(!config.settings.daemon.mdns);
        assert!(config.ephemeral);
        assert!(!config.with_router);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn approve_takes_a_session_id() {
        let cli = Cli::try_parse_from(["portico", "approve", "abc123"]).unwrap();
        assert!(matches!(cli.command, Command::Approve { ref session } if session == "abc123"));
    }
}
