use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::anyhow;
use clap::{Args, Parser, Subcommand, ValueEnum};
use parking_lot::RwLock;
use tracing::{error, info};

use freshet_core::file_info::ArchivePath;
use freshet_core::predicate::{Filter, Predicate};
use freshet_core::server_info::ServerInfo;
use libfreshet::{Archive, ArchiveOptions, Node, NodeOptions, NodeRole, PortSpec};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Parser)]
#[command(version, author, about)]
struct Opts {
    /// The console loglevel. FRESHET_LOG / RUST_LOG take precedence.
    #[arg(value_enum, short = 'v', long = "log-level", env = "FRESHET_LOG_LEVEL")]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    subcommand: SubCommand,
}

#[derive(Subcommand)]
enum SubCommand {
    /// Serve the archive to whoever asks; request nothing.
    Source(CommonOpts),
    /// Replicate the wanted files from peers, then exit.
    Sink(SinkOpts),
}

#[derive(Args)]
struct CommonOpts {
    /// Archive root directory.
    #[arg(long, env = "FRESHET_ROOT")]
    root: PathBuf,

    /// IP to bind the three server sockets on.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED), env = "FRESHET_LISTEN_IP")]
    listen_ip: IpAddr,

    /// Base of a contiguous [notice, request, data] port triple.
    /// Ephemeral ports are used when neither this nor --ports is set.
    #[arg(long, env = "FRESHET_LISTEN_PORT")]
    listen_port: Option<u16>,

    /// An explicit notice,request,data port triple.
    #[arg(
        long,
        value_delimiter = ',',
        num_args = 3,
        conflicts_with = "listen_port"
    )]
    ports: Option<Vec<u16>>,

    /// Tracker address for peer bootstrap.
    #[arg(long, env = "FRESHET_TRACKER")]
    tracker: Option<SocketAddr>,

    /// Statically configured peer as ip:base or ip:p0,p1,p2. Repeatable.
    #[arg(long = "peer", value_parser = parse_server_info)]
    peers: Vec<ServerInfo>,

    /// Piece size for files that originate in this archive.
    #[arg(long, default_value_t = libfreshet::archive::DEFAULT_PIECE_SIZE, env = "FRESHET_PIECE_SIZE")]
    piece_size: u32,
}

#[derive(Args)]
struct SinkOpts {
    #[command(flatten)]
    common: CommonOpts,

    /// Relative archive path to replicate. Repeatable.
    #[arg(long = "want", required = true)]
    want: Vec<String>,
}

fn parse_server_info(value: &str) -> Result<ServerInfo, String> {
    let (ip, ports) = value
        .rsplit_once(':')
        .ok_or_else(|| "expected ip:base or ip:p0,p1,p2".to_owned())?;
    let ip: IpAddr = ip.parse().map_err(|e| format!("bad ip {ip:?}: {e}"))?;
    let ports: Vec<u16> = ports
        .split(',')
        .map(|p| p.parse::<u16>().map_err(|e| format!("bad port {p:?}: {e}")))
        .collect::<Result<_, _>>()?;
    match ports[..] {
        [base] => {
            let last = base
                .checked_add(2)
                .ok_or_else(|| format!("port triple starting at {base} overflows"))?;
            Ok(ServerInfo::new(ip, [base, base + 1, last]))
        }
        [notice, request, data] => Ok(ServerInfo::new(ip, [notice, request, data])),
        _ => Err("expected one base port or exactly three ports".to_owned()),
    }
}

/// Exit codes: 1 configuration, 2 network setup, 3 replication I/O.
enum MainError {
    Config(anyhow::Error),
    Network(anyhow::Error),
    Replication(anyhow::Error),
}

impl MainError {
    fn inner(&self) -> &anyhow::Error {
        match self {
            MainError::Config(e) | MainError::Network(e) | MainError::Replication(e) => e,
        }
    }

    fn exit_code(&self) -> u8 {
        match self {
            MainError::Config(_) => 1,
            MainError::Network(_) => 2,
            MainError::Replication(_) => 3,
        }
    }
}

fn init_logging(level: Option<LogLevel>) {
    let default = level.map(|l| l.as_str()).unwrap_or("info");
    let filter = tracing_subscriber::EnvFilter::try_from_env("FRESHET_LOG")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    let opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(e) => {
            use clap::error::ErrorKind;
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            };
        }
    };
    init_logging(opts.log_level);

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("error starting runtime: {e:#}");
            return ExitCode::from(3);
        }
    };
    match rt.block_on(run(opts.subcommand)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e.inner());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(subcommand: SubCommand) -> Result<(), MainError> {
    let (common, role, predicate) = match subcommand {
        SubCommand::Source(common) => (common, NodeRole::Source, Predicate::nothing()),
        SubCommand::Sink(sink) => {
            let filters = sink
                .want
                .iter()
                .map(|want| {
                    ArchivePath::new(want.clone())
                        .map(|path| Filter::for_path(&path))
                        .map_err(|e| MainError::Config(anyhow!("bad --want {want:?}: {e}")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            (sink.common, NodeRole::Sink, Predicate::new(filters))
        }
    };
    if common.piece_size == 0 {
        return Err(MainError::Config(anyhow!("--piece-size must be non-zero")));
    }
    let ports = match (&common.ports, common.listen_port) {
        (Some(ports), _) => PortSpec::Explicit([ports[0], ports[1], ports[2]]),
        (None, Some(base)) => PortSpec::Range(base),
        (None, None) => PortSpec::Ephemeral,
    };

    let archive = Archive::open(
        &common.root,
        ArchiveOptions {
            default_piece_size: common.piece_size,
            ..Default::default()
        },
    )
    .map_err(MainError::Replication)?;

    let handle = Node::start(
        archive,
        Arc::new(RwLock::new(predicate)),
        NodeOptions {
            role,
            listen_ip: common.listen_ip,
            ports,
            tracker: common.tracker,
            static_peers: common.peers,
            ..Default::default()
        },
    )
    .await
    .map_err(MainError::Network)?;
    info!(server = %handle.server_info(), "node started");

    let cancel = handle.cancellation_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt, shutting down");
            cancel.cancel();
        }
    });

    handle.wait().await.map_err(MainError::Replication)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server_info() {
        assert_eq!(
            parse_server_info("10.0.0.1:7000").unwrap(),
            ServerInfo::new("10.0.0.1".parse().unwrap(), [7000, 7001, 7002])
        );
        assert_eq!(
            parse_server_info("::1:7000,8000,9000").unwrap(),
            ServerInfo::new("::1".parse().unwrap(), [7000, 8000, 9000])
        );
        assert!(parse_server_info("10.0.0.1").is_err());
        assert!(parse_server_info("10.0.0.1:1,2").is_err());
        assert!(parse_server_info("not-an-ip:1").is_err());
    }
}
