//! twibd 主入口

use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use twibd::config::{self, TwibdConfig};
use twibd::backend::{tcp::TcpBackend, usb::UsbBackend};
use twibd::daemon::Twibd;
use twibd::frontend::SocketFrontend;
use twibd::singleton::SingletonLock;

/// Twili debug monitor daemon
#[derive(Parser, Debug)]
#[command(name = "twibd")]
#[command(about = "Twili debug monitor daemon", long_about = None)]
struct Args {
    /// Enable verbose messages. Use twice to enable trace messages
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Disable the UNIX socket frontend
    #[arg(long)]
    no_unix: bool,

    /// Path for the twibd UNIX socket frontend
    #[arg(short = 'P', long, env = "TWIB_UNIX_FRONTEND_PATH")]
    unix_path: Option<PathBuf>,

    /// Disable the TCP socket frontend
    #[arg(long)]
    no_tcp: bool,

    /// Port for the twibd TCP socket frontend (localhost only)
    #[arg(short = 'p', long, env = "TWIB_TCP_FRONTEND_PORT",
          default_value_t = config::DEFAULT_FRONTEND_TCP_PORT)]
    tcp_port: u16,

    /// Disable the USB device backend
    #[arg(long)]
    no_usb: bool,

    /// Disable the TCP device backend (announce listener + CONNECT_TCP)
    #[arg(long)]
    no_tcp_bridge: bool,

    /// Lock file path
    #[arg(long)]
    lock_file: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("twibd={0},twib={0}", default_level))),
        )
        .init();

    let config = TwibdConfig {
        unix_frontend_enabled: !args.no_unix,
        unix_frontend_path: args.unix_path.unwrap_or_else(config::default_unix_socket_path),
        tcp_frontend_enabled: !args.no_tcp,
        tcp_frontend_port: args.tcp_port,
        usb_backend_enabled: !args.no_usb,
        tcp_backend_enabled: !args.no_tcp_bridge,
        ..TwibdConfig::default()
    };

    let lock_path = args.lock_file.unwrap_or_else(config::default_lock_file_path);
    let _lock = SingletonLock::try_lock(&lock_path)
        .with_context(|| format!("failed to acquire singleton lock at {}", lock_path.display()))?;

    info!("starting twibd");
    let twibd = Twibd::new();

    // USB 不可用（缺 libusb 权限等）只降级告警，TCP 路径照常工作
    let _usb_backend = if config.usb_backend_enabled {
        match UsbBackend::start(twibd.clone(), config.usb_transfer_timeout) {
            Ok(backend) => Some(backend),
            Err(e) => {
                warn!("usb backend unavailable: {}", e);
                None
            },
        }
    } else {
        None
    };

    let _tcp_backend = if config.tcp_backend_enabled {
        let backend = TcpBackend::start(twibd.clone(), &config)
            .context("failed to start tcp backend")?;
        twibd.set_tcp_connector(backend.connector());
        Some(backend)
    } else {
        None
    };

    let mut _frontends = Vec::new();
    if config.unix_frontend_enabled {
        let frontend = SocketFrontend::spawn_unix(twibd.clone(), &config.unix_frontend_path)
            .with_context(|| {
                format!(
                    "failed to bind unix frontend at {}",
                    config.unix_frontend_path.display()
                )
            })?;
        _frontends.push(frontend);
    }
    if config.tcp_frontend_enabled {
        _frontends.push(
            SocketFrontend::spawn_tcp(twibd.clone(), config.tcp_frontend_port)
                .context("failed to bind tcp frontend")?,
        );
    }

    // Ctrl+C：清理 UNIX socket 文件后退出
    let cleanup_path = config
        .unix_frontend_enabled
        .then(|| config.unix_frontend_path.clone());
    ctrlc::set_handler(move || {
        eprintln!("\nreceived interrupt signal, shutting down");
        if let Some(ref path) = cleanup_path
            && path.exists()
            && let Err(e) = std::fs::remove_file(path)
        {
            eprintln!("warning: failed to remove socket file {}: {}", path.display(), e);
        }
        std::process::exit(0);
    })
    .expect("failed to set signal handler");

    // 调度循环跑在主线程上
    twibd.run();
    Ok(())
}
