//! exportbd daemon - serve a disk image or one of its partitions over NBD.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::{TcpListener, UnixListener};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use exportbd::{Config, Daemon, Rendezvous};

#[derive(Parser)]
#[command(
    name = "exportbd",
    about = "NBD export daemon for disk images and MBR partitions"
)]
struct Cli {
    /// Disk image to export; the NBD device path with --disconnect.
    image: PathBuf,

    /// Path to a TOML config file; CLI flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Interface to bind to.
    #[arg(short, long)]
    bind: Option<String>,

    /// TCP port to listen on.
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen on a Unix socket instead of TCP; path must be absolute.
    #[arg(short = 'k', long)]
    socket: Option<PathBuf>,

    /// Byte offset into the image to export from.
    #[arg(short, long)]
    offset: Option<u64>,

    /// Export only this MBR partition (1-8; logical partitions are 5+).
    #[arg(short = 'P', long)]
    partition: Option<u32>,

    /// Export read-only.
    #[arg(short, long)]
    read_only: bool,

    /// Number of clients that may be connected at once.
    #[arg(short = 'e', long)]
    shared: Option<usize>,

    /// Keep serving after the last client disconnects.
    #[arg(short = 't', long)]
    persistent: bool,

    /// Attach the export to a local NBD device (e.g. /dev/nbd0).
    #[arg(short, long)]
    connect: Option<PathBuf>,

    /// Disconnect the given NBD device and exit.
    #[arg(short, long)]
    disconnect: bool,

    /// Log at debug level.
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> Result<Config> {
        let mut config = match self.config {
            Some(ref path) => Config::load(path)
                .with_context(|| format!("failed to load config: {}", path.display()))?,
            None => Config::new(self.image.clone()),
        };
        config.image = self.image;

        if let Some(bind) = self.bind {
            config.listen.bind = Some(bind);
        }
        if let Some(port) = self.port {
            config.listen.port = Some(port);
        }
        if let Some(socket) = self.socket {
            config.listen.socket = Some(socket);
        }
        if let Some(offset) = self.offset {
            config.export.offset = offset;
        }
        if let Some(partition) = self.partition {
            config.export.partition = Some(partition);
        }
        if self.read_only {
            config.export.read_only = true;
        }
        if let Some(shared) = self.shared {
            config.serve.shared = shared;
        }
        if self.persistent {
            config.serve.persistent = true;
        }
        if let Some(device) = self.connect {
            config.attach = Some(device);
        }

        // With --connect and no explicit rendezvous, talk to ourselves
        // over a socket named after the device.
        if let Some(ref device) = config.attach {
            if config.listen.socket.is_none()
                && config.listen.bind.is_none()
                && config.listen.port.is_none()
            {
                let name = device
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "nbd".to_string());
                config.listen.socket = Some(PathBuf::from(format!("/run/exportbd/{name}.sock")));
            }
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if cli.disconnect {
        return disconnect(&cli.image);
    }

    let config = cli.into_config()?;
    let rendezvous = config.listen.rendezvous()?;

    let daemon = Daemon::from_config(config)
        .await
        .context("failed to start daemon")?;

    // The signal task only flips the termination flag; everything else
    // happens on the control path. Streams are polled in a loop so
    // repeated signals stay harmless.
    let state = daemon.state();
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        let mut sigint =
            signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
        loop {
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = sigint.recv() => info!("received SIGINT"),
            }
            state.request_termination();
        }
    });

    match rendezvous {
        Rendezvous::Tcp(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            info!(address = %addr, "listening");
            daemon.run(listener).await?;
        }
        Rendezvous::Unix(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            let listener = UnixListener::bind(&path)
                .with_context(|| format!("failed to bind {}", path.display()))?;
            info!(socket = %path.display(), "listening");
            daemon.run(listener).await?;
        }
    }

    Ok(())
}

fn disconnect(device: &std::path::Path) -> Result<()> {
    nbd::disconnect_device(device)
        .with_context(|| format!("cannot disconnect {}", device.display()))?;
    println!("{} disconnected", device.display());
    Ok(())
}
