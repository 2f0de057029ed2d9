use std::{net::SocketAddr, time::Duration};

use anyhow::{Result, Context, bail};
use clap::Parser;
use tokio::{net::{TcpListener, UdpSocket}, sync::mpsc};
use url::Url;

use greeir2net::{
    config::{Port, Settings, init_logging},
    control::Controller,
    fanout::{BroadcastTarget, Fanout, UdpBroadcast},
    server::{serve_datagrams, serve_stream},
    transceiver::{Arbiter, LinkTransceiver},
};


/// Bridge between network clients and a Gree air conditioner's IR remote protocol
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URL of the IR transceiver link
    ///
    /// either serial:///device/path[?baud=N] or tcp+raw://host:port URLs supported
    transceiver: Url,

    /// Address and port to listen on (host:port) for subscribers
    #[arg(long, default_value = "0.0.0.0:1234")]
    listen: SocketAddr,

    /// Where state snapshots are broadcast
    #[arg(long, default_value = "255.255.255.255:1234")]
    broadcast: SocketAddr,

    /// Don't broadcast snapshots
    #[arg(long)]
    no_broadcast: bool,

    /// Also accept commands as datagrams on this address
    #[arg(long)]
    datagram_listen: Option<SocketAddr>,

    /// Settle time around each transmission, in milliseconds
    #[arg(long, default_value_t = 20)]
    settle_ms: u64,

    /// Snapshots buffered per subscriber before new ones are skipped
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u16).range(1..))]
    subscriber_queue: u16,

    /// Disconnect subscribers that send nothing for this many seconds
    #[arg(long)]
    idle_timeout_secs: Option<u64>,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn settings(&self) -> Settings {
        Settings {
            settle: Duration::from_millis(self.settle_ms),
            subscriber_queue: self.subscriber_queue.into(),
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
        }
    }
}


#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level)?;

    let settings = args.settings();

    if let Some(addr) = args.datagram_listen {
        if !args.no_broadcast && addr.port() == args.broadcast.port() {
            bail!("--datagram-listen {addr} would receive the bridge's own broadcasts to {}", args.broadcast);
        }
    }

    let port = Port::open(&args.transceiver).await?.framed();
    tracing::info!(url = %args.transceiver, "transceiver link open");

    let (broadcast, broadcast_from) = if args.no_broadcast {
        (None, None)
    } else {
        let target = UdpBroadcast::bind(args.broadcast).await
            .context("failed to open broadcast socket")?;
        let from = target.local_addr()?;
        tracing::info!(target = %args.broadcast, %from, "broadcasting snapshots");
        (Some(Box::new(target) as Box<dyn BroadcastTarget>), Some(from))
    };

    let listener = TcpListener::bind(args.listen).await
        .with_context(|| format!("failed to listen on {}", args.listen))?;
    tracing::info!(addr = %args.listen, "listening for subscribers");

    let (events_tx, events_rx) = mpsc::channel(64);

    if let Some(addr) = args.datagram_listen {
        let socket = UdpSocket::bind(addr).await
            .with_context(|| format!("failed to bind datagram listener on {addr}"))?;
        tracing::info!(%addr, "listening for command datagrams");

        let events = events_tx.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_datagrams(socket, events, broadcast_from).await {
                tracing::error!("datagram listener stopped: {err:#}");
            }
        });
    }

    let stream_settings = settings.clone();
    tokio::spawn(async move {
        if let Err(err) = serve_stream(listener, events_tx, stream_settings).await {
            tracing::error!("subscriber listener stopped: {err:#}");
        }
    });

    let arbiter = Arbiter::new(LinkTransceiver::new(port), settings.settle);
    let mut controller = Controller::new(arbiter, Fanout::new(broadcast));

    controller.run(events_rx).await
}
