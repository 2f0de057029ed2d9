use std::time::Duration;

use futures::{Stream, Sink};
use tokio::net::TcpStream;
use tokio_serial::{SerialStream, SerialPortBuilderExt};
use tokio_util::codec::Framed;
use url::Url;
use anyhow::{Result, Context, bail, anyhow};

use crate::protocol::codec::{RxFrame, LinkFrame, LinkCodec};


pub const DEFAULT_BAUD_RATE: u32 = 115200;


pub enum Port {
    Serial(SerialStream),
    TcpRaw(TcpStream)
}


pub trait PortStream: Stream<Item = std::io::Result<RxFrame>> + Sink<LinkFrame, Error = std::io::Error> + Send + Unpin {}

impl<T> PortStream for T
where
    T: Stream<Item = std::io::Result<RxFrame>> + Sink<LinkFrame, Error = std::io::Error> + Send + Unpin,
{}


impl Port {
    /// Open the transceiver link.
    ///
    /// Either `serial:///device/path[?baud=N]` or `tcp+raw://host:port`.
    pub async fn open(url: &Url) -> Result<Self> {
        match url.scheme() {
            "serial" => {
                let path = url.path();

                let baud = match url.query_pairs().find(|(key, _)| key == "baud") {
                    Some((_, value)) => value.parse::<u32>()
                        .with_context(|| format!("invalid baud rate in url: {url}"))?,
                    None => DEFAULT_BAUD_RATE
                };

                let port = tokio_serial::new(path, baud)
                    .open_native_async()
                    .with_context(|| format!("failed to open serial port {path}"))
                    ?;

                Ok(Self::Serial(port))
            },
            "tcp+raw" => {
                let host = url.host_str()
                    .with_context(|| format!("tcp+raw requires a host to be specified in the url: {url}"))?;

                let port = url.port()
                    .with_context(|| format!("tcp+raw requires a port number to be specified in the url: {url}"))?;

                let stream = TcpStream::connect((host, port)).await
                    .with_context(|| format!("failed to open tcp+raw connection to: {url}"))?;

                stream.set_nodelay(true)?;

                Ok(Self::TcpRaw(stream))
            },
            other => {
                bail!("url scheme {other} not supported");
            }
        }
    }

    pub fn framed(self) -> Box<dyn PortStream> {
        match self {
            Port::Serial(port) => {
                Box::new(Framed::new(port, LinkCodec::new()))
            },
            Port::TcpRaw(stream) => {
                Box::new(Framed::new(stream, LinkCodec::new()))
            }
        }
    }
}


/// Runtime settings for the bridge core.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    /// Pause between preparing the channel and transmitting, and again
    /// between transmitting and releasing it.
    pub settle: Duration,

    /// Snapshots buffered per subscriber before new ones are skipped.
    pub subscriber_queue: usize,

    /// Drop stream clients that stay silent this long.
    pub idle_timeout: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            settle: Duration::from_millis(20),
            subscriber_queue: 2,
            idle_timeout: None,
        }
    }
}


/// Install the global tracing subscriber. `RUST_LOG` takes precedence over `level`.
pub fn init_logging(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level: {level}"))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .map_err(|err| anyhow!("failed to init logging: {err}"))?;

    Ok(())
}
