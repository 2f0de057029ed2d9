//! Network side of the bridge: stream subscribers and command datagrams.
//!
//! Connections run as their own tasks and report everything to the control
//! loop as [Event]s.

use std::{future::Future, io, net::SocketAddr, time::Duration};

use anyhow::Result;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{net::{TcpListener, TcpStream, UdpSocket}, sync::mpsc, time::Instant};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::config::Settings;
use crate::control::Event;
use crate::fanout::{Subscriber, SubscriberId};
use crate::protocol::message::{LineCodec, Snapshot, MAX_LINE_LENGTH};


/// Pause after a failed accept or receive before trying again.
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Run `op` until it succeeds, logging each failure.
async fn retry<T, F, Fut>(what: &str, mut op: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match op().await {
            Ok(value) => return value,
            Err(err) => {
                tracing::warn!(%err, "failed to {what}, retrying");
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}

/// Accept subscribers until the control loop goes away.
pub async fn serve_stream(listener: TcpListener, events: mpsc::Sender<Event>, settings: Settings) -> Result<()> {
    let mut next_id: SubscriberId = 0;

    loop {
        let (socket, addr) = retry("accept connection", || listener.accept()).await;

        if let Err(err) = socket.set_nodelay(true) {
            tracing::debug!(%addr, %err, "failed to set nodelay");
        }

        next_id += 1;
        let id = next_id;

        let (outbound_tx, outbound_rx) = mpsc::channel(settings.subscriber_queue);

        if events.send(Event::Joined(Subscriber::new(id, addr, outbound_tx))).await.is_err() {
            return Ok(());
        }

        tracing::debug!(id, %addr, "new connection");

        tokio::spawn(connection(id, socket, events.clone(), outbound_rx, settings.idle_timeout));
    }
}

async fn connection(
    id: SubscriberId,
    socket: TcpStream,
    events: mpsc::Sender<Event>,
    mut outbound: mpsc::Receiver<Snapshot>,
    idle_timeout: Option<Duration>
) {
    let (rx, tx) = socket.into_split();
    let mut lines = FramedRead::new(rx, LineCodec::new());
    let mut writer = FramedWrite::new(tx, LineCodec::new());

    let mut deadline = idle_timeout.map(|timeout| Instant::now() + timeout);

    let end = loop {
        let idle = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => futures::future::pending().await,
            }
        };

        tokio::select! {
            line = lines.next() => match line {
                Some(Ok(line)) => {
                    deadline = idle_timeout.map(|timeout| Instant::now() + timeout);

                    if events.send(Event::Data { id, line }).await.is_err() {
                        return;
                    }
                },
                Some(Err(error)) => break Event::Error { id, error },
                None => break Event::Disconnected(id),
            },
            snapshot = outbound.recv() => match snapshot {
                Some(snapshot) => {
                    if let Err(error) = writer.send(snapshot).await {
                        break Event::Error { id, error };
                    }
                },
                // dropped by the control loop
                None => return,
            },
            _ = idle => break Event::TimedOut(id),
        }
    };

    tracing::debug!(event = ?end, "connection finished");

    let _ = events.send(end).await;
}


/// Whether a datagram from `from` was sent by the socket bound to `own`.
fn sent_by(own: SocketAddr, from: SocketAddr) -> bool {
    own.port() == from.port() && (own.ip().is_unspecified() || own.ip() == from.ip())
}

/// Feed every datagram received on `socket` to the control loop as a command.
///
/// Datagrams sent from `own`, the bridge's broadcast socket, are its own
/// snapshots and are dropped.
pub async fn serve_datagrams(socket: UdpSocket, events: mpsc::Sender<Event>, own: Option<SocketAddr>) -> Result<()> {
    let mut buf = vec![0u8; MAX_LINE_LENGTH];

    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                tracing::warn!(%err, "failed to receive datagram, retrying");
                tokio::time::sleep(RETRY_DELAY).await;
                continue;
            }
        };

        if own.is_some_and(|own| sent_by(own, from)) {
            tracing::trace!(%from, "own broadcast ignored");
            continue;
        }

        let payload = Bytes::copy_from_slice(&buf[..len]);

        if events.send(Event::Datagram { from, payload }).await.is_err() {
            return Ok(());
        }
    }
}
