//! Delivery of the current state snapshot to subscribers.

use std::{collections::BTreeMap, io, net::SocketAddr};

use tokio::{net::UdpSocket, sync::mpsc::{self, error::TrySendError}};

use crate::protocol::{message::Snapshot, state::GreeState};


pub type SubscriberId = u64;

/// A connected stream consumer.
#[derive(Debug)]
pub struct Subscriber {
    pub id: SubscriberId,
    pub addr: SocketAddr,
    outbound: mpsc::Sender<Snapshot>
}

impl Subscriber {
    pub fn new(id: SubscriberId, addr: SocketAddr, outbound: mpsc::Sender<Snapshot>) -> Self {
        Subscriber { id, addr, outbound }
    }

    /// Queue `snapshot` if there is room right now.
    fn offer(&self, snapshot: &Snapshot) -> bool {
        match self.outbound.try_send(snapshot.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::trace!(id = self.id, "subscriber busy, snapshot skipped");
                false
            },
            Err(TrySendError::Closed(_)) => {
                tracing::trace!(id = self.id, "subscriber closed, snapshot skipped");
                false
            }
        }
    }
}


/// Best-effort datagram delivery.
pub trait BroadcastTarget: Send {
    fn broadcast(&self, payload: &[u8]) -> io::Result<()>;
}

pub struct UdpBroadcast {
    socket: UdpSocket,
    target: SocketAddr
}

impl UdpBroadcast {
    pub async fn bind(target: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.set_broadcast(true)?;
        socket.writable().await?;

        Ok(UdpBroadcast { socket, target })
    }

    /// The address snapshots are sent from.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl BroadcastTarget for UdpBroadcast {
    fn broadcast(&self, payload: &[u8]) -> io::Result<()> {
        self.socket.try_send_to(payload, self.target).map(|_| ())
    }
}


/// Holds the most recent snapshot and the set of subscribers.
pub struct Fanout {
    snapshot: Snapshot,
    subscribers: BTreeMap<SubscriberId, Subscriber>,
    broadcast: Option<Box<dyn BroadcastTarget>>,
}

impl Fanout {
    pub fn new(broadcast: Option<Box<dyn BroadcastTarget>>) -> Self {
        Fanout {
            snapshot: Snapshot::default(),
            subscribers: BTreeMap::new(),
            broadcast
        }
    }

    /// Render `state` as the new snapshot and offer it to everyone.
    ///
    /// Returns the number of subscribers that took it.
    pub fn publish(&mut self, state: &GreeState) -> usize {
        self.snapshot = Snapshot::of(state);

        let delivered = self.subscribers.values()
            .filter(|subscriber| subscriber.offer(&self.snapshot))
            .count();

        if let Some(target) = &self.broadcast {
            if let Err(err) = target.broadcast(self.snapshot.as_bytes()) {
                tracing::debug!(%err, "snapshot broadcast failed");
            }
        }

        tracing::trace!(delivered, subscribers = self.subscribers.len(), "published {}", self.snapshot.to_string().trim_end());

        delivered
    }

    /// Add a subscriber and bring it up to date.
    pub fn join(&mut self, subscriber: Subscriber) {
        if !self.snapshot.is_empty() {
            subscriber.offer(&self.snapshot);
        }

        self.subscribers.insert(subscriber.id, subscriber);
    }

    pub fn leave(&mut self, id: SubscriberId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}


#[cfg(test)]
pub(crate) mod tests {
    use std::{sync::{Arc, Mutex}, time::Duration};

    use crate::protocol::state::Mode;

    use super::*;

    /// Collects broadcast payloads.
    #[derive(Clone, Default)]
    pub(crate) struct Recorder(pub Arc<Mutex<Vec<Vec<u8>>>>);

    impl BroadcastTarget for Recorder {
        fn broadcast(&self, payload: &[u8]) -> io::Result<()> {
            self.0.lock().unwrap().push(payload.to_vec());
            Ok(())
        }
    }

    fn subscriber(id: SubscriberId, capacity: usize) -> (Subscriber, mpsc::Receiver<Snapshot>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Subscriber::new(id, "127.0.0.1:5000".parse().unwrap(), tx), rx)
    }

    fn cooling(celsius: i32) -> GreeState {
        let mut state = GreeState::default();
        state.set_power(true);
        state.set_mode(Mode::Cool as u8);
        state.set_temperature(celsius);
        state
    }

    #[test]
    fn test_late_joiner_gets_latest_snapshot() {
        let mut fanout = Fanout::new(None);
        fanout.publish(&cooling(20));
        fanout.publish(&cooling(22));

        let (late, mut rx) = subscriber(1, 2);
        fanout.join(late);

        let snapshot = rx.try_recv().unwrap();
        assert_eq!(snapshot.as_bytes(), b"1,1,22,0,0,0,0,0,0,0\r\n");
        assert_eq!(&snapshot, fanout.snapshot());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_join_before_first_publish() {
        let mut fanout = Fanout::new(None);

        let (early, mut rx) = subscriber(1, 2);
        fanout.join(early);
        assert!(rx.try_recv().is_err());

        assert_eq!(fanout.publish(&cooling(24)), 1);
        assert_eq!(rx.try_recv().unwrap(), Snapshot::of(&cooling(24)));
    }

    #[test]
    fn test_busy_subscriber_skipped() {
        let mut fanout = Fanout::new(None);

        let (slow, mut slow_rx) = subscriber(1, 1);
        let (fast, mut fast_rx) = subscriber(2, 4);
        fanout.join(slow);
        fanout.join(fast);

        assert_eq!(fanout.publish(&cooling(18)), 2);
        assert_eq!(fanout.publish(&cooling(19)), 1);

        assert_eq!(slow_rx.try_recv().unwrap(), Snapshot::of(&cooling(18)));
        assert!(slow_rx.try_recv().is_err());

        assert_eq!(fast_rx.try_recv().unwrap(), Snapshot::of(&cooling(18)));
        assert_eq!(fast_rx.try_recv().unwrap(), Snapshot::of(&cooling(19)));

        // room again, so the next one gets through
        assert_eq!(fanout.publish(&cooling(21)), 2);
        assert_eq!(slow_rx.try_recv().unwrap(), Snapshot::of(&cooling(21)));
    }

    #[test]
    fn test_leave() {
        let mut fanout = Fanout::new(None);

        let (gone, mut rx) = subscriber(7, 2);
        fanout.join(gone);
        assert_eq!(fanout.len(), 1);

        assert!(fanout.leave(7));
        assert!(!fanout.leave(7));
        assert!(fanout.is_empty());

        assert_eq!(fanout.publish(&cooling(23)), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_subscriber_skipped() {
        let mut fanout = Fanout::new(None);

        let (closed, rx) = subscriber(1, 2);
        drop(rx);
        fanout.join(closed);

        assert_eq!(fanout.publish(&cooling(23)), 0);
        assert_eq!(fanout.len(), 1);
    }

    #[test]
    fn test_broadcast() {
        let recorder = Recorder::default();
        let mut fanout = Fanout::new(Some(Box::new(recorder.clone())));

        fanout.publish(&GreeState::default());

        let sent = recorder.0.lock().unwrap();
        assert_eq!(sent.as_slice(), &[b"0,0,25,0,0,0,0,0,0,0\r\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_udp_broadcast() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = UdpBroadcast::bind(receiver.local_addr().unwrap()).await.unwrap();

        target.broadcast(b"1,1,22,0,0,0,0,0,0,0\r\n").unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), receiver.recv_from(&mut buf)).await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"1,1,22,0,0,0,0,0,0,0\r\n");
    }
}
