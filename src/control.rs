//! The bridge control loop.
//!
//! One task owns the canonical state, the transceiver and the subscriber
//! set. Network tasks only talk to it through [Event]s, so a state change
//! and the publish that follows it are never interleaved with anything else.

use std::{io, net::SocketAddr};

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::fanout::{Fanout, Subscriber, SubscriberId};
use crate::protocol::{codec::{Capture, Protocol}, message::Command, state::{GreeState, STATE_LENGTH}};
use crate::transceiver::{Arbiter, Transceiver};


/// Something that happened on the network side.
#[derive(Debug)]
pub enum Event {
    Joined(Subscriber),
    Data {
        id: SubscriberId,
        line: Bytes
    },
    Datagram {
        from: SocketAddr,
        payload: Bytes
    },
    Disconnected(SubscriberId),
    TimedOut(SubscriberId),
    Error {
        id: SubscriberId,
        error: io::Error
    },
}


pub struct Controller<T> {
    state: GreeState,
    arbiter: Arbiter<T>,
    fanout: Fanout,

    /// A command changed the state and it has not been sent yet.
    pending: bool,
}

impl<T: Transceiver> Controller<T> {
    pub fn new(arbiter: Arbiter<T>, fanout: Fanout) -> Self {
        Controller {
            state: GreeState::default(),
            arbiter,
            fanout,
            pending: false
        }
    }

    pub fn state(&self) -> &GreeState {
        &self.state
    }

    pub fn fanout(&self) -> &Fanout {
        &self.fanout
    }

    pub fn arbiter(&self) -> &Arbiter<T> {
        &self.arbiter
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::Joined(subscriber) => {
                tracing::info!(id = subscriber.id, addr = %subscriber.addr, "subscriber joined");
                self.fanout.join(subscriber);
            },
            Event::Data { id, line } => {
                tracing::trace!(id, "command line {:?}", String::from_utf8_lossy(&line));
                self.handle_command(&line);
            },
            Event::Datagram { from, payload } => {
                tracing::trace!(%from, "command datagram {:?}", String::from_utf8_lossy(&payload));
                self.handle_command(&payload);
            },
            Event::Disconnected(id) => {
                if self.fanout.leave(id) {
                    tracing::info!(id, "subscriber left");
                }
            },
            Event::TimedOut(id) => {
                if self.fanout.leave(id) {
                    tracing::info!(id, "subscriber timed out");
                }
            },
            Event::Error { id, error } => {
                if self.fanout.leave(id) {
                    tracing::warn!(id, %error, "subscriber dropped after error");
                }
            },
        }
    }

    /// Apply a command line to the state. Malformed lines change nothing.
    pub fn handle_command(&mut self, line: &[u8]) -> bool {
        match Command::parse(line) {
            Ok(command) => {
                tracing::debug!(?command, "command accepted");
                command.apply(&mut self.state);
                self.pending = true;
                true
            },
            Err(err) => {
                tracing::debug!(%err, "malformed command dropped");
                false
            }
        }
    }

    /// Forward a capture of a Gree remote to the subscribers.
    ///
    /// The canonical state is left alone; only the observed state is published.
    pub async fn handle_capture(&mut self, capture: Capture) -> bool {
        if capture.overflow {
            tracing::debug!(protocol = ?capture.protocol, "capture overflowed, dropped");
            tokio::task::yield_now().await;
            return false;
        }

        if capture.protocol != Protocol::Gree {
            tracing::debug!(protocol = ?capture.protocol, "foreign capture dropped");
            return false;
        }

        let Ok(raw) = <[u8; STATE_LENGTH]>::try_from(capture.data.as_slice()) else {
            tracing::debug!(len = capture.data.len(), "malformed Gree capture dropped");
            return false;
        };

        let observed = GreeState::from_raw(raw);

        if !observed.has_valid_checksum() {
            tracing::warn!(?observed, "Gree capture with bad checksum dropped");
            return false;
        }

        tracing::info!("received {observed}");
        self.fanout.publish(&observed);
        true
    }

    /// Transmit the state if a command is waiting, then publish it.
    pub async fn service_pending(&mut self) -> io::Result<()> {
        if !self.pending {
            return Ok(());
        }

        self.arbiter.transmit(&mut self.state).await?;
        tracing::info!("transmitted {}", self.state);

        self.fanout.publish(&self.state);
        self.pending = false;

        Ok(())
    }

    /// Serve events and captures until every event source is gone.
    ///
    /// Losing the transceiver link is an error.
    pub async fn run(&mut self, mut events: mpsc::Receiver<Event>) -> Result<()> {
        self.arbiter.start().await
            .context("failed to enable the IR receiver")?;

        loop {
            self.service_pending().await
                .context("failed to transmit state")?;

            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        tracing::info!("event sources closed, stopping");
                        return Ok(());
                    }
                },
                capture = self.arbiter.next_capture() => match capture.context("transceiver link failed")? {
                    Some(capture) => {
                        self.handle_capture(capture).await;
                    },
                    None => bail!("transceiver link closed"),
                },
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::UdpSocket;

    use crate::fanout::{UdpBroadcast, tests::Recorder};
    use crate::server::serve_datagrams;
    use crate::protocol::message::Snapshot;
    use crate::transceiver::{ArbiterState, tests::{Call, MockTransceiver}};

    use super::*;

    const CAPTURED: [u8; 8] = [0x19, 0x0a, 0x60, 0x50, 0x02, 0x23, 0x00, 0xf0];

    fn controller(transceiver: MockTransceiver) -> Controller<MockTransceiver> {
        Controller::new(Arbiter::new(transceiver, Duration::ZERO), Fanout::new(None))
    }

    fn subscriber(id: SubscriberId) -> (Subscriber, mpsc::Receiver<Snapshot>) {
        let (tx, rx) = mpsc::channel(4);
        (Subscriber::new(id, "192.168.1.20:40000".parse().unwrap(), tx), rx)
    }

    fn gree(data: &[u8]) -> Capture {
        Capture { protocol: Protocol::Gree, overflow: false, data: data.to_vec() }
    }

    #[tokio::test]
    async fn test_command_transmits_and_publishes() {
        let mut controller = controller(MockTransceiver::default());
        let (sub, mut rx) = subscriber(1);

        let (tx, events) = mpsc::channel(8);
        tx.send(Event::Joined(sub)).await.unwrap();
        tx.send(Event::Data { id: 1, line: Bytes::from_static(b"1,0,22,2,0,1,0,0,1,2\r\n") }).await.unwrap();
        drop(tx);

        controller.run(events).await.unwrap();

        assert_eq!(rx.try_recv().unwrap().as_bytes(), b"1,0,25,2,0,1,0,0,1,1\r\n");
        assert!(rx.try_recv().is_err());

        assert!(!controller.is_pending());
        assert!(controller.state().has_valid_checksum());
        assert_eq!(controller.arbiter().state(), ArbiterState::Listening);
        assert_eq!(controller.arbiter().transceiver().calls, vec![
            Call::BeginListening,
            Call::StopListening,
            Call::Prepare,
            Call::Transmit(controller.state().as_bytes().to_vec()),
            Call::Release,
            Call::BeginListening,
        ]);
    }

    #[tokio::test]
    async fn test_short_command_ignored() {
        let mut controller = controller(MockTransceiver::default());
        let (sub, mut rx) = subscriber(1);

        let (tx, events) = mpsc::channel(8);
        tx.send(Event::Joined(sub)).await.unwrap();
        tx.send(Event::Data { id: 1, line: Bytes::from_static(b"1,0,22,2,0,1,0,0,1,") }).await.unwrap();
        drop(tx);

        controller.run(events).await.unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(controller.state(), &GreeState::default());
        assert_eq!(controller.arbiter().transceiver().calls, vec![Call::BeginListening]);
    }

    #[tokio::test]
    async fn test_datagram_command() {
        let mut controller = controller(MockTransceiver::default());

        controller.handle_event(Event::Datagram {
            from: "192.168.1.30:1234".parse().unwrap(),
            payload: Bytes::from_static(b"1,4,28,3,0,0,0,0,0,6\n")
        });
        assert!(controller.is_pending());

        controller.service_pending().await.unwrap();
        assert!(!controller.is_pending());
        assert_eq!(controller.fanout().snapshot().as_bytes(), b"1,4,28,3,0,0,0,0,0,6\r\n");
    }

    #[tokio::test]
    async fn test_capture_forwarded() {
        let recorder = Recorder::default();
        let mut controller = Controller::new(
            Arbiter::new(MockTransceiver::default(), Duration::ZERO),
            Fanout::new(Some(Box::new(recorder.clone())))
        );
        let (sub, mut rx) = subscriber(1);
        controller.handle_event(Event::Joined(sub));

        assert!(controller.handle_capture(gree(&CAPTURED)).await);

        assert_eq!(rx.try_recv().unwrap().as_bytes(), b"1,1,26,1,0,0,1,0,0,2\r\n");
        assert_eq!(recorder.0.lock().unwrap().len(), 1);

        // observed only, nothing sent and the canonical state is unchanged
        assert!(!controller.is_pending());
        assert_eq!(controller.state(), &GreeState::default());
        assert!(controller.arbiter().transceiver().calls.is_empty());
    }

    #[tokio::test]
    async fn test_captures_dropped() {
        let mut controller = controller(MockTransceiver::default());
        let (sub, mut rx) = subscriber(1);
        controller.handle_event(Event::Joined(sub));

        let overflowed = Capture { overflow: true, ..gree(&CAPTURED) };
        assert!(!controller.handle_capture(overflowed).await);

        let foreign = Capture { protocol: Protocol::Kelvinator, ..gree(&CAPTURED) };
        assert!(!controller.handle_capture(foreign).await);

        let unknown = Capture { protocol: Protocol::Other(42), ..gree(&CAPTURED) };
        assert!(!controller.handle_capture(unknown).await);

        assert!(!controller.handle_capture(gree(&CAPTURED[..7])).await);

        let mut corrupted = CAPTURED;
        corrupted[1] ^= 0x01;
        assert!(!controller.handle_capture(gree(&corrupted)).await);

        assert!(rx.try_recv().is_err());
        assert!(controller.fanout().snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_captures_served_by_run_loop() {
        let transceiver = MockTransceiver {
            captures: [gree(&[0; 3]), gree(&CAPTURED)].into(),
            closed: true,
            ..Default::default()
        };
        let mut controller = controller(transceiver);

        let (_tx, events) = mpsc::channel(8);
        let result = controller.run(events).await;

        assert!(result.is_err());
        assert_eq!(controller.fanout().snapshot().as_bytes(), b"1,1,26,1,0,0,1,0,0,2\r\n");
    }

    #[tokio::test]
    async fn test_subscriber_removal() {
        let mut controller = controller(MockTransceiver::default());

        for id in 1..=3 {
            controller.handle_event(Event::Joined(subscriber(id).0));
        }
        assert_eq!(controller.fanout().len(), 3);

        controller.handle_event(Event::Disconnected(1));
        controller.handle_event(Event::TimedOut(2));
        controller.handle_event(Event::Error { id: 3, error: io::ErrorKind::ConnectionReset.into() });
        controller.handle_event(Event::Disconnected(3));

        assert!(controller.fanout().is_empty());
    }

    #[tokio::test]
    async fn test_transmit_failure_stops_loop() {
        let mut controller = controller(MockTransceiver { fail_transmit: true, ..Default::default() });

        let (tx, events) = mpsc::channel(8);
        tx.send(Event::Data { id: 1, line: Bytes::from_static(b"1,1,22,2,0,0,0,0,0,2\r") }).await.unwrap();

        assert!(controller.run(events).await.is_err());
        assert_eq!(controller.arbiter().state(), ArbiterState::Listening);
    }

    #[tokio::test]
    async fn test_own_broadcast_not_a_command() {
        // datagram listener on the port snapshots are broadcast to
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let broadcast = UdpBroadcast::bind(socket.local_addr().unwrap()).await.unwrap();
        let own = broadcast.local_addr().unwrap();

        let arbiter = Arbiter::new(MockTransceiver::default(), Duration::ZERO);
        let mut controller = Controller::new(arbiter, Fanout::new(Some(Box::new(broadcast))));

        let (tx, events) = mpsc::channel(8);
        tokio::spawn(serve_datagrams(socket, tx.clone(), Some(own)));
        tx.send(Event::Data { id: 1, line: Bytes::from_static(b"1,1,22,2,0,0,0,0,0,2\r") }).await.unwrap();

        // the datagram task keeps the loop running
        let _ = tokio::time::timeout(Duration::from_millis(300), controller.run(events)).await;

        let transmissions = controller.arbiter().transceiver().calls.iter()
            .filter(|call| matches!(call, Call::Transmit(_)))
            .count();
        assert_eq!(transmissions, 1);
        assert_eq!(controller.fanout().snapshot().as_bytes(), b"1,1,22,2,0,0,0,0,0,2\r\n");
    }
}
