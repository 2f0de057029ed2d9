//! Access to the IR transceiver and the listen/transmit arbitration around it.

use std::{io, time::Duration};

use futures::{SinkExt, StreamExt};

use crate::config::PortStream;
use crate::protocol::{codec::{Capture, LinkFrame, Protocol, RxFrame}, state::GreeState};


/// Operations of an IR transceiver.
///
/// `next_capture` must be cancel safe; the control loop races it against
/// network events.
#[allow(async_fn_in_trait)]
pub trait Transceiver {
    async fn begin_listening(&mut self) -> io::Result<()>;

    async fn stop_listening(&mut self) -> io::Result<()>;

    /// Drive the line to its idle level ahead of a transmission.
    async fn prepare_channel(&mut self) -> io::Result<()>;

    async fn release_channel(&mut self) -> io::Result<()>;

    async fn transmit(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Next capture from the receiver, `None` once the transceiver is gone.
    async fn next_capture(&mut self) -> io::Result<Option<Capture>>;
}


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArbiterState {
    Listening,
    Transmitting
}

/// Keeps the receiver disabled for the whole of a transmission so the
/// device never captures its own frame.
pub struct Arbiter<T> {
    transceiver: T,
    settle: Duration,
    state: ArbiterState,
}

impl<T: Transceiver> Arbiter<T> {
    pub fn new(transceiver: T, settle: Duration) -> Self {
        Arbiter {
            transceiver,
            settle,
            state: ArbiterState::Listening
        }
    }

    /// Enable the receiver.
    pub async fn start(&mut self) -> io::Result<()> {
        self.transceiver.begin_listening().await?;
        self.state = ArbiterState::Listening;
        Ok(())
    }

    pub fn state(&self) -> ArbiterState {
        self.state
    }

    pub fn transceiver(&self) -> &T {
        &self.transceiver
    }

    pub async fn next_capture(&mut self) -> io::Result<Option<Capture>> {
        self.transceiver.next_capture().await
    }

    /// Send `state` with the receiver disabled, then listen again.
    ///
    /// Listening is resumed even when the transmission fails.
    pub async fn transmit(&mut self, state: &mut GreeState) -> io::Result<()> {
        self.state = ArbiterState::Transmitting;

        let sent = self.transmit_cycle(state).await;
        let resumed = self.transceiver.begin_listening().await;

        self.state = ArbiterState::Listening;

        sent.and(resumed)
    }

    async fn transmit_cycle(&mut self, state: &mut GreeState) -> io::Result<()> {
        self.transceiver.stop_listening().await?;
        self.transceiver.prepare_channel().await?;
        tokio::time::sleep(self.settle).await;

        let frame = state.raw();
        let sent = self.transceiver.transmit(&frame).await;

        tokio::time::sleep(self.settle).await;
        let released = self.transceiver.release_channel().await;

        sent.and(released)
    }
}


/// A transceiver reached over the framed byte link.
pub struct LinkTransceiver {
    port: Box<dyn PortStream>
}

impl LinkTransceiver {
    pub fn new(port: Box<dyn PortStream>) -> Self {
        LinkTransceiver { port }
    }
}

impl Transceiver for LinkTransceiver {
    async fn begin_listening(&mut self) -> io::Result<()> {
        self.port.send(LinkFrame::ListenEnable).await
    }

    async fn stop_listening(&mut self) -> io::Result<()> {
        self.port.send(LinkFrame::ListenDisable).await
    }

    async fn prepare_channel(&mut self) -> io::Result<()> {
        self.port.send(LinkFrame::ChannelPrepare).await
    }

    async fn release_channel(&mut self) -> io::Result<()> {
        self.port.send(LinkFrame::ChannelRelease).await
    }

    async fn transmit(&mut self, frame: &[u8]) -> io::Result<()> {
        self.port.send(LinkFrame::Transmit { protocol: Protocol::Gree, data: frame.to_vec() }).await
    }

    async fn next_capture(&mut self) -> io::Result<Option<Capture>> {
        while let Some(frame) = self.port.next().await {
            match frame? {
                RxFrame::Link(LinkFrame::Capture(capture)) => return Ok(Some(capture)),
                RxFrame::Link(other) => {
                    tracing::debug!(frame = ?other, "ignoring unexpected link frame");
                },
                RxFrame::Corrupted(bytes) => {
                    tracing::warn!("discarding corrupted link frame {:02x?}", bytes);
                }
            }
        }

        Ok(None)
    }
}
