use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use futures::{SinkExt, StreamExt, TryStreamExt};
use greeir2net::{
    config::PortStream,
    protocol::{
        codec::{Capture, LinkCodec, LinkFrame, Protocol, RxFrame},
        message::Command,
        state::{GreeState, STATE_LENGTH},
    },
};
use tokio::{io::Stdin, net::TcpListener};
use tokio_util::codec::{Framed, FramedRead, LinesCodec};


/// Emulator for the IR transceiver
///
/// Waits for the bridge to connect (as tcp+raw://host:port) and plays the
/// part of the IR hardware. Command lines typed on stdin
/// (P,M,TT,F,U,X,L,S,A,V) are sent to the bridge as if captured from a
/// remote. `overflow` and `foreign` send an overflowed or non-Gree capture.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address and port to listen on (host:port) for the bridge
    #[arg(default_value = "127.0.0.1:4321")]
    listen: SocketAddr,
}


enum Session {
    Disconnected,
    InputClosed,
}


#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let listener = TcpListener::bind(args.listen).await?;
    let mut input = FramedRead::new(tokio::io::stdin(), LinesCodec::new());

    // what the simulated remote last sent
    let mut remote = GreeState::default();

    loop {
        println!("waiting for the bridge on {}", args.listen);

        let (socket, addr) = listener.accept().await?;
        socket.set_nodelay(true)?;

        println!("bridge connected from {addr}");

        let port: Box<dyn PortStream> = Box::new(Framed::new(socket, LinkCodec::new()));

        match transceiver_emulator(port, &mut input, &mut remote).await? {
            Session::Disconnected => println!("bridge disconnected"),
            Session::InputClosed => return Ok(()),
        }
    }
}


async fn transceiver_emulator(
    mut port: Box<dyn PortStream>,
    input: &mut FramedRead<Stdin, LinesCodec>,
    remote: &mut GreeState
) -> Result<Session> {
    let mut listening = false;

    loop {
        tokio::select! {
            frame = port.try_next() => {
                let frame = if let Some(frame) = frame? { frame } else {
                    // stream reached the end
                    return Ok(Session::Disconnected)
                };

                match frame {
                    RxFrame::Link(LinkFrame::ListenEnable) => {
                        listening = true;
                        println!("{}", "receiver enabled".green());
                    },
                    RxFrame::Link(LinkFrame::ListenDisable) => {
                        listening = false;
                        println!("{}", "receiver disabled".yellow());
                    },
                    RxFrame::Link(LinkFrame::ChannelPrepare) => println!("channel prepared"),
                    RxFrame::Link(LinkFrame::ChannelRelease) => println!("channel released"),
                    RxFrame::Link(LinkFrame::Transmit { protocol, data }) => print_transmission(protocol, &data),
                    RxFrame::Link(other) => println!("{}", format!("unexpected frame from bridge: {other:?}").on_red().bright_white()),
                    RxFrame::Corrupted(data) => println!("{}", format!("corrupted frame: {data:02x?}").on_red().bright_white()),
                }
            },
            line = input.next() => {
                let line = match line {
                    Some(line) => line?,
                    None => return Ok(Session::InputClosed),
                };

                let Some(capture) = capture_for(line.trim(), remote) else {
                    println!("{}", format!("not a command: {line:?}").red());
                    continue;
                };

                if !listening {
                    println!("{}", "receiver disabled, capture dropped".yellow());
                    continue;
                }

                println!("captured {:?} {:02x?}", capture.protocol, capture.data);
                port.send(LinkFrame::Capture(capture)).await?;
            },
        }
    }
}

/// The capture a remote would produce for an input line.
fn capture_for(line: &str, remote: &mut GreeState) -> Option<Capture> {
    let (protocol, overflow) = match line {
        "overflow" => (Protocol::Gree, true),
        "foreign" => (Protocol::Kelvinator, false),
        line => {
            let command = Command::parse(format!("{line}\n").as_bytes()).ok()?;
            command.apply(remote);
            (Protocol::Gree, false)
        }
    };

    Some(Capture {
        protocol,
        overflow,
        data: remote.raw().to_vec()
    })
}

fn print_transmission(protocol: Protocol, data: &[u8]) {
    let frame = <[u8; STATE_LENGTH]>::try_from(data).ok().filter(|_| protocol == Protocol::Gree);

    let Some(frame) = frame else {
        println!("{}", format!("TX {protocol:?} {data:02x?}").on_black());
        return;
    };

    let state = GreeState::from_raw(frame);

    let checksum = if state.has_valid_checksum() { "checksum ok".green() } else { "checksum BAD".red() };
    println!("{} {data:02x?} {checksum}", "TX".on_cyan().bright_white());
    println!("   {state}");
}
