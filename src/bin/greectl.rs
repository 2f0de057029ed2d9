use std::{str::FromStr, time::{Duration, Instant}};

use anyhow::{Result, Context, bail};
use clap::{Parser, Subcommand};
use colored::{Colorize, ColoredString};
use futures::{Stream, TryStreamExt};
use greeir2net::protocol::{
    codec::delta_ms,
    message::{Command, Snapshot, StateReport, MAX_LINE_LENGTH},
    state::{GreeState, Mode, VerticalSwing, FAN_MAX},
    stdac::{FanSpeed, OperationMode, StdState, SwingV},
};
use strum_macros::EnumString;
use tokio::{io::AsyncWriteExt, net::{TcpStream, UdpSocket}, time::timeout};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};


/// Client for a Gree IR bridge
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Print every state the bridge publishes
    Watch {
        /// Address of the bridge (host:port)
        #[arg(required_unless_present = "udp")]
        addr: Option<String>,

        /// Listen for broadcast states on this UDP port instead of connecting
        #[arg(long, conflicts_with = "addr")]
        udp: Option<u16>,
    },

    /// Change settings, keeping everything not given as it is
    Set {
        /// Address of the bridge (host:port)
        addr: String,

        #[command(flatten)]
        changes: Changes,
    },
}

#[derive(Clone, Copy, Debug, EnumString)]
#[strum(serialize_all = "lowercase")]
enum Toggle {
    On,
    Off
}

impl From<Toggle> for bool {
    fn from(value: Toggle) -> Self {
        matches!(value, Toggle::On)
    }
}

#[derive(clap::Args, Debug)]
struct Changes {
    #[arg(long)]
    power: Option<Toggle>,

    /// auto, cool, heat, dry or fan
    #[arg(long)]
    mode: Option<OperationMode>,

    /// Setpoint in degrees C
    #[arg(long, allow_negative_numbers = true)]
    temp: Option<i32>,

    /// 0-3 or auto, min, low, medium, high, max
    #[arg(long, value_parser = parse_fan)]
    fan: Option<FanSpeed>,

    #[arg(long, num_args = 0..=1, default_missing_value = "on")]
    turbo: Option<Toggle>,

    /// Keep the fan running after cooling to dry the coil
    #[arg(long, num_args = 0..=1, default_missing_value = "on")]
    xfan: Option<Toggle>,

    #[arg(long, num_args = 0..=1, default_missing_value = "on")]
    light: Option<Toggle>,

    #[arg(long, num_args = 0..=1, default_missing_value = "on")]
    sleep: Option<Toggle>,

    /// auto, highest, high, middle, low or lowest
    #[arg(long)]
    swing: Option<SwingV>,
}

fn parse_fan(value: &str) -> Result<FanSpeed, String> {
    match value.parse::<u8>() {
        Ok(speed) if speed <= FAN_MAX => Ok(FanSpeed::from_native(speed)),
        Ok(speed) => Err(format!("fan speed {speed} out of range 0-{FAN_MAX}")),
        Err(_) => FanSpeed::from_str(value).map_err(|_| format!("unknown fan speed {value}")),
    }
}

impl Changes {
    fn apply(&self, command: &mut Command) {
        if let Some(power) = self.power {
            command.power = power.into();
        }
        if let Some(mode) = self.mode {
            command.mode = Mode::from(mode) as u8;
        }
        if let Some(temp) = self.temp {
            command.temperature = temp;
        }
        if let Some(fan) = self.fan {
            command.fan_speed = fan.native().into();
        }
        if let Some(turbo) = self.turbo {
            command.turbo = turbo.into();
        }
        if let Some(xfan) = self.xfan {
            command.xfan = xfan.into();
        }
        if let Some(light) = self.light {
            command.light = light.into();
        }
        if let Some(sleep) = self.sleep {
            command.sleep = sleep.into();
        }
        if let Some(swing) = self.swing {
            let swing = VerticalSwing::from(swing);
            command.swing_auto = swing.is_automatic();
            command.swing_position = swing.position();
        }
    }
}


#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Action::Watch { udp: Some(port), .. } => watch_broadcasts(port).await,
        Action::Watch { addr: Some(addr), .. } => watch_stream(&addr).await,
        Action::Watch { .. } => bail!("either an address or --udp is required"),
        Action::Set { addr, changes } => set(&addr, &changes).await,
    }
}


fn describe(report: &StateReport) -> String {
    let state = StdState::from(report);

    fn toggle(name: &str, on: bool) -> ColoredString {
        if on { name.bright_white().bold() } else { name.dimmed() }
    }

    let power = if state.power { "ON ".green().bold() } else { "OFF".red().bold() };

    let mode = format!("{:<4}", state.mode.to_string());
    let mode = match state.mode {
        OperationMode::Cool => mode.cyan(),
        OperationMode::Heat => mode.red(),
        OperationMode::Dry => mode.yellow(),
        OperationMode::Fan => mode.white(),
        OperationMode::Auto => mode.green(),
    };

    let celsius = state.celsius;
    let fan = state.fan.to_string();
    let swing = state.swing_v.to_string();

    format!(
        "{power} {mode} {celsius:>2}C  fan {fan:<6} swing {swing:<7} {} {} {} {}",
        toggle("turbo", state.turbo),
        toggle("clean", state.clean),
        toggle("light", state.light),
        toggle("sleep", state.sleep),
    )
}

fn print_state(start_time: Instant, from: &str, line: &str) {
    let elapsed_ms = delta_ms(Some(start_time));

    match line.parse::<StateReport>() {
        Ok(report) => println!("[{elapsed_ms:8}] {from}: {}", describe(&report)),
        Err(err) => println!("{}", format!("[{elapsed_ms:8}] {from}: unreadable state {line:?}: {err}").on_red().bright_white()),
    }
}

async fn watch_stream(addr: &str) -> Result<()> {
    let stream = TcpStream::connect(addr).await
        .with_context(|| format!("failed to connect to {addr}"))?;

    let start_time = Instant::now();
    let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    while let Some(line) = lines.try_next().await? {
        print_state(start_time, addr, &line);
    }

    println!("connection closed");

    Ok(())
}

async fn watch_broadcasts(port: u16) -> Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", port)).await
        .with_context(|| format!("failed to listen on udp port {port}"))?;

    let start_time = Instant::now();
    let mut buf = [0u8; MAX_LINE_LENGTH];

    loop {
        let (len, from) = socket.recv_from(&mut buf).await?;
        let line = String::from_utf8_lossy(&buf[..len]);

        print_state(start_time, &from.to_string(), &line);
    }
}

async fn set(addr: &str, changes: &Changes) -> Result<()> {
    let stream = TcpStream::connect(addr).await
        .with_context(|| format!("failed to connect to {addr}"))?;
    stream.set_nodelay(true)?;

    let (rx, mut tx) = stream.into_split();
    let mut lines = FramedRead::new(rx, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    // the bridge greets new subscribers with its current state, unless it has none yet
    let mut command = match timeout(Duration::from_millis(500), lines.try_next()).await {
        Ok(line) => {
            let line = line?.context("bridge closed the connection")?;
            Command::from(&line.parse::<StateReport>()?)
        },
        Err(_) => Command::from(&GreeState::default()),
    };

    changes.apply(&mut command);

    let line = command.to_line();
    tx.write_all(line.as_bytes()).await?;
    println!("sent {}", line.trim_end().bold());

    let start_time = Instant::now();
    let line = timeout(Duration::from_secs(5), published(&mut lines, &expected_line(&command))).await
        .context("bridge published no state after the command")??;

    print_state(start_time, addr, &line);

    Ok(())
}

/// The snapshot the bridge publishes once it has applied `command`.
///
/// A command sets every field, so the result doesn't depend on the state it
/// is applied to.
fn expected_line(command: &Command) -> String {
    let mut state = GreeState::default();
    command.apply(&mut state);

    Snapshot::of(&state).to_string().trim_end().to_owned()
}

/// Read lines until `expected` shows up, skipping any other state such as a
/// greeting that arrived late.
async fn published<S>(lines: &mut S, expected: &str) -> Result<String>
where
    S: Stream<Item = Result<String, LinesCodecError>> + Unpin,
{
    while let Some(line) = lines.try_next().await? {
        if line == expected {
            return Ok(line);
        }
        println!("{}", format!("skipping earlier state {line}").dimmed());
    }

    bail!("bridge closed the connection")
}
