// racelink demo: host or join a room, connect, then stream synthetic car state

use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{debug, info, warn};

use racelink::config::{self, Config, SessionConfig};
use racelink::logging;
use racelink::network::{ControlMessage, RemoteMirror, SessionEvent, StatePacket, WebRtcClient};

#[derive(Debug, PartialEq, Eq)]
enum Mode {
    Host,
    Join(String),
}

#[derive(Debug, PartialEq, Eq)]
struct Cli {
    mode: Mode,
    server: Option<String>,
    debug: bool,
}

enum ParseOutcome {
    Run(Cli),
    Help,
}

fn parse_args(args: &[String]) -> Result<ParseOutcome, String> {
    let mut mode = None;
    let mut server = None;
    let mut debug = false;

    let mut rest = args.iter().skip(1);
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--host" | "-H" => mode = Some(Mode::Host),
            "--join" | "-j" => {
                let code = rest.next().ok_or("--join requires a room code")?;
                mode = Some(Mode::Join(code.clone()));
            }
            "--server" | "-s" => {
                let url = rest.next().ok_or("--server requires a URL")?;
                server = Some(url.clone());
            }
            "--debug" | "-d" => debug = true,
            "--help" | "-h" => return Ok(ParseOutcome::Help),
            other => return Err(format!("Unknown argument: {}", other)),
        }
    }

    let mode = mode.ok_or("choose --host or --join <CODE>")?;
    Ok(ParseOutcome::Run(Cli { mode, server, debug }))
}

fn print_usage(program: &str) {
    println!("racelink - two-player racing session over WebRTC");
    println!();
    println!("Usage:");
    println!("  {} --host                  # Create a room and wait for an opponent", program);
    println!("  {} --join <CODE>           # Join a room by its 4-character code", program);
    println!();
    println!("Options:");
    println!("  --server <URL>   Signaling server (overrides config)");
    println!("  --debug          Write a debug log to {}", logging::LOG_FILE_PATH);
    println!();
    println!("Config file: {}", config::get_config_path().display());
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("racelink");

    let cli = match parse_args(&args) {
        Ok(ParseOutcome::Run(cli)) => cli,
        Ok(ParseOutcome::Help) => {
            print_usage(program);
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            print_usage(program);
            std::process::exit(1);
        }
    };

    logging::init(cli.debug).context("failed to open debug log")?;

    let mut config = config::load_config().unwrap_or_else(|e| {
        warn!("Could not load config ({}), using defaults", e);
        Config::default()
    });
    if let Some(url) = cli.server {
        config.network.signaling_url = url;
    }
    info!("Using signaling server {}", config.network.signaling_url);

    let mut client = WebRtcClient::from_config(&config.network);
    match &cli.mode {
        Mode::Host => {
            let code = client.host().await.context("could not create a room")?;
            println!("🏁 Room code: {}", code);
            println!("   Opponent runs: {} --join {}", program, code);
        }
        Mode::Join(code) => {
            client.join(code).await.context("could not join the room")?;
            println!("🎮 Joined room {}", code.to_ascii_uppercase());
        }
    }

    eprintln!("⏳ Waiting for the connection...");
    let connected = match config.network.negotiation_timeout() {
        Some(limit) => {
            let result = tokio::time::timeout(limit, client.connect()).await;
            match result {
                Ok(connected) => connected,
                Err(_) => {
                    client.cleanup();
                    anyhow::bail!("no connection after {}s", limit.as_secs());
                }
            }
        }
        None => client.connect().await,
    };
    if let Err(e) = connected {
        client.cleanup();
        return Err(e).context("connection failed");
    }
    println!("✅ Connected!");

    let outcome = race(&mut client, &config.session).await;
    client.cleanup();
    outcome
}

/// Frame loop: pump the link, react to events, publish our car
async fn race(client: &mut WebRtcClient, session: &SessionConfig) -> anyhow::Result<()> {
    let frame = session.frame_duration();
    let race_length = Duration::from_secs(session.race_secs);
    let status_every = u64::from(session.frame_rate.max(1));

    let mut car = DemoCar::default();
    let mut mirror = RemoteMirror::new();
    let mut racing = client.is_host();
    let mut frames: u64 = 0;
    let started = Instant::now();

    if client.is_host() {
        client.send_reliable(&ControlMessage::Track { track_index: 0 })?;
        println!("🏎  Race started on track 0");
    }

    loop {
        client.pump(frame).await;

        while let Some(event) = client.next_event() {
            match event {
                SessionEvent::Open => debug!("Session open"),
                SessionEvent::Message(packet) => mirror.overwrite(packet),
                SessionEvent::ReliableMessage(ControlMessage::Track { track_index }) => {
                    println!("🏎  Race started on track {}", track_index);
                    racing = true;
                }
                SessionEvent::ReliableMessage(ControlMessage::Finished) => {
                    println!("🏁 Opponent crossed the line");
                }
                SessionEvent::ReliableMessage(ControlMessage::Quit) => {
                    println!("👋 Opponent left");
                }
                SessionEvent::ReliableMessage(ControlMessage::Unknown) => {}
                SessionEvent::Close(reason) => {
                    println!("Session closed: {:?}", reason);
                    return Ok(());
                }
            }
        }
        if !client.is_connected() {
            return Ok(());
        }

        if racing {
            car.advance();
            if let Err(e) = client.send(&car.packet()) {
                debug!("State packet dropped: {}", e);
            }
            frames += 1;
            if frames % status_every == 0 {
                print_status(&car, &mirror);
            }
        }

        if client.is_host() && started.elapsed() >= race_length {
            client.send_reliable(&ControlMessage::Finished)?;
            println!("🏁 Finished");
            client.quit().await;
            return Ok(());
        }
    }
}

fn print_status(car: &DemoCar, mirror: &RemoteMirror) {
    let me = car.packet();
    match mirror.latest() {
        Some(them) => println!(
            "  you: section {:3} +{:5} | them: section {:3} +{:5}",
            me.section, me.distance, them.section, them.distance
        ),
        None => println!("  you: section {:3} +{:5} | them: no data yet", me.section, me.distance),
    }
}

const SECTION_LENGTH: i32 = 10_000;

/// Scripted car that drives forward and weaves
#[derive(Debug, Default)]
struct DemoCar {
    state: StatePacket,
    tick: i32,
}

impl DemoCar {
    fn advance(&mut self) {
        self.tick = self.tick.wrapping_add(1);
        let s = &mut self.state;

        s.speed = (s.speed + 20).min(4200);
        s.distance += s.speed / 60;
        if s.distance >= SECTION_LENGTH {
            s.distance -= SECTION_LENGTH;
            s.section += 1;
        }
        s.lateral = ((self.tick % 240) - 120) * 2;

        let spin = s.speed / 400;
        s.wheel_front_left = (s.wheel_front_left + spin) % 360;
        s.wheel_front_right = (s.wheel_front_right + spin) % 360;
        s.wheel_rear = (s.wheel_rear + spin) % 360;
    }

    fn packet(&self) -> StatePacket {
        self.state
    }
}
