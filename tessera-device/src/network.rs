//! Server mode and device mode.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossterm::event::KeyCode;

use tessera_core::clock::SystemClock;
use tessera_core::config::Config;
use tessera_core::device::hardware::{Hardware, NullHardware};
use tessera_core::device::{DeviceEvent, DeviceRuntime, DeviceStatus, ReleaseReason};
use tessera_core::dispatch::dispatch_admin;
use tessera_core::store::{MemoryStore, SqliteStore, StateStore};
use tessera_net::session_file::{self, SavedDevice};
use tessera_net::{NetServer, RemoteStore, WaveClient};
use tessera_types::{AdminAction, GridId, Timestamp};

use crate::audio_io::{CpalMicrophone, LoopPlayer};
use crate::terminal::{DeviceScreen, SharedScreen, TerminalSurface};

const FRAME_INTERVAL: Duration = Duration::from_millis(33);
const KEY_POLL: Duration = Duration::from_millis(5);

fn to_io(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

// =============================================================================
// Server Mode
// =============================================================================

pub fn run_server(bind: &str, db: Option<PathBuf>) -> io::Result<()> {
    log::info!("Starting Tessera server mode");

    let config = Config::load();
    let store: Arc<dyn StateStore> = match db {
        Some(path) => {
            log::info!("Using database {}", path.display());
            Arc::new(SqliteStore::open(&path).map_err(to_io)?)
        }
        None => Arc::new(MemoryStore::new()),
    };

    let catalog = config.catalog().to_vec();
    if let Err(e) = dispatch_admin(&*store, &SystemClock, &catalog, AdminAction::SyncCatalog) {
        log::warn!("Initial catalog sync failed: {}", e);
    }

    let mut server = NetServer::bind(bind, store, config.wave(), catalog)?;
    println!("tessera server listening on {}", server.local_addr()?);

    loop {
        server.pump();
        thread::sleep(Duration::from_millis(2));
    }
}

// =============================================================================
// Device Mode
// =============================================================================

pub struct DeviceArgs {
    pub addr: String,
    pub name: String,
    /// `(grid, row, column)` to claim when there is no saved session to resume.
    pub position: Option<(u32, u32, u32)>,
}

/// Why the device loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Quit,
    Released(ReleaseReason),
}

pub fn run_device(mut args: DeviceArgs) -> io::Result<()> {
    log::info!("Starting Tessera device '{}' against {}", args.name, args.addr);

    let config = Config::load();
    let store = RemoteStore::connect(&args.addr, &args.name)?;
    let screen_state = SharedScreen::default();
    let hardware = Hardware {
        surface: Box::new(TerminalSurface::new(screen_state.clone())),
        torch: Box::new(NullHardware),
        audio: Box::new(LoopPlayer::new()),
        microphone: Box::new(CpalMicrophone::new()),
    };
    let mut runtime = DeviceRuntime::new(store, hardware, &config.device(), &config.beat());

    let mut waves = WaveClient::connect(&args.addr, &args.name)?;
    let mut screen = DeviceScreen::new()?;
    let mut choosing_again = false;

    loop {
        if let Err(e) = take_position(&mut runtime, &args) {
            if !choosing_again {
                return Err(e);
            }
            println!("{}", e);
            match prompt_position()? {
                Some(position) => {
                    args.position = Some(position);
                    continue;
                }
                None => break,
            }
        }
        let Some(session) = runtime.session().cloned() else {
            return Err(to_io("no position held"));
        };
        persist(&runtime, &args);
        if let Err(e) = waves.join(session.grid) {
            log::warn!("Could not join wave room for grid {}: {}", session.grid, e);
        }

        screen.start()?;
        let result = device_loop(&mut runtime, &mut waves, &mut screen, &screen_state, &args);
        let stopped = screen.stop();

        match result {
            Ok(LoopExit::Quit) => {
                runtime.exit(Timestamp::now());
                session_file::clear_session();
                stopped?;
                println!("left cell {}", session.cell);
                break;
            }
            Ok(LoopExit::Released(reason)) => {
                session_file::clear_session();
                stopped?;
                println!("cell {} released ({:?})", session.cell, reason);
                match prompt_position()? {
                    Some(position) => {
                        args.position = Some(position);
                        choosing_again = true;
                    }
                    None => break,
                }
            }
            Err(e) => {
                // The claim stays in the store and the session file for a resume.
                runtime.suspend();
                return Err(e);
            }
        }
    }
    waves.disconnect();
    Ok(())
}

fn prompt_position() -> io::Result<Option<(u32, u32, u32)>> {
    read_position(&mut io::stdin().lock(), &mut io::stdout())
}

/// Ask for `grid row col` until three numbers or an empty line arrive.
fn read_position(input: &mut impl BufRead, out: &mut impl Write) -> io::Result<Option<(u32, u32, u32)>> {
    loop {
        write!(out, "grid row col to take another position (empty to quit): ")?;
        out.flush()?;
        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let numbers: Vec<u32> = line
            .split_whitespace()
            .map_while(|word| word.parse().ok())
            .collect();
        match (line.trim().is_empty(), numbers.as_slice()) {
            (true, _) => return Ok(None),
            (false, [grid, row, col]) if line.split_whitespace().count() == 3 => {
                return Ok(Some((*grid, *row, *col)))
            }
            _ => writeln!(out, "expected three numbers, e.g. 1 0 2")?,
        }
    }
}

/// Resume the saved session when it matches, otherwise claim `args.position`.
fn take_position<S: StateStore>(runtime: &mut DeviceRuntime<S>, args: &DeviceArgs) -> io::Result<()> {
    let now = Timestamp::now();
    let saved = session_file::load_session().filter(|s| s.server_addr == args.addr);

    if let Some(saved) = saved {
        let wanted = args.position.map_or(true, |(grid, row, column)| {
            saved.session.grid == GridId::new(grid)
                && saved.session.row == row
                && saved.session.column == column
        });
        if wanted {
            match runtime.resume(saved.session, now) {
                Ok(true) => return Ok(()),
                Ok(false) => session_file::clear_session(),
                Err(e) => log::warn!("Could not verify saved session: {}", e),
            }
        }
    }

    let Some((grid, row, column)) = args.position else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "no saved position to resume; pass --grid, --row and --col",
        ));
    };
    runtime
        .claim(GridId::new(grid), row, column, now)
        .map(|cell| log::info!("Claimed cell {}", cell))
        .map_err(|e| to_io(format!("cannot take row {} column {}: {}", row, column, e)))
}

fn persist<S: StateStore>(runtime: &DeviceRuntime<S>, args: &DeviceArgs) {
    let Some(session) = runtime.session() else {
        return;
    };
    let saved = SavedDevice {
        server_addr: args.addr.clone(),
        device_name: args.name.clone(),
        session: session.clone(),
    };
    if let Err(e) = session_file::save_session(&saved) {
        log::warn!("Could not save session: {}", e);
    }
}

fn device_loop<S: StateStore>(
    runtime: &mut DeviceRuntime<S>,
    waves: &mut WaveClient,
    screen: &mut DeviceScreen,
    screen_state: &SharedScreen,
    args: &DeviceArgs,
) -> io::Result<LoopExit> {
    let mut last_frame = Instant::now().checked_sub(FRAME_INTERVAL).unwrap_or_else(Instant::now);

    loop {
        let now = Timestamp::now();

        for frame in waves.poll_frames() {
            runtime.on_wave(frame);
        }

        for event in runtime.tick(now) {
            match event {
                DeviceEvent::Released(reason) => return Ok(LoopExit::Released(reason)),
                DeviceEvent::Activated { ref effect, execute_at } => {
                    log::info!("Activated '{}' (anchored at {})", effect, execute_at);
                    persist(runtime, args);
                }
                DeviceEvent::CapabilityUnavailable(failure) => {
                    log::warn!("{} unavailable: {}", failure.controller, failure.error);
                }
                other => log::debug!("{:?}", other),
            }
        }

        if last_frame.elapsed() >= FRAME_INTERVAL {
            last_frame = Instant::now();
            let state = screen_state.lock().map(|s| s.clone()).unwrap_or_default();
            let status = status_line(&args.name, &runtime.status(), waves.is_connected(), now);
            screen.draw(&state, &status, now)?;
        }

        if let Some(KeyCode::Char('q') | KeyCode::Esc) = screen.poll_key(KEY_POLL)? {
            return Ok(LoopExit::Quit);
        }
    }
}

/// One-line summary shown at the bottom of the device screen.
fn status_line(name: &str, status: &DeviceStatus, wave_link: bool, now: Timestamp) -> String {
    let mut parts = vec![name.to_string()];
    if let Some(session) = &status.session {
        parts.push(format!(
            "grid {} cell {} (row {}, col {})",
            session.grid, session.cell, session.row, session.column
        ));
    }
    parts.push(
        status
            .applied
            .as_ref()
            .map_or("waiting".to_string(), |key| key.to_string()),
    );
    if let Some((key, at)) = &status.pending {
        parts.push(format!("next {} in {:.1}s", key, now.until(*at).as_secs_f32()));
    }
    if status.reconnecting {
        parts.push(format!("reconnecting ({} failed polls)", status.consecutive_failures));
    }
    if !wave_link {
        parts.push("wave link down".to_string());
    }
    parts.push("q to leave".to_string());
    parts.join(" | ")
}
