mod admin;
mod audio_io;
mod network;
mod terminal;

use std::fs::File;
use std::path::PathBuf;

use network::DeviceArgs;

const DEFAULT_BIND: &str = "0.0.0.0:9999";

const USAGE: &str = "\
usage:
  tessera --server [--bind ADDR] [--db PATH]
  tessera --connect ADDR [--grid ID --row R --col C] [--name NAME]
  tessera --admin ADDR <command> [args...]

admin commands:
  create-grid NAME ROWS COLS      sync-catalog
  grids                           cells GRID
  global KEY                      apply CELLS EFFECT_ID|none
  release CELLS                   release-grid GRID
  text CELL TEXT...               combined KEY,KEY,...
  blink-palette #hex,#hex,...     blink-period SECS
  beat-palette #hex,#hex,...      flash-period SECS
  loop-audio URL|none
  wave-start GRID COLUMNS         wave-stop GRID

  -v, --verbose   log at debug level";

fn init_logging(verbose: bool) {
    use simplelog::*;

    let log_level = if verbose { LevelFilter::Debug } else { LevelFilter::Warn };

    let log_path = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tessera")
        .join("tessera.log");

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let log_file = File::create(&log_path).unwrap_or_else(|_| {
        File::create(std::env::temp_dir().join("tessera.log")).expect("Cannot create log file")
    });

    WriteLogger::init(log_level, Config::default(), log_file)
        .expect("Failed to initialize logger");

    log::info!("tessera starting (log level: {:?})", log_level);
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1).cloned())
}

fn flag_number<T: std::str::FromStr>(args: &[String], flag: &str) -> std::io::Result<Option<T>> {
    match flag_value(args, flag) {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} expects a number, got '{}'", flag, raw),
            )
        }),
    }
}

fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "device".to_string())
}

fn main() -> std::io::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let verbose = args.iter().any(|a| a == "--verbose" || a == "-v");

    if args.iter().any(|a| a == "--help" || a == "-h") || args.len() < 2 {
        println!("{}", USAGE);
        return Ok(());
    }

    init_logging(verbose);

    if args.iter().any(|a| a == "--server") {
        let bind = flag_value(&args, "--bind").unwrap_or_else(|| DEFAULT_BIND.to_string());
        let db = flag_value(&args, "--db").map(PathBuf::from);
        return network::run_server(&bind, db);
    }

    if let Some(i) = args.iter().position(|a| a == "--admin") {
        let Some(addr) = args.get(i + 1) else {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        };
        let command: Vec<String> = args[i + 2..]
            .iter()
            .filter(|a| *a != "--verbose" && *a != "-v")
            .cloned()
            .collect();
        return admin::run_admin(addr, &command);
    }

    if let Some(addr) = flag_value(&args, "--connect") {
        let position = match (
            flag_number::<u32>(&args, "--grid")?,
            flag_number::<u32>(&args, "--row")?,
            flag_number::<u32>(&args, "--col")?,
        ) {
            (Some(grid), Some(row), Some(col)) => Some((grid, row, col)),
            (None, None, None) => None,
            _ => {
                eprintln!("--grid, --row and --col go together");
                std::process::exit(2);
            }
        };
        let name = flag_value(&args, "--name").unwrap_or_else(default_device_name);
        return network::run_device(DeviceArgs {
            addr,
            name,
            position,
        });
    }

    eprintln!("{}", USAGE);
    std::process::exit(2);
}
