//! Operator commands sent to a running server.

use std::io;

use tessera_core::store::StateStore;
use tessera_net::{RemoteStore, WaveClient};
use tessera_types::{AdminAction, AdminOutcome, CellId, EffectId, EffectKey, GridId, Rgb};

#[derive(Debug, Clone, PartialEq)]
pub enum AdminCommand {
    Action(AdminAction),
    ListGrids,
    ListCells(GridId),
    WaveStart { grid: GridId, columns: u32 },
    WaveStop(GridId),
}

fn arg<'a>(args: &'a [String], index: usize, what: &str) -> Result<&'a str, String> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| format!("missing {}", what))
}

fn number<T: std::str::FromStr>(args: &[String], index: usize, what: &str) -> Result<T, String> {
    let raw = arg(args, index, what)?;
    raw.parse()
        .map_err(|_| format!("{} must be a number, got '{}'", what, raw))
}

fn list<T, F>(raw: &str, parse: F) -> Result<Vec<T>, String>
where
    F: Fn(&str) -> Result<T, String>,
{
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse)
        .collect()
}

fn cells(raw: &str) -> Result<Vec<CellId>, String> {
    list(raw, |s| {
        s.parse()
            .map(CellId::new)
            .map_err(|_| format!("bad cell id '{}'", s))
    })
}

fn colors(raw: &str) -> Result<Vec<Rgb>, String> {
    list(raw, |s| s.parse::<Rgb>().map_err(|e| e.to_string()))
}

pub fn parse_command(args: &[String]) -> Result<AdminCommand, String> {
    let name = arg(args, 0, "command")?;
    let action = match name {
        "grids" => return Ok(AdminCommand::ListGrids),
        "cells" => return Ok(AdminCommand::ListCells(GridId::new(number(args, 1, "GRID")?))),
        "wave-start" => {
            return Ok(AdminCommand::WaveStart {
                grid: GridId::new(number(args, 1, "GRID")?),
                columns: number(args, 2, "COLUMNS")?,
            })
        }
        "wave-stop" => return Ok(AdminCommand::WaveStop(GridId::new(number(args, 1, "GRID")?))),
        "create-grid" => AdminAction::CreateGrid {
            name: arg(args, 1, "NAME")?.to_string(),
            rows: number(args, 2, "ROWS")?,
            columns: number(args, 3, "COLS")?,
        },
        "sync-catalog" => AdminAction::SyncCatalog,
        "global" => AdminAction::ApplyGlobalEffect {
            key: EffectKey::new(arg(args, 1, "KEY")?),
        },
        "apply" => {
            let effect = match arg(args, 2, "EFFECT_ID")? {
                "none" => None,
                _ => Some(EffectId::new(number(args, 2, "EFFECT_ID")?)),
            };
            AdminAction::ApplyEffectToCells {
                cells: cells(arg(args, 1, "CELLS")?)?,
                effect,
            }
        }
        "release" => AdminAction::ReleaseCells {
            cells: cells(arg(args, 1, "CELLS")?)?,
        },
        "release-grid" => AdminAction::ReleaseGrid {
            grid: GridId::new(number(args, 1, "GRID")?),
        },
        "text" => {
            let cell = CellId::new(number(args, 1, "CELL")?);
            if args.len() < 3 {
                return Err("missing TEXT".to_string());
            }
            AdminAction::SetText {
                cell,
                text: args[2..].join(" "),
            }
        }
        "blink-palette" => AdminAction::SetBlinkPalette {
            colors: colors(arg(args, 1, "COLORS")?)?,
        },
        "blink-period" => AdminAction::SetBlinkPeriod {
            secs: number(args, 1, "SECS")?,
        },
        "flash-period" => AdminAction::SetFlashPeriod {
            secs: number(args, 1, "SECS")?,
        },
        "beat-palette" => AdminAction::SetBeatPalette {
            colors: colors(arg(args, 1, "COLORS")?)?,
        },
        "loop-audio" => AdminAction::SetLoopAudio {
            url: match arg(args, 1, "URL")? {
                "none" => None,
                url => Some(url.to_string()),
            },
        },
        "combined" => AdminAction::SetCombinedEffect {
            components: list(arg(args, 1, "KEYS")?, |s| Ok(EffectKey::new(s)))?,
        },
        other => return Err(format!("unknown command '{}'", other)),
    };
    Ok(AdminCommand::Action(action))
}

fn describe(outcome: &AdminOutcome) -> String {
    match outcome {
        AdminOutcome::GridCreated(grid) => format!(
            "created grid {} '{}' ({} x {})",
            grid.id, grid.name, grid.rows, grid.columns
        ),
        AdminOutcome::CatalogSynced(effects) => effects
            .iter()
            .map(|e| format!("{:>4}  {:<24} {}", e.id.get(), e.css_key.as_str(), e.display_name))
            .collect::<Vec<_>>()
            .join("\n"),
        AdminOutcome::CellsUpdated(n) => format!("{} cell(s) updated", n),
        AdminOutcome::Published(at) => format!("published at {}", at),
    }
}

fn to_io(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

/// Run one admin command against the server at `addr` and print the result.
pub fn run_admin(addr: &str, args: &[String]) -> io::Result<()> {
    let command = parse_command(args).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    log::info!("admin command {:?} -> {}", command, addr);

    match command {
        AdminCommand::Action(action) => {
            let remote = RemoteStore::connect(addr, "operator")?;
            let outcome = remote.admin(action).map_err(to_io)?;
            println!("{}", describe(&outcome));
            remote.disconnect();
        }
        AdminCommand::ListGrids => {
            let remote = RemoteStore::connect(addr, "operator")?;
            for grid in remote.list_grids().map_err(to_io)? {
                println!("{:>4}  {:<24} {} x {}", grid.id.get(), grid.name, grid.rows, grid.columns);
            }
            remote.disconnect();
        }
        AdminCommand::ListCells(grid) => {
            let remote = RemoteStore::connect(addr, "operator")?;
            for cell in remote.list_cells(grid).map_err(to_io)? {
                println!(
                    "{:>4}  r{} c{}  {:<8} effect={} text={}",
                    cell.id.get(),
                    cell.row,
                    cell.column,
                    if cell.is_free() { "free" } else { "occupied" },
                    cell.effect_override.map_or("-".to_string(), |e| e.to_string()),
                    cell.assigned_text.as_deref().unwrap_or("-"),
                );
            }
            remote.disconnect();
        }
        AdminCommand::WaveStart { grid, columns } => {
            let mut waves = WaveClient::connect(addr, "operator")?;
            waves.start_wave(grid, columns)?;
            println!("wave started on grid {} ({} columns)", grid, columns);
            waves.disconnect();
        }
        AdminCommand::WaveStop(grid) => {
            let mut waves = WaveClient::connect(addr, "operator")?;
            waves.stop_wave(grid)?;
            println!("wave stopped on grid {}", grid);
            waves.disconnect();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::keys;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(String::from).collect()
    }

    fn action(line: &str) -> AdminAction {
        match parse_command(&args(line)) {
            Ok(AdminCommand::Action(action)) => action,
            other => panic!("Expected an action, got {:?}", other),
        }
    }

    #[test]
    fn parses_grid_and_catalog_commands() {
        assert_eq!(
            action("create-grid Main 4 6"),
            AdminAction::CreateGrid {
                name: "Main".to_string(),
                rows: 4,
                columns: 6
            }
        );
        assert_eq!(action("sync-catalog"), AdminAction::SyncCatalog);
        assert_eq!(
            action("release-grid 2"),
            AdminAction::ReleaseGrid { grid: GridId::new(2) }
        );
    }

    #[test]
    fn parses_cell_lists_and_overrides() {
        assert_eq!(
            action("apply 1,2, none"),
            AdminAction::ApplyEffectToCells {
                cells: vec![CellId::new(1), CellId::new(2)],
                effect: None,
            }
        );
        assert_eq!(
            action("apply 4 7"),
            AdminAction::ApplyEffectToCells {
                cells: vec![CellId::new(4)],
                effect: Some(EffectId::new(7)),
            }
        );
        assert_eq!(
            action("release 5,6"),
            AdminAction::ReleaseCells {
                cells: vec![CellId::new(5), CellId::new(6)]
            }
        );
    }

    #[test]
    fn text_joins_the_remaining_words() {
        assert_eq!(
            action("text 3 HOLA MUNDO"),
            AdminAction::SetText {
                cell: CellId::new(3),
                text: "HOLA MUNDO".to_string()
            }
        );
        assert!(parse_command(&args("text 3")).is_err());
    }

    #[test]
    fn parses_global_parameters() {
        assert_eq!(
            action("global arcoiris"),
            AdminAction::ApplyGlobalEffect {
                key: EffectKey::new(keys::RAINBOW)
            }
        );
        assert_eq!(
            action("blink-palette #ff0000,#0000ff"),
            AdminAction::SetBlinkPalette {
                colors: vec![Rgb::new(255, 0, 0), Rgb::new(0, 0, 255)]
            }
        );
        assert_eq!(action("flash-period 0.5"), AdminAction::SetFlashPeriod { secs: 0.5 });
        assert_eq!(action("loop-audio none"), AdminAction::SetLoopAudio { url: None });
        assert_eq!(
            action("combined flash,arcoiris"),
            AdminAction::SetCombinedEffect {
                components: vec![EffectKey::new(keys::FLASH), EffectKey::new(keys::RAINBOW)]
            }
        );
    }

    #[test]
    fn parses_listing_and_wave_commands() {
        assert_eq!(parse_command(&args("grids")), Ok(AdminCommand::ListGrids));
        assert_eq!(
            parse_command(&args("cells 1")),
            Ok(AdminCommand::ListCells(GridId::new(1)))
        );
        assert_eq!(
            parse_command(&args("wave-start 1 8")),
            Ok(AdminCommand::WaveStart {
                grid: GridId::new(1),
                columns: 8
            })
        );
        assert_eq!(
            parse_command(&args("wave-stop 1")),
            Ok(AdminCommand::WaveStop(GridId::new(1)))
        );
    }

    #[test]
    fn rejects_malformed_commands() {
        assert!(parse_command(&[]).is_err());
        assert!(parse_command(&args("explode")).is_err());
        assert!(parse_command(&args("create-grid Main four 6")).is_err());
        assert!(parse_command(&args("blink-palette red")).is_err());
        assert!(parse_command(&args("release 1,x")).is_err());
    }
}
