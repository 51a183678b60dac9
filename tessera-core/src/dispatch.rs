//! Administrative action dispatch (the effect publisher).
//!
//! Global parameters are written to the global row with a fresh publish
//! timestamp. Per-cell changes go through `update_cells`, which bumps the
//! cell's `updated_at`. Devices see both on their next poll.

use std::fmt;

use tessera_types::{
    keys, AdminAction, AdminOutcome, CellPatch, EffectKey, EffectSpec, GlobalEffectState, Rgb,
    Timestamp,
};

use crate::catalog::sync_catalog;
use crate::clock::Clock;
use crate::store::{StateStore, StoreError};

/// Longest blink or flash period an operator may set.
pub const MAX_PERIOD_SECS: f32 = 3600.0;

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchError {
    /// The action was rejected before touching the store.
    Invalid(String),
    Store(StoreError),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Invalid(why) => write!(f, "rejected: {}", why),
            DispatchError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<StoreError> for DispatchError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Invalid(why) => DispatchError::Invalid(why),
            other => DispatchError::Store(other),
        }
    }
}

/// Apply one admin action against the store.
pub fn dispatch_admin<S: StateStore + ?Sized>(
    store: &S,
    clock: &dyn Clock,
    catalog: &[EffectSpec],
    action: AdminAction,
) -> Result<AdminOutcome, DispatchError> {
    let name = action.name();
    let result = apply(store, clock, catalog, action);
    match &result {
        Ok(outcome) => log::info!(target: "dispatch", "{}: {:?}", name, outcome),
        Err(e) => log::warn!(target: "dispatch", "{} failed: {}", name, e),
    }
    result
}

fn apply<S: StateStore + ?Sized>(
    store: &S,
    clock: &dyn Clock,
    catalog: &[EffectSpec],
    action: AdminAction,
) -> Result<AdminOutcome, DispatchError> {
    let now = clock.now();
    match action {
        AdminAction::CreateGrid {
            name,
            rows,
            columns,
        } => Ok(AdminOutcome::GridCreated(
            store.insert_grid(name.trim(), rows, columns)?,
        )),

        AdminAction::SyncCatalog => Ok(AdminOutcome::CatalogSynced(sync_catalog(store, catalog)?)),

        AdminAction::ApplyEffectToCells { cells, effect } => {
            require_cells(cells.len())?;
            if let Some(id) = effect {
                store.effect(id)?;
            }
            let n = store.update_cells(&cells, &CellPatch::effect(effect), now)?;
            Ok(AdminOutcome::CellsUpdated(n))
        }

        AdminAction::ApplyGlobalEffect { key } => {
            if key.as_str().trim().is_empty() {
                return Err(DispatchError::Invalid("effect key is empty".into()));
            }
            publish(store, now, |state| state.current_effect = key)
        }

        AdminAction::ReleaseCells { cells } => {
            require_cells(cells.len())?;
            Ok(AdminOutcome::CellsUpdated(store.release_cells(&cells, now)?))
        }

        AdminAction::ReleaseGrid { grid } => {
            Ok(AdminOutcome::CellsUpdated(store.release_grid(grid, now)?))
        }

        AdminAction::SetText { cell, text } => {
            if store.read_cell(cell)?.is_free() {
                return Err(DispatchError::Invalid(format!(
                    "cell {} is not occupied",
                    cell
                )));
            }
            let text = text.trim();
            let text = (!text.is_empty()).then(|| text.to_string());
            let n = store.update_cells(&[cell], &CellPatch::text(text), now)?;
            Ok(AdminOutcome::CellsUpdated(n))
        }

        AdminAction::SetBlinkPalette { colors } => {
            publish(store, now, |state| state.params.blink_colors = colors)
        }

        AdminAction::SetBlinkPeriod { secs } => {
            let secs = require_period(secs)?;
            publish(store, now, |state| state.params.blink_period_secs = secs)
        }

        AdminAction::SetFlashPeriod { secs } => {
            let secs = require_period(secs)?;
            publish(store, now, |state| state.params.flash_period_secs = secs)
        }

        AdminAction::SetLoopAudio { url } => {
            let url = url
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty());
            publish(store, now, |state| state.params.loop_audio_ref = url)
        }

        AdminAction::SetBeatPalette { colors } => {
            require_palette(&colors)?;
            publish(store, now, |state| state.params.beat_palette = colors)
        }

        AdminAction::SetCombinedEffect { components } => {
            if components.is_empty() {
                return Err(DispatchError::Invalid("combined effect needs components".into()));
            }
            if components.iter().any(|k| k.as_str() == keys::COMBINED) {
                return Err(DispatchError::Invalid("combined effect cannot nest itself".into()));
            }
            publish(store, now, |state| {
                state.params.combined = components;
                state.current_effect = EffectKey::new(keys::COMBINED);
            })
        }
    }
}

/// Read-modify-write of the global row with a fresh publish timestamp.
fn publish<S, F>(store: &S, now: Timestamp, update: F) -> Result<AdminOutcome, DispatchError>
where
    S: StateStore + ?Sized,
    F: FnOnce(&mut GlobalEffectState),
{
    let mut state = store.read_global()?;
    update(&mut state);
    state.publish_timestamp = now;
    let stored = store.write_global(&state)?;
    Ok(AdminOutcome::Published(stored.publish_timestamp))
}

fn require_cells(count: usize) -> Result<(), DispatchError> {
    if count == 0 {
        return Err(DispatchError::Invalid("no cells selected".into()));
    }
    Ok(())
}

fn require_period(secs: f32) -> Result<f32, DispatchError> {
    if !secs.is_finite() || secs <= 0.0 || secs > MAX_PERIOD_SECS {
        return Err(DispatchError::Invalid(format!(
            "period must be in (0, {}] seconds (got {})",
            MAX_PERIOD_SECS, secs
        )));
    }
    Ok(secs)
}

fn require_palette(colors: &[Rgb]) -> Result<(), DispatchError> {
    if colors.is_empty() {
        return Err(DispatchError::Invalid("palette needs at least one color".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::store::MemoryStore;
    use std::time::Duration;
    use tessera_types::{CellId, EffectId, SessionToken};

    fn setup() -> (MemoryStore, ManualClock, Vec<EffectSpec>) {
        let catalog = Config::from_toml("").unwrap().catalog().to_vec();
        (MemoryStore::new(), ManualClock::new(Timestamp::from_millis(10_000)), catalog)
    }

    #[test]
    fn global_publish_bumps_timestamp() {
        let (store, clock, catalog) = setup();
        let first = dispatch_admin(&store, &clock, &catalog, AdminAction::ApplyGlobalEffect {
            key: EffectKey::new("apagon"),
        })
        .unwrap();
        // same wall-clock millisecond: still strictly increasing
        let second = dispatch_admin(&store, &clock, &catalog, AdminAction::ApplyGlobalEffect {
            key: EffectKey::new("apagon"),
        })
        .unwrap();
        assert_eq!(first, AdminOutcome::Published(Timestamp::from_millis(10_000)));
        assert_eq!(second, AdminOutcome::Published(Timestamp::from_millis(10_001)));
        assert_eq!(store.read_global().unwrap().current_effect.as_str(), "apagon");
    }

    #[test]
    fn parameter_actions_keep_current_effect() {
        let (store, clock, catalog) = setup();
        dispatch_admin(&store, &clock, &catalog, AdminAction::ApplyGlobalEffect {
            key: EffectKey::new(keys::CUSTOM_BLINK),
        })
        .unwrap();
        clock.advance(Duration::from_millis(5));
        dispatch_admin(&store, &clock, &catalog, AdminAction::SetBlinkPalette {
            colors: vec![Rgb::new(255, 0, 0), Rgb::new(0, 0, 255)],
        })
        .unwrap();

        let global = store.read_global().unwrap();
        assert_eq!(global.current_effect.as_str(), keys::CUSTOM_BLINK);
        assert_eq!(global.params.blink_colors.len(), 2);
        assert_eq!(global.publish_timestamp, Timestamp::from_millis(10_005));
    }

    #[test]
    fn combined_sets_current_effect() {
        let (store, clock, catalog) = setup();
        dispatch_admin(&store, &clock, &catalog, AdminAction::SetCombinedEffect {
            components: vec![EffectKey::new("arcoiris"), EffectKey::new(keys::FLASH_SOS)],
        })
        .unwrap();
        let global = store.read_global().unwrap();
        assert_eq!(global.current_effect.as_str(), keys::COMBINED);
        assert_eq!(global.params.combined.len(), 2);

        let nested = dispatch_admin(&store, &clock, &catalog, AdminAction::SetCombinedEffect {
            components: vec![EffectKey::new(keys::COMBINED)],
        });
        assert!(matches!(nested, Err(DispatchError::Invalid(_))));
    }

    #[test]
    fn set_text_requires_occupied_cell() {
        let (store, clock, catalog) = setup();
        let grid = store.insert_grid("Main", 1, 2).unwrap();
        let cells = store.list_cells(grid.id).unwrap();

        let rejected = dispatch_admin(&store, &clock, &catalog, AdminAction::SetText {
            cell: cells[0].id,
            text: "HOLA".into(),
        });
        assert!(matches!(rejected, Err(DispatchError::Invalid(_))));

        store.claim_cell(grid.id, 0, 0, &SessionToken::new()).unwrap();
        dispatch_admin(&store, &clock, &catalog, AdminAction::SetText {
            cell: cells[0].id,
            text: "HOLA".into(),
        })
        .unwrap();
        let cell = store.read_cell(cells[0].id).unwrap();
        assert_eq!(cell.assigned_text.as_deref(), Some("HOLA"));
        assert_eq!(cell.updated_at, Timestamp::from_millis(10_000));
    }

    #[test]
    fn apply_effect_to_cells_checks_effect() {
        let (store, clock, catalog) = setup();
        let grid = store.insert_grid("Main", 1, 2).unwrap();
        let ids: Vec<CellId> = store.list_cells(grid.id).unwrap().iter().map(|c| c.id).collect();

        let missing = dispatch_admin(&store, &clock, &catalog, AdminAction::ApplyEffectToCells {
            cells: ids.clone(),
            effect: Some(EffectId::new(77)),
        });
        assert!(matches!(missing, Err(DispatchError::Store(StoreError::NotFound(_)))));

        let synced = match dispatch_admin(&store, &clock, &catalog, AdminAction::SyncCatalog).unwrap() {
            AdminOutcome::CatalogSynced(effects) => effects,
            other => panic!("unexpected outcome {:?}", other),
        };
        let outcome = dispatch_admin(&store, &clock, &catalog, AdminAction::ApplyEffectToCells {
            cells: ids.clone(),
            effect: Some(synced[0].id),
        })
        .unwrap();
        assert_eq!(outcome, AdminOutcome::CellsUpdated(2));
        assert_eq!(store.read_cell(ids[1]).unwrap().effect_override, Some(synced[0].id));
    }

    #[test]
    fn invalid_grid_and_periods_are_rejected() {
        let (store, clock, catalog) = setup();
        let grid = dispatch_admin(&store, &clock, &catalog, AdminAction::CreateGrid {
            name: "".into(),
            rows: 2,
            columns: 2,
        });
        assert!(matches!(grid, Err(DispatchError::Invalid(_))));
        let period = dispatch_admin(&store, &clock, &catalog, AdminAction::SetFlashPeriod { secs: 0.0 });
        assert!(matches!(period, Err(DispatchError::Invalid(_))));
        let palette = dispatch_admin(&store, &clock, &catalog, AdminAction::SetBeatPalette { colors: vec![] });
        assert!(matches!(palette, Err(DispatchError::Invalid(_))));
    }

    #[test]
    fn huge_periods_are_rejected_and_leave_params_alone() {
        let (store, clock, catalog) = setup();
        let before = store.read_global().unwrap();

        for secs in [1e30, f32::INFINITY, MAX_PERIOD_SECS + 1.0] {
            let blink = dispatch_admin(&store, &clock, &catalog, AdminAction::SetBlinkPeriod { secs });
            assert!(matches!(blink, Err(DispatchError::Invalid(_))));
        }
        assert_eq!(store.read_global().unwrap(), before);

        let longest = dispatch_admin(&store, &clock, &catalog, AdminAction::SetFlashPeriod {
            secs: MAX_PERIOD_SECS,
        });
        assert!(longest.is_ok());
    }
}
