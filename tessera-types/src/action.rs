//! Administrative actions.
//!
//! Every action reduces to store operations plus a timestamp bump: global
//! parameters bump the publish timestamp, per-cell changes bump the cell's
//! `updated_at`. Devices pick both up by polling.

use serde::{Deserialize, Serialize};

use crate::{CellId, Effect, EffectId, EffectKey, Grid, GridId, Rgb, Timestamp};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AdminAction {
    CreateGrid {
        name: String,
        rows: u32,
        columns: u32,
    },
    /// Upsert the predefined catalog by key.
    SyncCatalog,
    /// Set (or clear, with `None`) the per-cell effect override.
    ApplyEffectToCells {
        cells: Vec<CellId>,
        effect: Option<EffectId>,
    },
    ApplyGlobalEffect {
        key: EffectKey,
    },
    ReleaseCells {
        cells: Vec<CellId>,
    },
    ReleaseGrid {
        grid: GridId,
    },
    /// Assign text to a single occupied cell.
    SetText {
        cell: CellId,
        text: String,
    },
    SetBlinkPalette {
        colors: Vec<Rgb>,
    },
    SetBlinkPeriod {
        secs: f32,
    },
    SetFlashPeriod {
        secs: f32,
    },
    SetLoopAudio {
        url: Option<String>,
    },
    SetBeatPalette {
        colors: Vec<Rgb>,
    },
    /// Publish the combined effect composed of the given component keys.
    SetCombinedEffect {
        components: Vec<EffectKey>,
    },
}

impl AdminAction {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            AdminAction::CreateGrid { .. } => "create-grid",
            AdminAction::SyncCatalog => "sync-catalog",
            AdminAction::ApplyEffectToCells { .. } => "apply-effect-to-cells",
            AdminAction::ApplyGlobalEffect { .. } => "apply-global-effect",
            AdminAction::ReleaseCells { .. } => "release-cells",
            AdminAction::ReleaseGrid { .. } => "release-grid",
            AdminAction::SetText { .. } => "set-text",
            AdminAction::SetBlinkPalette { .. } => "set-blink-palette",
            AdminAction::SetBlinkPeriod { .. } => "set-blink-period",
            AdminAction::SetFlashPeriod { .. } => "set-flash-period",
            AdminAction::SetLoopAudio { .. } => "set-loop-audio",
            AdminAction::SetBeatPalette { .. } => "set-beat-palette",
            AdminAction::SetCombinedEffect { .. } => "set-combined-effect",
        }
    }
}

/// Result of a successfully dispatched admin action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AdminOutcome {
    GridCreated(Grid),
    CatalogSynced(Vec<Effect>),
    CellsUpdated(usize),
    Published(Timestamp),
}
