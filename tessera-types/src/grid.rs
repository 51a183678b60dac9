//! Grids, cells and the claimant token.

use serde::{Deserialize, Serialize};

use crate::{CellId, EffectId, GridId, Timestamp};

/// A named rows × columns matrix of spectator positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grid {
    pub id: GridId,
    pub name: String,
    pub rows: u32,
    pub columns: u32,
}

impl Grid {
    pub fn position_count(&self) -> usize {
        self.rows as usize * self.columns as usize
    }

    pub fn contains(&self, row: u32, column: u32) -> bool {
        row < self.rows && column < self.columns
    }
}

/// Whether a cell currently has an occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Occupancy {
    #[default]
    Free,
    Occupied,
}

/// Opaque token identifying the device that claimed a cell.
///
/// Also used to resolve an ambiguous claim: after a failed round-trip the
/// device re-reads the cell and only assumes success if its own token is
/// recorded there.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionToken(pub String);

impl SessionToken {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for SessionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One claimable position within a grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub id: CellId,
    pub grid_id: GridId,
    pub row: u32,
    pub column: u32,
    pub occupancy: Occupancy,
    pub effect_override: Option<EffectId>,
    pub assigned_text: Option<String>,
    #[serde(default)]
    pub claimed_by: Option<SessionToken>,
    /// Bumped by every administrative change to override or text.
    #[serde(default)]
    pub updated_at: Timestamp,
}

impl Cell {
    /// A freshly created, unoccupied cell.
    pub fn free(id: CellId, grid_id: GridId, row: u32, column: u32) -> Self {
        Self {
            id,
            grid_id,
            row,
            column,
            occupancy: Occupancy::Free,
            effect_override: None,
            assigned_text: None,
            claimed_by: None,
            updated_at: Timestamp::ZERO,
        }
    }

    pub fn is_free(&self) -> bool {
        self.occupancy == Occupancy::Free
    }

    pub fn is_claimed_by(&self, token: &SessionToken) -> bool {
        self.occupancy == Occupancy::Occupied && self.claimed_by.as_ref() == Some(token)
    }

    /// Reset to the unoccupied state, clearing override, text and claimant.
    pub fn release(&mut self, now: Timestamp) {
        self.occupancy = Occupancy::Free;
        self.effect_override = None;
        self.assigned_text = None;
        self.claimed_by = None;
        self.updated_at = now;
    }

    /// Apply an administrative patch and bump the revision.
    pub fn apply(&mut self, patch: &CellPatch, now: Timestamp) {
        if let Some(effect) = patch.effect_override {
            self.effect_override = effect;
        }
        if let Some(text) = &patch.assigned_text {
            self.assigned_text = text.clone();
        }
        self.updated_at = now;
    }
}

/// Partial update of a cell's administrative fields.
///
/// `None` leaves a field untouched; `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellPatch {
    pub effect_override: Option<Option<EffectId>>,
    pub assigned_text: Option<Option<String>>,
}

impl CellPatch {
    pub fn effect(effect: Option<EffectId>) -> Self {
        Self {
            effect_override: Some(effect),
            ..Self::default()
        }
    }

    pub fn text(text: Option<String>) -> Self {
        Self {
            assigned_text: Some(text),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn occupied_cell(token: &SessionToken) -> Cell {
        let mut cell = Cell::free(CellId::new(1), GridId::new(1), 0, 0);
        cell.occupancy = Occupancy::Occupied;
        cell.claimed_by = Some(token.clone());
        cell
    }

    #[test]
    fn release_clears_everything() {
        let token = SessionToken::new();
        let mut cell = occupied_cell(&token);
        cell.effect_override = Some(EffectId::new(3));
        cell.assigned_text = Some("A".into());

        cell.release(Timestamp::from_millis(10));
        assert!(cell.is_free());
        assert_eq!(cell.effect_override, None);
        assert_eq!(cell.assigned_text, None);
        assert_eq!(cell.claimed_by, None);
        assert_eq!(cell.updated_at, Timestamp::from_millis(10));
    }

    #[test]
    fn claimed_by_requires_matching_token() {
        let token = SessionToken::new();
        let cell = occupied_cell(&token);
        assert!(cell.is_claimed_by(&token));
        assert!(!cell.is_claimed_by(&SessionToken::new()));
    }

    #[test]
    fn patch_leaves_unset_fields() {
        let mut cell = Cell::free(CellId::new(1), GridId::new(1), 0, 0);
        cell.assigned_text = Some("X".into());
        cell.apply(&CellPatch::effect(Some(EffectId::new(2))), Timestamp::from_millis(5));
        assert_eq!(cell.effect_override, Some(EffectId::new(2)));
        assert_eq!(cell.assigned_text.as_deref(), Some("X"));

        cell.apply(&CellPatch::text(None), Timestamp::from_millis(6));
        assert_eq!(cell.assigned_text, None);
        assert_eq!(cell.updated_at, Timestamp::from_millis(6));
    }

    #[test]
    fn grid_bounds() {
        let grid = Grid { id: GridId::new(1), name: "Main".into(), rows: 2, columns: 3 };
        assert_eq!(grid.position_count(), 6);
        assert!(grid.contains(1, 2));
        assert!(!grid.contains(2, 0));
    }
}
