use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use tessera_types::{
    Cell, CellId, CellPatch, Effect, EffectId, EffectSpec, GlobalEffectState, Grid, GridId,
    Occupancy, SessionToken, Timestamp,
};

use super::{next_publish_timestamp, validate_grid, StateStore, StoreError, StoreResult};

#[derive(Default)]
struct Tables {
    grids: BTreeMap<GridId, Grid>,
    cells: BTreeMap<CellId, Cell>,
    /// (grid, row, column) → cell, the unique position index.
    positions: HashMap<(GridId, u32, u32), CellId>,
    effects: BTreeMap<EffectId, Effect>,
    global: GlobalEffectState,
    next_grid_id: u32,
    next_cell_id: u32,
    next_effect_id: u32,
}

/// In-process store. Every operation runs under one lock, which is what
/// makes `claim_cell` a single atomic update-where-free.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))
    }
}

impl StateStore for MemoryStore {
    fn claim_cell(
        &self,
        grid: GridId,
        row: u32,
        column: u32,
        claimant: &SessionToken,
    ) -> StoreResult<CellId> {
        let mut tables = self.lock()?;
        let id = *tables.positions.get(&(grid, row, column)).ok_or_else(|| {
            StoreError::NotFound(format!("cell ({}, {}) in grid {}", row, column, grid))
        })?;
        let cell = tables
            .cells
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("cell {}", id)))?;
        if cell.occupancy == Occupancy::Occupied {
            return Err(StoreError::Conflict);
        }
        cell.occupancy = Occupancy::Occupied;
        cell.claimed_by = Some(claimant.clone());
        Ok(id)
    }

    fn release_cell(&self, cell: CellId, now: Timestamp) -> StoreResult {
        let mut tables = self.lock()?;
        let cell = tables
            .cells
            .get_mut(&cell)
            .ok_or_else(|| StoreError::NotFound(format!("cell {}", cell)))?;
        cell.release(now);
        Ok(())
    }

    fn read_cell(&self, cell: CellId) -> StoreResult<Cell> {
        self.lock()?
            .cells
            .get(&cell)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("cell {}", cell)))
    }

    fn find_cell(&self, grid: GridId, row: u32, column: u32) -> StoreResult<Cell> {
        let tables = self.lock()?;
        tables
            .positions
            .get(&(grid, row, column))
            .and_then(|id| tables.cells.get(id))
            .cloned()
            .ok_or_else(|| {
                StoreError::NotFound(format!("cell ({}, {}) in grid {}", row, column, grid))
            })
    }

    fn read_global(&self) -> StoreResult<GlobalEffectState> {
        Ok(self.lock()?.global.clone())
    }

    fn write_global(&self, state: &GlobalEffectState) -> StoreResult<GlobalEffectState> {
        let mut tables = self.lock()?;
        let mut stored = state.clone();
        stored.publish_timestamp =
            next_publish_timestamp(state.publish_timestamp, tables.global.publish_timestamp);
        tables.global = stored.clone();
        Ok(stored)
    }

    fn update_cells(
        &self,
        cells: &[CellId],
        patch: &CellPatch,
        now: Timestamp,
    ) -> StoreResult<usize> {
        let mut tables = self.lock()?;
        let mut matched = 0;
        for id in cells {
            if let Some(cell) = tables.cells.get_mut(id) {
                cell.apply(patch, now);
                matched += 1;
            }
        }
        Ok(matched)
    }

    fn release_cells(&self, cells: &[CellId], now: Timestamp) -> StoreResult<usize> {
        let mut tables = self.lock()?;
        let mut matched = 0;
        for id in cells {
            if let Some(cell) = tables.cells.get_mut(id) {
                cell.release(now);
                matched += 1;
            }
        }
        Ok(matched)
    }

    fn release_grid(&self, grid: GridId, now: Timestamp) -> StoreResult<usize> {
        let mut tables = self.lock()?;
        if !tables.grids.contains_key(&grid) {
            return Err(StoreError::NotFound(format!("grid {}", grid)));
        }
        let mut released = 0;
        for cell in tables.cells.values_mut().filter(|c| c.grid_id == grid) {
            if !cell.is_free() {
                released += 1;
            }
            cell.release(now);
        }
        Ok(released)
    }

    fn insert_grid(&self, name: &str, rows: u32, columns: u32) -> StoreResult<Grid> {
        validate_grid(name, rows, columns)?;
        let mut tables = self.lock()?;
        tables.next_grid_id += 1;
        let grid = Grid {
            id: GridId::new(tables.next_grid_id),
            name: name.to_string(),
            rows,
            columns,
        };
        for row in 0..rows {
            for column in 0..columns {
                tables.next_cell_id += 1;
                let id = CellId::new(tables.next_cell_id);
                tables.cells.insert(id, Cell::free(id, grid.id, row, column));
                tables.positions.insert((grid.id, row, column), id);
            }
        }
        tables.grids.insert(grid.id, grid.clone());
        Ok(grid)
    }

    fn list_grids(&self) -> StoreResult<Vec<Grid>> {
        Ok(self.lock()?.grids.values().cloned().collect())
    }

    fn list_cells(&self, grid: GridId) -> StoreResult<Vec<Cell>> {
        let tables = self.lock()?;
        if !tables.grids.contains_key(&grid) {
            return Err(StoreError::NotFound(format!("grid {}", grid)));
        }
        let mut cells: Vec<Cell> = tables
            .cells
            .values()
            .filter(|c| c.grid_id == grid)
            .cloned()
            .collect();
        cells.sort_by_key(|c| (c.row, c.column));
        Ok(cells)
    }

    fn upsert_effects(&self, specs: &[EffectSpec]) -> StoreResult<Vec<Effect>> {
        let mut tables = self.lock()?;
        for spec in specs {
            let existing = tables
                .effects
                .values_mut()
                .find(|e| e.css_key == spec.css_key);
            match existing {
                Some(effect) => {
                    effect.display_name = spec.display_name.clone();
                    effect.description = spec.description.clone();
                }
                None => {
                    tables.next_effect_id += 1;
                    let id = EffectId::new(tables.next_effect_id);
                    tables.effects.insert(
                        id,
                        Effect {
                            id,
                            display_name: spec.display_name.clone(),
                            css_key: spec.css_key.clone(),
                            description: spec.description.clone(),
                        },
                    );
                }
            }
        }
        Ok(tables.effects.values().cloned().collect())
    }

    fn effects(&self) -> StoreResult<Vec<Effect>> {
        Ok(self.lock()?.effects.values().cloned().collect())
    }
}
