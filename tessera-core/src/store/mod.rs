//! The shared state store.
//!
//! `StateStore` captures what the system needs from its storage engine
//! (atomic claim, row reads, conditional updates, bulk inserts, upsert by
//! key) independently of where the rows live. `MemoryStore` and
//! `SqliteStore` live here; the network crate provides a remote
//! implementation that forwards every call to a server.

mod flaky;
mod memory;
mod sqlite;

pub use flaky::FlakyStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::fmt;

use serde::{Deserialize, Serialize};

use tessera_types::{
    Cell, CellId, CellPatch, Effect, EffectId, EffectSpec, GlobalEffectState, Grid, GridId,
    SessionToken, Timestamp,
};

/// Result type for store operations.
pub type StoreResult<T = ()> = Result<T, StoreError>;

/// Error from a store operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreError {
    /// A conditional claim lost the race: the position is occupied.
    Conflict,
    NotFound(String),
    /// The store could not be reached. The outcome of a write is unknown.
    Unreachable(String),
    Invalid(String),
    Backend(String),
}

impl StoreError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, StoreError::Unreachable(_))
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Conflict => write!(f, "position already occupied"),
            StoreError::NotFound(what) => write!(f, "not found: {}", what),
            StoreError::Unreachable(why) => write!(f, "store unreachable: {}", why),
            StoreError::Invalid(why) => write!(f, "invalid request: {}", why),
            StoreError::Backend(why) => write!(f, "store backend error: {}", why),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound("row".into()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Storage operations consumed by the allocator, the publisher and devices.
///
/// All methods take `&self`; implementations synchronize internally so one
/// store can be shared between the server's connections.
pub trait StateStore: Send + Sync {
    /// Atomically mark the cell at (grid, row, column) occupied by `claimant`.
    ///
    /// Must be a single conditional operation: of any number of concurrent
    /// claims on a free position exactly one succeeds, the rest get
    /// `StoreError::Conflict`.
    fn claim_cell(
        &self,
        grid: GridId,
        row: u32,
        column: u32,
        claimant: &SessionToken,
    ) -> StoreResult<CellId>;

    /// Free the cell and clear its override, text and claimant.
    fn release_cell(&self, cell: CellId, now: Timestamp) -> StoreResult;

    fn read_cell(&self, cell: CellId) -> StoreResult<Cell>;

    fn find_cell(&self, grid: GridId, row: u32, column: u32) -> StoreResult<Cell>;

    fn read_global(&self) -> StoreResult<GlobalEffectState>;

    /// Replace the global row. The stored publish timestamp is forced to be
    /// strictly greater than the previous one; the stored row is returned.
    fn write_global(&self, state: &GlobalEffectState) -> StoreResult<GlobalEffectState>;

    /// Patch the given cells, bumping their `updated_at`. Returns how many matched.
    fn update_cells(&self, cells: &[CellId], patch: &CellPatch, now: Timestamp)
        -> StoreResult<usize>;

    /// Release the given cells. Returns how many matched.
    fn release_cells(&self, cells: &[CellId], now: Timestamp) -> StoreResult<usize>;

    /// Release every cell of a grid. Returns how many were occupied.
    fn release_grid(&self, grid: GridId, now: Timestamp) -> StoreResult<usize>;

    /// Create a grid and bulk-insert its rows × columns free cells.
    fn insert_grid(&self, name: &str, rows: u32, columns: u32) -> StoreResult<Grid>;

    fn list_grids(&self) -> StoreResult<Vec<Grid>>;

    fn list_cells(&self, grid: GridId) -> StoreResult<Vec<Cell>>;

    /// Insert or update catalog entries keyed by `css_key`. Never deletes.
    fn upsert_effects(&self, specs: &[EffectSpec]) -> StoreResult<Vec<Effect>>;

    fn effects(&self) -> StoreResult<Vec<Effect>>;

    fn effect(&self, id: EffectId) -> StoreResult<Effect> {
        self.effects()?
            .into_iter()
            .find(|e| e.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("effect {}", id)))
    }
}

impl<S: StateStore + ?Sized> StateStore for std::sync::Arc<S> {
    fn claim_cell(
        &self,
        grid: GridId,
        row: u32,
        column: u32,
        claimant: &SessionToken,
    ) -> StoreResult<CellId> {
        (**self).claim_cell(grid, row, column, claimant)
    }

    fn release_cell(&self, cell: CellId, now: Timestamp) -> StoreResult {
        (**self).release_cell(cell, now)
    }

    fn read_cell(&self, cell: CellId) -> StoreResult<Cell> {
        (**self).read_cell(cell)
    }

    fn find_cell(&self, grid: GridId, row: u32, column: u32) -> StoreResult<Cell> {
        (**self).find_cell(grid, row, column)
    }

    fn read_global(&self) -> StoreResult<GlobalEffectState> {
        (**self).read_global()
    }

    fn write_global(&self, state: &GlobalEffectState) -> StoreResult<GlobalEffectState> {
        (**self).write_global(state)
    }

    fn update_cells(
        &self,
        cells: &[CellId],
        patch: &CellPatch,
        now: Timestamp,
    ) -> StoreResult<usize> {
        (**self).update_cells(cells, patch, now)
    }

    fn release_cells(&self, cells: &[CellId], now: Timestamp) -> StoreResult<usize> {
        (**self).release_cells(cells, now)
    }

    fn release_grid(&self, grid: GridId, now: Timestamp) -> StoreResult<usize> {
        (**self).release_grid(grid, now)
    }

    fn insert_grid(&self, name: &str, rows: u32, columns: u32) -> StoreResult<Grid> {
        (**self).insert_grid(name, rows, columns)
    }

    fn list_grids(&self) -> StoreResult<Vec<Grid>> {
        (**self).list_grids()
    }

    fn list_cells(&self, grid: GridId) -> StoreResult<Vec<Cell>> {
        (**self).list_cells(grid)
    }

    fn upsert_effects(&self, specs: &[EffectSpec]) -> StoreResult<Vec<Effect>> {
        (**self).upsert_effects(specs)
    }

    fn effects(&self) -> StoreResult<Vec<Effect>> {
        (**self).effects()
    }

    fn effect(&self, id: EffectId) -> StoreResult<Effect> {
        (**self).effect(id)
    }
}

/// Validate grid dimensions before insertion.
pub(crate) fn validate_grid(name: &str, rows: u32, columns: u32) -> StoreResult {
    if name.trim().is_empty() {
        return Err(StoreError::Invalid("grid name is required".into()));
    }
    if rows == 0 || columns == 0 {
        return Err(StoreError::Invalid(format!(
            "grid must have at least one row and column (got {}x{})",
            rows, columns
        )));
    }
    Ok(())
}

/// The publish timestamp actually stored: strictly after `previous`.
pub(crate) fn next_publish_timestamp(requested: Timestamp, previous: Timestamp) -> Timestamp {
    if requested > previous {
        requested
    } else {
        previous.add_millis(1)
    }
}
