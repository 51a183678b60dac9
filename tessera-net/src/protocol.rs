//! Wire protocol between devices, operators and the server.
//!
//! Store calls are mirrored one-to-one as `StoreRequest` variants so a
//! remote party sees the same `StateStore` the server holds. Wave updates
//! are pushed only to clients that joined the grid's room.

use serde::{Deserialize, Serialize};

use tessera_core::store::{StateStore, StoreResult};
use tessera_types::{
    AdminAction, AdminOutcome, Cell, CellId, CellPatch, Effect, EffectSpec, GlobalEffectState,
    Grid, GridId, SessionToken, Timestamp, WaveFrame,
};

/// Unique identifier for a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl ClientId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Messages from clients to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Must be the first message on a connection.
    Hello { client_name: String },
    /// Subscribe to wave updates for a grid. Replaces any previous room.
    Join { grid: GridId },
    Leave,
    StartWave { grid: GridId, columns: u32 },
    StopWave { grid: GridId },
    Store { request_id: u64, request: StoreRequest },
    Admin { request_id: u64, action: AdminAction },
    Ping,
    Goodbye,
}

/// Messages from the server to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    Welcome { client_id: ClientId },
    Joined { grid: GridId },
    WaveUpdate { frame: WaveFrame },
    StoreReply { request_id: u64, reply: StoreResult<StoreValue> },
    AdminReply { request_id: u64, result: Result<AdminOutcome, String> },
    Pong,
    Error { message: String },
    Shutdown,
}

/// One `StateStore` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreRequest {
    ClaimCell { grid: GridId, row: u32, column: u32, claimant: SessionToken },
    ReleaseCell { cell: CellId, now: Timestamp },
    ReadCell { cell: CellId },
    FindCell { grid: GridId, row: u32, column: u32 },
    ReadGlobal,
    WriteGlobal { state: GlobalEffectState },
    UpdateCells { cells: Vec<CellId>, patch: CellPatch, now: Timestamp },
    ReleaseCells { cells: Vec<CellId>, now: Timestamp },
    ReleaseGrid { grid: GridId, now: Timestamp },
    InsertGrid { name: String, rows: u32, columns: u32 },
    ListGrids,
    ListCells { grid: GridId },
    UpsertEffects { specs: Vec<EffectSpec> },
    Effects,
}

/// The successful value of a `StoreRequest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreValue {
    Done,
    CellId(CellId),
    Cell(Cell),
    Global(GlobalEffectState),
    Count(usize),
    Grid(Grid),
    Grids(Vec<Grid>),
    Cells(Vec<Cell>),
    Effects(Vec<Effect>),
}

impl StoreRequest {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            StoreRequest::ClaimCell { .. } => "claim-cell",
            StoreRequest::ReleaseCell { .. } => "release-cell",
            StoreRequest::ReadCell { .. } => "read-cell",
            StoreRequest::FindCell { .. } => "find-cell",
            StoreRequest::ReadGlobal => "read-global",
            StoreRequest::WriteGlobal { .. } => "write-global",
            StoreRequest::UpdateCells { .. } => "update-cells",
            StoreRequest::ReleaseCells { .. } => "release-cells",
            StoreRequest::ReleaseGrid { .. } => "release-grid",
            StoreRequest::InsertGrid { .. } => "insert-grid",
            StoreRequest::ListGrids => "list-grids",
            StoreRequest::ListCells { .. } => "list-cells",
            StoreRequest::UpsertEffects { .. } => "upsert-effects",
            StoreRequest::Effects => "effects",
        }
    }

    /// Run the call against a local store.
    pub fn execute<S: StateStore + ?Sized>(self, store: &S) -> StoreResult<StoreValue> {
        Ok(match self {
            StoreRequest::ClaimCell {
                grid,
                row,
                column,
                claimant,
            } => StoreValue::CellId(store.claim_cell(grid, row, column, &claimant)?),
            StoreRequest::ReleaseCell { cell, now } => {
                store.release_cell(cell, now)?;
                StoreValue::Done
            }
            StoreRequest::ReadCell { cell } => StoreValue::Cell(store.read_cell(cell)?),
            StoreRequest::FindCell { grid, row, column } => {
                StoreValue::Cell(store.find_cell(grid, row, column)?)
            }
            StoreRequest::ReadGlobal => StoreValue::Global(store.read_global()?),
            StoreRequest::WriteGlobal { state } => StoreValue::Global(store.write_global(&state)?),
            StoreRequest::UpdateCells { cells, patch, now } => {
                StoreValue::Count(store.update_cells(&cells, &patch, now)?)
            }
            StoreRequest::ReleaseCells { cells, now } => {
                StoreValue::Count(store.release_cells(&cells, now)?)
            }
            StoreRequest::ReleaseGrid { grid, now } => StoreValue::Count(store.release_grid(grid, now)?),
            StoreRequest::InsertGrid {
                name,
                rows,
                columns,
            } => StoreValue::Grid(store.insert_grid(&name, rows, columns)?),
            StoreRequest::ListGrids => StoreValue::Grids(store.list_grids()?),
            StoreRequest::ListCells { grid } => StoreValue::Cells(store.list_cells(grid)?),
            StoreRequest::UpsertEffects { specs } => StoreValue::Effects(store.upsert_effects(&specs)?),
            StoreRequest::Effects => StoreValue::Effects(store.effects()?),
        })
    }
}
