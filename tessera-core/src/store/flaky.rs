use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tessera_types::{
    Cell, CellId, CellPatch, Effect, EffectId, EffectSpec, GlobalEffectState, Grid, GridId,
    SessionToken, Timestamp,
};

use super::{StateStore, StoreError, StoreResult};

/// Fault-injecting wrapper used by tests and local simulations.
///
/// While offline every call fails with `StoreError::Unreachable`. With
/// `lose_claim_replies` set, a claim is performed by the inner store but
/// reported as unreachable, which is the ambiguous case a device has to
/// resolve by re-reading the cell.
pub struct FlakyStore<S> {
    inner: S,
    offline: AtomicBool,
    lose_claim_replies: AtomicBool,
    failures: AtomicU32,
}

impl<S: StateStore> FlakyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            offline: AtomicBool::new(false),
            lose_claim_replies: AtomicBool::new(false),
            failures: AtomicU32::new(0),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_lose_claim_replies(&self, lose: bool) {
        self.lose_claim_replies.store(lose, Ordering::SeqCst);
    }

    /// Number of calls failed so far.
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn check(&self) -> StoreResult {
        if self.offline.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Unreachable("simulated outage".into()));
        }
        Ok(())
    }
}

impl<S: StateStore> StateStore for FlakyStore<S> {
    fn claim_cell(
        &self,
        grid: GridId,
        row: u32,
        column: u32,
        claimant: &SessionToken,
    ) -> StoreResult<CellId> {
        self.check()?;
        let result = self.inner.claim_cell(grid, row, column, claimant);
        if self.lose_claim_replies.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Unreachable("reply lost".into()));
        }
        result
    }

    fn release_cell(&self, cell: CellId, now: Timestamp) -> StoreResult {
        self.check()?;
        self.inner.release_cell(cell, now)
    }

    fn read_cell(&self, cell: CellId) -> StoreResult<Cell> {
        self.check()?;
        self.inner.read_cell(cell)
    }

    fn find_cell(&self, grid: GridId, row: u32, column: u32) -> StoreResult<Cell> {
        self.check()?;
        self.inner.find_cell(grid, row, column)
    }

    fn read_global(&self) -> StoreResult<GlobalEffectState> {
        self.check()?;
        self.inner.read_global()
    }

    fn write_global(&self, state: &GlobalEffectState) -> StoreResult<GlobalEffectState> {
        self.check()?;
        self.inner.write_global(state)
    }

    fn update_cells(
        &self,
        cells: &[CellId],
        patch: &CellPatch,
        now: Timestamp,
    ) -> StoreResult<usize> {
        self.check()?;
        self.inner.update_cells(cells, patch, now)
    }

    fn release_cells(&self, cells: &[CellId], now: Timestamp) -> StoreResult<usize> {
        self.check()?;
        self.inner.release_cells(cells, now)
    }

    fn release_grid(&self, grid: GridId, now: Timestamp) -> StoreResult<usize> {
        self.check()?;
        self.inner.release_grid(grid, now)
    }

    fn insert_grid(&self, name: &str, rows: u32, columns: u32) -> StoreResult<Grid> {
        self.check()?;
        self.inner.insert_grid(name, rows, columns)
    }

    fn list_grids(&self) -> StoreResult<Vec<Grid>> {
        self.check()?;
        self.inner.list_grids()
    }

    fn list_cells(&self, grid: GridId) -> StoreResult<Vec<Cell>> {
        self.check()?;
        self.inner.list_cells(grid)
    }

    fn upsert_effects(&self, specs: &[EffectSpec]) -> StoreResult<Vec<Effect>> {
        self.check()?;
        self.inner.upsert_effects(specs)
    }

    fn effects(&self) -> StoreResult<Vec<Effect>> {
        self.check()?;
        self.inner.effects()
    }

    fn effect(&self, id: EffectId) -> StoreResult<Effect> {
        self.check()?;
        self.inner.effect(id)
    }
}
