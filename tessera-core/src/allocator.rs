//! Cell claim and release.
//!
//! The store's conditional update is the only arbiter of who owns a
//! position. The allocator adds the device-side rules on top: conflicts are
//! final for that position, and a claim whose reply was lost is resolved by
//! re-reading the cell and looking for our own claimant token.

use std::fmt;

use tessera_types::{CellId, GridId, SessionToken, Timestamp};

use crate::store::{StateStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimError {
    /// Someone else holds the position. Pick another one.
    Conflict,
    /// The position does not exist in that grid.
    NotFound(String),
    /// The store could not be reached and ownership could not be confirmed.
    Unreachable(String),
    Store(StoreError),
}

impl fmt::Display for ClaimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimError::Conflict => write!(f, "position already taken"),
            ClaimError::NotFound(what) => write!(f, "no such position: {}", what),
            ClaimError::Unreachable(why) => write!(f, "could not confirm claim: {}", why),
            ClaimError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ClaimError {}

impl From<StoreError> for ClaimError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict => ClaimError::Conflict,
            StoreError::NotFound(what) => ClaimError::NotFound(what),
            StoreError::Unreachable(why) => ClaimError::Unreachable(why),
            other => ClaimError::Store(other),
        }
    }
}

pub struct CellAllocator<'a, S: StateStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: StateStore + ?Sized> CellAllocator<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Claim the position for `claimant`.
    ///
    /// Never retries the same position: a `Conflict` is reported as is.
    pub fn claim(
        &self,
        grid: GridId,
        row: u32,
        column: u32,
        claimant: &SessionToken,
    ) -> Result<CellId, ClaimError> {
        match self.store.claim_cell(grid, row, column, claimant) {
            Ok(cell) => {
                log::info!(target: "allocator", "claimed cell {} at ({}, {}) in grid {}", cell, row, column, grid);
                Ok(cell)
            }
            Err(StoreError::Unreachable(why)) => {
                log::warn!(target: "allocator", "claim outcome unknown ({}), re-reading cell", why);
                self.resolve_ambiguous(grid, row, column, claimant, why)
            }
            Err(StoreError::Conflict) => {
                log::info!(target: "allocator", "position ({}, {}) in grid {} already taken", row, column, grid);
                Err(ClaimError::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn resolve_ambiguous(
        &self,
        grid: GridId,
        row: u32,
        column: u32,
        claimant: &SessionToken,
        why: String,
    ) -> Result<CellId, ClaimError> {
        match self.store.find_cell(grid, row, column) {
            Ok(cell) if cell.is_claimed_by(claimant) => {
                log::info!(target: "allocator", "claim of cell {} confirmed after lost reply", cell.id);
                Ok(cell.id)
            }
            Ok(cell) if !cell.is_free() => Err(ClaimError::Conflict),
            Ok(_) => Err(ClaimError::Unreachable(why)),
            Err(StoreError::Unreachable(again)) => Err(ClaimError::Unreachable(again)),
            Err(e) => Err(e.into()),
        }
    }

    /// Check that `cell` is still held by `claimant` (used when resuming a
    /// saved session).
    pub fn verify(&self, cell: CellId, claimant: &SessionToken) -> Result<bool, StoreError> {
        Ok(self.store.read_cell(cell)?.is_claimed_by(claimant))
    }

    pub fn release(&self, cell: CellId, now: Timestamp) -> Result<(), StoreError> {
        self.store.release_cell(cell, now)?;
        log::info!(target: "allocator", "released cell {}", cell);
        Ok(())
    }
}
