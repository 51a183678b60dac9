//! # tessera-types
//!
//! Shared type definitions for the Tessera workspace.
//! This crate contains the data model used by tessera-core, tessera-net and
//! the device binary: grids, cells, the effect catalog, the global effect
//! row, wave frames and administrative actions.

pub mod action;
mod color;
pub mod effect;
mod grid;
mod time;
mod wave;

pub use action::{AdminAction, AdminOutcome};
pub use color::{ParseColorError, Rgb};
pub use effect::{
    keys, Effect, EffectKey, EffectKind, EffectParams, EffectSpec, FlashPattern,
    GlobalEffectState, DEFAULT_BEAT_PALETTE,
};
pub use grid::{Cell, CellPatch, Grid, Occupancy, SessionToken};
pub use time::Timestamp;
pub use wave::WaveFrame;

/// Unique identifier for a grid (a named rows × columns matrix).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct GridId(u32);

impl GridId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
    pub fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for GridId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a cell. Cell ids are unique across all grids.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct CellId(u32);

impl CellId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
    pub fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for CellId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a catalog effect.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct EffectId(u32);

impl EffectId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
    pub fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for EffectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
