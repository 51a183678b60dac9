//! # tessera-core
//!
//! Engine library for Tessera: the store every party shares, the operator's
//! publish path, and the device runtime that turns published effects into
//! synchronized hardware output.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tessera_core::config::Config;
//! use tessera_core::device::{hardware::NullHardware, DeviceRuntime};
//! use tessera_core::store::MemoryStore;
//! use tessera_types::Timestamp;
//!
//! let config = Config::load();
//! let store = MemoryStore::new();
//! let grid = store.insert_grid("Main", 4, 8)?;
//!
//! let mut device = DeviceRuntime::new(store, NullHardware::build(), &config.device(), &config.beat());
//! device.claim(grid.id, 0, 3, Timestamp::now())?;
//! loop {
//!     for event in device.tick(Timestamp::now()) {
//!         // show claim/activation/reconnect status
//!     }
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`store`] - `StateStore` trait with memory and SQLite implementations
//! - [`allocator`] - atomic claim/release of grid positions
//! - [`dispatch`] - `dispatch_admin()`, the operator's single entry point
//! - [`catalog`] - effect catalog sync and id → key lookup
//! - [`device`] - `DeviceRuntime`: poller, synchronized scheduler, hardware traits
//! - [`controllers`] - the controller bank (text, blink, flash, audio, beat)
//! - [`wave`] - server-side column sweeps and the device-side renderer
//! - [`timer`] - token-based one-shot slots and fixed-cadence tickers
//! - [`config`] - TOML configuration (embedded defaults + user override)
//! - [`clock`] - wall and manual clocks

pub mod allocator;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod controllers;
pub mod device;
pub mod dispatch;
pub mod store;
pub mod timer;
pub mod wave;
