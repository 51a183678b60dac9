//! Network layer for Tessera.
//!
//! One TCP server holds the shared store. Devices and operators reach it
//! through `RemoteStore` (store and admin calls) and `WaveClient` (wave room
//! subscription and sweep control).

pub mod client;
pub mod framing;
pub mod protocol;
pub mod server;
pub mod session_file;

pub use client::{RemoteStore, WaveClient};
pub use protocol::{ClientId, ClientMessage, ServerMessage, StoreRequest, StoreValue};
pub use server::NetServer;
pub use session_file::SavedDevice;
