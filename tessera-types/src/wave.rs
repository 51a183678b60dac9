use serde::{Deserialize, Serialize};

use crate::{GridId, Rgb, Timestamp};

/// One step of a column sweep, broadcast to every device joined to a grid.
///
/// Devices must not repaint before `render_at`. A frame with no column
/// clears any residual highlight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveFrame {
    pub grid: GridId,
    pub column: Option<u32>,
    pub color: Option<Rgb>,
    pub render_at: Timestamp,
}

impl WaveFrame {
    pub fn clear(grid: GridId, render_at: Timestamp) -> Self {
        Self {
            grid,
            column: None,
            color: None,
            render_at,
        }
    }

    pub fn is_clear(&self) -> bool {
        self.column.is_none()
    }
}
