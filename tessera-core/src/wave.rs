//! Column-sweep wave animation.
//!
//! `SweepRegistry` runs on the server and produces frames; `WaveRenderer`
//! runs on each device and holds frames back until their `render_at`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use tessera_types::{GridId, Rgb, Timestamp, WaveFrame};

use crate::config::WaveSettings;
use crate::timer::Ticker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaveError {
    NoColumns,
}

impl fmt::Display for WaveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaveError::NoColumns => write!(f, "a sweep needs at least one column"),
        }
    }
}

impl std::error::Error for WaveError {}

/// One grid's sweep: `columns + 1` steps, the last one highlighting nothing
/// so the final column is cleared before wrapping.
#[derive(Debug, Clone)]
pub struct WaveSweep {
    columns: u32,
    step: u32,
    ticker: Ticker,
}

impl WaveSweep {
    fn steps(&self) -> u32 {
        self.columns + 1
    }

    fn frame(&self, grid: GridId, palette: &[Rgb], render_at: Timestamp) -> WaveFrame {
        let column = (self.step < self.columns).then_some(self.step);
        let color = palette.get(self.step as usize % palette.len().max(1)).copied();
        WaveFrame {
            grid,
            column,
            color,
            render_at,
        }
    }
}

/// All active sweeps, at most one per grid.
pub struct SweepRegistry {
    settings: WaveSettings,
    sweeps: HashMap<GridId, WaveSweep>,
}

impl SweepRegistry {
    pub fn new(settings: WaveSettings) -> Self {
        Self {
            settings,
            sweeps: HashMap::new(),
        }
    }

    /// Start (or restart) the sweep for `grid`. The first frame is emitted
    /// one tick after `now`.
    pub fn start(&mut self, grid: GridId, columns: u32, now: Timestamp) -> Result<(), WaveError> {
        if columns == 0 {
            return Err(WaveError::NoColumns);
        }
        let mut ticker = Ticker::new(self.settings.tick);
        ticker.start_at(now + self.settings.tick);
        let replaced = self
            .sweeps
            .insert(
                grid,
                WaveSweep {
                    columns,
                    step: 0,
                    ticker,
                },
            )
            .is_some();
        log::info!(target: "wave", "sweep started for grid {} ({} columns, replaced: {})", grid, columns, replaced);
        Ok(())
    }

    /// Stop the sweep for `grid`. Returns the clearing frame to broadcast, or
    /// `None` when no sweep was running.
    pub fn stop(&mut self, grid: GridId, now: Timestamp) -> Option<WaveFrame> {
        self.sweeps.remove(&grid)?;
        log::info!(target: "wave", "sweep stopped for grid {}", grid);
        Some(WaveFrame::clear(grid, now + self.settings.render_buffer))
    }

    pub fn is_active(&self, grid: GridId) -> bool {
        self.sweeps.contains_key(&grid)
    }

    pub fn active_count(&self) -> usize {
        self.sweeps.len()
    }

    /// Frames due at `now`, one per sweep whose tick has come.
    pub fn advance(&mut self, now: Timestamp) -> Vec<WaveFrame> {
        let mut frames = Vec::new();
        for (grid, sweep) in self.sweeps.iter_mut() {
            let Some(skipped) = sweep.ticker.due_skipping(now) else {
                continue;
            };
            let steps = sweep.steps() as u64;
            sweep.step = ((sweep.step as u64 + skipped) % steps) as u32;
            frames.push(sweep.frame(*grid, &self.settings.palette, now + self.settings.render_buffer));
            sweep.step = (sweep.step + 1) % sweep.steps();
        }
        frames
    }

    /// Earliest pending tick across all sweeps.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.sweeps.values().filter_map(|s| s.ticker.next_deadline()).min()
    }
}

/// Device-side wave state for one grid position.
///
/// Frames are queued by `render_at` and applied only once that time has
/// passed; when several are due, the newest wins.
#[derive(Debug)]
pub struct WaveRenderer {
    grid: GridId,
    column: u32,
    pending: BTreeMap<Timestamp, WaveFrame>,
    highlight: Option<Rgb>,
}

impl WaveRenderer {
    pub fn new(grid: GridId, column: u32) -> Self {
        Self {
            grid,
            column,
            pending: BTreeMap::new(),
            highlight: None,
        }
    }

    /// Queue a frame. Frames for other grids are ignored.
    pub fn push(&mut self, frame: WaveFrame) {
        if frame.grid == self.grid {
            self.pending.insert(frame.render_at, frame);
        }
    }

    /// Apply due frames. Returns the new highlight when it changed.
    pub fn render(&mut self, now: Timestamp) -> Option<Option<Rgb>> {
        let later = self.pending.split_off(&now.add_millis(1));
        let due = std::mem::replace(&mut self.pending, later);
        let frame = due.into_values().next_back()?;

        let highlight = match frame.column {
            Some(column) if column == self.column => frame.color,
            _ => None,
        };
        if highlight == self.highlight {
            return None;
        }
        self.highlight = highlight;
        Some(highlight)
    }

    pub fn highlight(&self) -> Option<Rgb> {
        self.highlight
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.highlight = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ms(v: i64) -> Timestamp {
        Timestamp::from_millis(v)
    }

    fn registry() -> SweepRegistry {
        SweepRegistry::new(WaveSettings::default())
    }

    #[test]
    fn sweep_walks_columns_then_clears() {
        let mut waves = registry();
        let grid = GridId::new(1);
        waves.start(grid, 2, ms(0)).unwrap();

        assert!(waves.advance(ms(500)).is_empty());
        let columns: Vec<Option<u32>> = (1..=4)
            .flat_map(|i| waves.advance(ms(i * 1_000)))
            .map(|f| f.column)
            .collect();
        assert_eq!(columns, vec![Some(0), Some(1), None, Some(0)]);
    }

    #[test]
    fn frames_alternate_palette_and_carry_render_hint() {
        let mut waves = registry();
        let grid = GridId::new(1);
        waves.start(grid, 3, ms(0)).unwrap();
        let a = waves.advance(ms(1_000)).remove(0);
        let b = waves.advance(ms(2_000)).remove(0);
        assert_eq!(a.render_at, ms(1_200));
        assert_ne!(a.color, b.color);
        assert_eq!(a.color, Some(WaveSettings::default().palette[0]));
    }

    #[test]
    fn stop_is_idempotent() {
        let mut waves = registry();
        let grid = GridId::new(1);
        // stop without start
        assert_eq!(waves.stop(grid, ms(0)), None);

        waves.start(grid, 4, ms(0)).unwrap();
        let clear = waves.stop(grid, ms(100)).unwrap();
        assert!(clear.is_clear());
        assert_eq!(waves.stop(grid, ms(200)), None);
        assert!(waves.advance(ms(5_000)).is_empty());
    }

    #[test]
    fn restart_replaces_sweep() {
        let mut waves = registry();
        let grid = GridId::new(1);
        waves.start(grid, 4, ms(0)).unwrap();
        waves.advance(ms(1_000));
        waves.start(grid, 2, ms(1_500)).unwrap();
        assert_eq!(waves.active_count(), 1);
        assert_eq!(waves.advance(ms(2_500))[0].column, Some(0));
    }

    #[test]
    fn zero_columns_rejected() {
        assert_eq!(registry().start(GridId::new(1), 0, ms(0)), Err(WaveError::NoColumns));
    }

    #[test]
    fn renderer_waits_for_render_at() {
        let grid = GridId::new(1);
        let mut renderer = WaveRenderer::new(grid, 1);
        let red = Rgb::new(255, 0, 0);
        renderer.push(WaveFrame {
            grid,
            column: Some(1),
            color: Some(red),
            render_at: ms(1_200),
        });
        assert_eq!(renderer.render(ms(1_199)), None);
        assert_eq!(renderer.render(ms(1_200)), Some(Some(red)));

        renderer.push(WaveFrame {
            grid,
            column: Some(2),
            color: Some(red),
            render_at: ms(2_200),
        });
        assert_eq!(renderer.render(ms(2_200) + Duration::from_millis(5)), Some(None));
    }

    #[test]
    fn renderer_ignores_other_grids() {
        let mut renderer = WaveRenderer::new(GridId::new(1), 0);
        renderer.push(WaveFrame {
            grid: GridId::new(2),
            column: Some(0),
            color: Some(Rgb::WHITE),
            render_at: ms(0),
        });
        assert_eq!(renderer.render(ms(10)), None);
    }
}
