//! The device side: claim a position, poll, schedule, drive hardware.
//!
//! `DeviceRuntime` is a cooperative loop. The caller invokes `tick(now)`
//! repeatedly; every poll round, scheduled activation, animation step and
//! wave repaint happens inside that call. Force-release, explicit exit and
//! a claim superseded by a new one all end in `teardown`.

pub mod hardware;
mod poller;
mod scheduler;

pub use poller::{resolve_effect, DevicePoller, PollOutcome, ResolvedEffect, Revision};
pub use scheduler::{EffectScheduler, PendingActivation};

use serde::{Deserialize, Serialize};
use tessera_types::{CellId, EffectKey, GridId, Rgb, SessionToken, Timestamp, WaveFrame};

use crate::allocator::{CellAllocator, ClaimError};
use crate::config::{BeatSettings, DeviceSettings};
use crate::controllers::{ActivationFailure, ActivationPlan, ControllerBank};
use crate::store::{StateStore, StoreError};
use crate::wave::WaveRenderer;
use hardware::Hardware;

/// The position a device holds, as persisted between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSession {
    pub grid: GridId,
    pub cell: CellId,
    pub row: u32,
    pub column: u32,
    pub token: SessionToken,
    #[serde(default)]
    pub last_applied: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// The device asked to leave.
    Exited,
    /// The store shows the cell free, gone, or held by another claimant.
    ForceReleased,
    /// The device stopped but left its claim in the store for a later resume.
    Suspended,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Claimed(CellId),
    Resumed(CellId),
    Scheduled {
        effect: EffectKey,
        execute_at: Timestamp,
    },
    Activated {
        effect: EffectKey,
        execute_at: Timestamp,
    },
    CapabilityUnavailable(ActivationFailure),
    Reconnecting,
    Reconnected,
    Released(ReleaseReason),
}

/// A snapshot for display.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    pub session: Option<DeviceSession>,
    pub applied: Option<EffectKey>,
    pub pending: Option<(EffectKey, Timestamp)>,
    pub reconnecting: bool,
    pub consecutive_failures: u32,
    pub wave: Option<Rgb>,
}

pub struct DeviceRuntime<S: StateStore> {
    store: S,
    session: Option<DeviceSession>,
    poller: DevicePoller,
    scheduler: EffectScheduler,
    bank: ControllerBank,
    wave: Option<WaveRenderer>,
    applied: Option<EffectKey>,
}

impl<S: StateStore> DeviceRuntime<S> {
    pub fn new(store: S, hardware: Hardware, device: &DeviceSettings, beat: &BeatSettings) -> Self {
        Self {
            store,
            session: None,
            poller: DevicePoller::new(device.poll_interval, device.reconnect_after_failures),
            scheduler: EffectScheduler::new(device.synch_delay),
            bank: ControllerBank::new(hardware, device, beat),
            wave: None,
            applied: None,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn session(&self) -> Option<&DeviceSession> {
        self.session.as_ref()
    }

    pub fn bank(&self) -> &ControllerBank {
        &self.bank
    }

    /// Claim a position with a fresh claimant token.
    ///
    /// A device holds one position at a time; a held one is released first.
    pub fn claim(
        &mut self,
        grid: GridId,
        row: u32,
        column: u32,
        now: Timestamp,
    ) -> Result<CellId, ClaimError> {
        if self.session.is_some() {
            self.exit(now);
        }
        let token = SessionToken::new();
        let cell = CellAllocator::new(&self.store).claim(grid, row, column, &token)?;
        self.begin(
            DeviceSession {
                grid,
                cell,
                row,
                column,
                token,
                last_applied: None,
            },
            now,
        );
        Ok(cell)
    }

    /// Pick up a saved session if the store still shows the cell held by
    /// its token. Returns `false` (and keeps nothing) otherwise.
    pub fn resume(&mut self, saved: DeviceSession, now: Timestamp) -> Result<bool, StoreError> {
        let held = match CellAllocator::new(&self.store).verify(saved.cell, &saved.token) {
            Ok(held) => held,
            Err(StoreError::NotFound(_)) => false,
            Err(e) => return Err(e),
        };
        if !held {
            log::info!(target: "device", "saved cell {} is no longer ours", saved.cell);
            return Ok(false);
        }
        if self.session.is_some() {
            self.teardown(ReleaseReason::Exited);
        }
        log::info!(target: "device", "resumed cell {} in grid {}", saved.cell, saved.grid);
        self.begin(saved, now);
        Ok(true)
    }

    fn begin(&mut self, session: DeviceSession, now: Timestamp) {
        self.poller.reset();
        self.poller.start(now);
        self.wave = Some(WaveRenderer::new(session.grid, session.column));
        self.session = Some(session);
    }

    /// Release the position and stop everything. No-op when unclaimed.
    ///
    /// The store row is only freed while it still carries our token, so a
    /// device that lost its cell never frees the new occupant's.
    pub fn exit(&mut self, now: Timestamp) -> Option<DeviceEvent> {
        let session = self.session.as_ref()?;
        let (cell, token) = (session.cell, session.token.clone());
        let allocator = CellAllocator::new(&self.store);
        match allocator.verify(cell, &token) {
            Ok(true) => {
                if let Err(e) = allocator.release(cell, now) {
                    log::warn!(target: "device", "could not release cell {}: {}", cell, e);
                }
            }
            Ok(false) => log::info!(target: "device", "cell {} already left our hands", cell),
            Err(e) => log::warn!(target: "device", "could not release cell {}: {}", cell, e),
        }
        Some(self.teardown(ReleaseReason::Exited))
    }

    /// Stop everything without touching the store. The position stays
    /// claimed so a later run can resume it.
    pub fn suspend(&mut self) -> Option<DeviceEvent> {
        self.session.as_ref()?;
        Some(self.teardown(ReleaseReason::Suspended))
    }

    fn teardown(&mut self, reason: ReleaseReason) -> DeviceEvent {
        if let Some(pending) = self.scheduler.cancel() {
            log::debug!(target: "device", "dropping pending '{}'", pending.effect.key);
        }
        self.poller.reset();
        self.bank.stop_all();
        self.wave = None;
        self.applied = None;
        if let Some(session) = self.session.take() {
            log::info!(target: "device", "left cell {} ({:?})", session.cell, reason);
        }
        DeviceEvent::Released(reason)
    }

    /// Queue a wave frame pushed by the server.
    pub fn on_wave(&mut self, frame: WaveFrame) {
        if let Some(wave) = self.wave.as_mut() {
            wave.push(frame);
        }
    }

    /// One pass of the device loop.
    pub fn tick(&mut self, now: Timestamp) -> Vec<DeviceEvent> {
        let mut events = Vec::new();
        let Some((cell, token)) = self.session.as_ref().map(|s| (s.cell, s.token.clone())) else {
            return events;
        };

        if self.poller.is_due(now) {
            let was_reconnecting = self.poller.is_reconnecting();
            match self.poller.poll(&self.store, cell, &token) {
                PollOutcome::Changed(resolved) => {
                    events.push(DeviceEvent::Scheduled {
                        effect: resolved.key.clone(),
                        execute_at: resolved.revision.anchor() + self.scheduler.synch_delay(),
                    });
                    self.scheduler.schedule(resolved, now);
                }
                PollOutcome::Released => {
                    log::warn!(target: "device", "cell {} is no longer ours", cell);
                    events.push(self.teardown(ReleaseReason::ForceReleased));
                    return events;
                }
                PollOutcome::Unchanged | PollOutcome::Stale | PollOutcome::Failed { .. } => {}
            }
            match (was_reconnecting, self.poller.is_reconnecting()) {
                (false, true) => events.push(DeviceEvent::Reconnecting),
                (true, false) => events.push(DeviceEvent::Reconnected),
                _ => {}
            }
        }

        if let Some(pending) = self.scheduler.due(now) {
            events.extend(self.activate(pending, now));
        }

        self.bank.tick(now);
        if let Some(highlight) = self.wave.as_mut().and_then(|w| w.render(now)) {
            self.bank.set_wave(highlight);
        }
        events
    }

    fn activate(&mut self, pending: PendingActivation, now: Timestamp) -> Vec<DeviceEvent> {
        let effect = pending.effect;
        log::info!(
            target: "device",
            "activating '{}' (due {}, late by {:?})",
            effect.key,
            pending.execute_at,
            now.saturating_since(pending.execute_at)
        );
        let plan = ActivationPlan::build(&effect.key, &effect.params, effect.text.as_deref());
        let failures = self.bank.activate(plan, now);
        if let Some(session) = self.session.as_mut() {
            session.last_applied = Some(effect.revision.anchor());
        }
        self.applied = Some(effect.key.clone());

        let mut events = vec![DeviceEvent::Activated {
            effect: effect.key,
            execute_at: pending.execute_at,
        }];
        events.extend(failures.into_iter().map(DeviceEvent::CapabilityUnavailable));
        events
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            session: self.session.clone(),
            applied: self.applied.clone(),
            pending: self
                .scheduler
                .pending()
                .map(|p| (p.effect.key.clone(), p.execute_at)),
            reconnecting: self.poller.is_reconnecting(),
            consecutive_failures: self.poller.consecutive_failures(),
            wave: self.wave.as_ref().and_then(|w| w.highlight()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FlakyStore, MemoryStore};
    use hardware::{HardwareOp, TestHardware};
    use std::sync::Arc;
    use tessera_types::{keys, GlobalEffectState};

    fn ms(v: i64) -> Timestamp {
        Timestamp::from_millis(v)
    }

    fn runtime<S: StateStore>(store: S, hw: &TestHardware) -> DeviceRuntime<S> {
        DeviceRuntime::new(store, hw.build(), &DeviceSettings::default(), &BeatSettings::default())
    }

    fn publish(store: &impl StateStore, key: &str, at: i64) {
        store
            .write_global(&GlobalEffectState {
                current_effect: EffectKey::new(key),
                publish_timestamp: ms(at),
                ..Default::default()
            })
            .unwrap();
    }

    fn activated(events: &[DeviceEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                DeviceEvent::Activated { effect, .. } => Some(effect.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn devices_activate_together_regardless_of_poll_time() {
        let store = Arc::new(MemoryStore::new());
        let grid = store.insert_grid("Main", 1, 2).unwrap();
        publish(&store, "arcoiris", 10_000);

        let (hw_a, hw_b) = (TestHardware::new(), TestHardware::new());
        let mut a = runtime(store.clone(), &hw_a);
        let mut b = runtime(store.clone(), &hw_b);
        a.claim(grid.id, 0, 0, ms(10_050)).unwrap();
        b.claim(grid.id, 0, 1, ms(10_400)).unwrap();

        assert!(a.tick(ms(10_050)).contains(&DeviceEvent::Scheduled {
            effect: EffectKey::new("arcoiris"),
            execute_at: ms(12_500),
        }));
        b.tick(ms(10_400));

        assert!(activated(&a.tick(ms(12_499))).is_empty());
        assert!(activated(&b.tick(ms(12_499))).is_empty());
        assert_eq!(activated(&a.tick(ms(12_500))), vec!["arcoiris"]);
        assert_eq!(activated(&b.tick(ms(12_500))), vec!["arcoiris"]);
        assert_eq!(hw_a.last_mode(), hw_b.last_mode());
    }

    #[test]
    fn sparse_polling_applies_only_the_latest_publish() {
        let store = MemoryStore::new();
        let grid = store.insert_grid("Main", 1, 1).unwrap();
        let hw = TestHardware::new();
        let mut device = runtime(store, &hw);
        device.claim(grid.id, 0, 0, ms(0)).unwrap();

        publish(device.store(), "apagon", 1_000);
        publish(device.store(), "parpadeo", 1_100);
        publish(device.store(), "rojo-pulsante", 1_200);

        let mut applied = Vec::new();
        for t in (0..=5_000).step_by(100) {
            for event in device.tick(ms(t)) {
                if let DeviceEvent::Activated { effect, .. } = event {
                    applied.push(effect.as_str().to_string());
                }
            }
        }
        // The first poll at t=0 saw only the last publish.
        assert_eq!(applied, vec!["rojo-pulsante"]);
        assert_eq!(device.session().unwrap().last_applied, Some(ms(1_200)));
    }

    #[test]
    fn newer_publish_replaces_a_pending_one() {
        let store = MemoryStore::new();
        let grid = store.insert_grid("Main", 1, 1).unwrap();
        let hw = TestHardware::new();
        let mut device = runtime(store, &hw);
        device.claim(grid.id, 0, 0, ms(0)).unwrap();

        publish(device.store(), "apagon", 100);
        device.tick(ms(500));
        publish(device.store(), "arcoiris", 600);
        device.tick(ms(1_000));
        assert_eq!(device.status().pending, Some((EffectKey::new("arcoiris"), ms(3_100))));

        let fired: Vec<String> = (10..=40)
            .flat_map(|i| device.tick(ms(i * 100)))
            .filter_map(|e| match e {
                DeviceEvent::Activated { effect, .. } => Some(effect.as_str().to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(fired, vec!["arcoiris"]);
    }

    #[test]
    fn force_release_tears_everything_down() {
        let store = MemoryStore::new();
        let grid = store.insert_grid("Main", 1, 1).unwrap();
        let hw = TestHardware::new();
        let mut device = runtime(store, &hw);
        let cell = device.claim(grid.id, 0, 0, ms(0)).unwrap();

        publish(device.store(), keys::FLASH_FAST, 0);
        for t in (0..=2_600).step_by(50) {
            device.tick(ms(t));
        }
        assert_eq!(device.status().applied, Some(EffectKey::new(keys::FLASH_FAST)));
        assert!(hw.operations().contains(&HardwareOp::TorchAcquire));

        device.store().release_cell(cell, ms(2_700)).unwrap();
        let events = device.tick(ms(3_000));
        assert!(events.contains(&DeviceEvent::Released(ReleaseReason::ForceReleased)));
        assert!(device.session().is_none());
        assert!(!hw.torch_lit());
        assert!(hw.operations().contains(&HardwareOp::TorchRelease));
        assert!(device.tick(ms(3_500)).is_empty());
    }

    #[test]
    fn cell_reclaimed_by_another_device_releases_the_first() {
        let store = Arc::new(MemoryStore::new());
        let grid = store.insert_grid("Main", 1, 1).unwrap();
        let hw_a = TestHardware::new();
        let hw_b = TestHardware::new();
        let mut a = runtime(store.clone(), &hw_a);
        let mut b = runtime(store.clone(), &hw_b);

        let cell = a.claim(grid.id, 0, 0, ms(0)).unwrap();
        a.tick(ms(0));
        store.release_cell(cell, ms(100)).unwrap();
        assert_eq!(b.claim(grid.id, 0, 0, ms(200)).unwrap(), cell);

        let events = a.tick(ms(500));
        assert!(events.contains(&DeviceEvent::Released(ReleaseReason::ForceReleased)));
        assert!(a.session().is_none());

        // A late exit from the first device leaves the new occupant alone.
        assert_eq!(a.exit(ms(600)), None);
        let token = &b.session().unwrap().token;
        assert!(store.read_cell(cell).unwrap().is_claimed_by(token));
    }

    #[test]
    fn exit_after_losing_the_cell_leaves_the_new_occupant() {
        let store = Arc::new(MemoryStore::new());
        let grid = store.insert_grid("Main", 1, 1).unwrap();
        let hw = TestHardware::new();
        let mut a = runtime(store.clone(), &hw);
        let mut b = runtime(store.clone(), &TestHardware::new());

        let cell = a.claim(grid.id, 0, 0, ms(0)).unwrap();
        store.release_cell(cell, ms(100)).unwrap();
        b.claim(grid.id, 0, 0, ms(200)).unwrap();

        assert_eq!(a.exit(ms(300)), Some(DeviceEvent::Released(ReleaseReason::Exited)));
        let token = &b.session().unwrap().token;
        assert!(store.read_cell(cell).unwrap().is_claimed_by(token));
    }

    #[test]
    fn suspend_stops_output_but_keeps_the_claim() {
        let store = Arc::new(MemoryStore::new());
        let grid = store.insert_grid("Main", 1, 1).unwrap();
        let hw = TestHardware::new();
        let mut device = runtime(store.clone(), &hw);
        let cell = device.claim(grid.id, 0, 0, ms(0)).unwrap();
        let saved = device.session().cloned().unwrap();

        publish(device.store(), keys::FLASH_FAST, 0);
        for t in (0..=2_600).step_by(50) {
            device.tick(ms(t));
        }
        assert!(hw.operations().contains(&HardwareOp::TorchAcquire));

        assert_eq!(device.suspend(), Some(DeviceEvent::Released(ReleaseReason::Suspended)));
        assert!(device.session().is_none());
        assert!(hw.operations().contains(&HardwareOp::TorchRelease));
        assert!(store.read_cell(cell).unwrap().is_claimed_by(&saved.token));
        assert_eq!(device.suspend(), None);

        let mut again = runtime(store, &TestHardware::new());
        assert_eq!(again.resume(saved, ms(5_000)), Ok(true));
    }

    #[test]
    fn exit_frees_the_cell() {
        let store = MemoryStore::new();
        let grid = store.insert_grid("Main", 1, 1).unwrap();
        let hw = TestHardware::new();
        let mut device = runtime(store, &hw);
        let cell = device.claim(grid.id, 0, 0, ms(0)).unwrap();

        assert_eq!(device.exit(ms(10)), Some(DeviceEvent::Released(ReleaseReason::Exited)));
        assert!(device.store().read_cell(cell).unwrap().is_free());
        assert_eq!(device.exit(ms(20)), None);
    }

    #[test]
    fn unreachable_store_reconnects_without_losing_the_cell() {
        let store = FlakyStore::new(MemoryStore::new());
        let grid = store.insert_grid("Main", 1, 1).unwrap();
        let hw = TestHardware::new();
        let mut device = runtime(store, &hw);
        device.claim(grid.id, 0, 0, ms(0)).unwrap();
        device.tick(ms(0));

        device.store().set_offline(true);
        let mut events = Vec::new();
        for t in [500, 1_000, 1_500, 2_000] {
            events.extend(device.tick(ms(t)));
        }
        assert_eq!(events, vec![DeviceEvent::Reconnecting]);
        assert!(device.status().reconnecting);
        assert!(device.session().is_some());

        device.store().set_offline(false);
        assert!(device.tick(ms(2_500)).contains(&DeviceEvent::Reconnected));
        assert!(!device.status().reconnecting);
    }

    #[test]
    fn resume_requires_the_same_claimant() {
        let store = Arc::new(MemoryStore::new());
        let grid = store.insert_grid("Main", 1, 1).unwrap();
        let hw = TestHardware::new();

        let mut first = runtime(store.clone(), &hw);
        first.claim(grid.id, 0, 0, ms(0)).unwrap();
        let saved = first.session().cloned().unwrap();

        let mut second = runtime(store.clone(), &hw);
        assert!(second.resume(saved.clone(), ms(100)).unwrap());

        let forged = DeviceSession {
            token: SessionToken::new(),
            ..saved
        };
        let mut third = runtime(store, &hw);
        assert!(!third.resume(forged, ms(200)).unwrap());
        assert!(third.session().is_none());
    }

    #[test]
    fn wave_frames_highlight_only_at_render_time() {
        let store = MemoryStore::new();
        let grid = store.insert_grid("Main", 1, 3).unwrap();
        let hw = TestHardware::new();
        let mut device = runtime(store, &hw);
        device.claim(grid.id, 0, 1, ms(0)).unwrap();

        let red = Rgb::new(0xc6, 0x2b, 0x28);
        device.on_wave(WaveFrame {
            grid: grid.id,
            column: Some(1),
            color: Some(red),
            render_at: ms(1_200),
        });
        device.tick(ms(1_100));
        assert_eq!(device.status().wave, None);
        device.tick(ms(1_200));
        assert_eq!(device.status().wave, Some(red));
        assert!(hw.operations().contains(&HardwareOp::Wave(Some(red))));
    }
}
