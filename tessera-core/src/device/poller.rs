use tessera_types::{Cell, CellId, EffectKey, EffectParams, GlobalEffectState, SessionToken, Timestamp};

use crate::catalog::EffectKeyCache;
use crate::store::{StateStore, StoreError};
use crate::timer::Ticker;

/// Version of the state a device observed: the global publish timestamp
/// and its cell's `updated_at`. Ordered by publish timestamp first, so a
/// response carrying an older publish is always older.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Revision {
    pub published: Timestamp,
    pub cell_updated: Timestamp,
}

impl Revision {
    /// The instant execution is anchored to.
    pub fn anchor(self) -> Timestamp {
        self.published.max(self.cell_updated)
    }
}

/// The effect a device should run, as resolved from one poll.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEffect {
    pub key: EffectKey,
    pub params: EffectParams,
    pub text: Option<String>,
    pub revision: Revision,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Same revision as already scheduled or applied.
    Unchanged,
    Changed(ResolvedEffect),
    /// The response was older than one already seen.
    Stale,
    /// The cell no longer carries our claimant token: freed by the
    /// operator, or freed and taken by another device between polls.
    Released,
    /// The round failed; `reconnecting` once the failure threshold is hit.
    Failed {
        error: StoreError,
        consecutive: u32,
        reconnecting: bool,
    },
}

/// Global idle (or the wave, which is pushed separately) defers to the
/// cell's override; any other global effect wins.
pub fn resolve_effect(global: &EffectKey, override_key: Option<&EffectKey>) -> EffectKey {
    if global.is_idle() || global.is_wave() {
        match override_key {
            Some(key) if !key.is_wave() => key.clone(),
            _ => EffectKey::idle(),
        }
    } else {
        global.clone()
    }
}

/// Reads a device's cell and the global row on a fixed cadence.
pub struct DevicePoller {
    ticker: Ticker,
    reconnect_after: u32,
    consecutive_failures: u32,
    last_seen: Option<Revision>,
    keys: EffectKeyCache,
}

impl DevicePoller {
    pub fn new(interval: std::time::Duration, reconnect_after: u32) -> Self {
        Self {
            ticker: Ticker::new(interval),
            reconnect_after: reconnect_after.max(1),
            consecutive_failures: 0,
            last_seen: None,
            keys: EffectKeyCache::new(),
        }
    }

    /// Start polling; the first round is due immediately.
    pub fn start(&mut self, now: Timestamp) {
        self.ticker.start_at(now);
    }

    /// Stop polling and forget everything seen.
    pub fn reset(&mut self) {
        self.ticker.stop();
        self.consecutive_failures = 0;
        self.last_seen = None;
    }

    pub fn is_running(&self) -> bool {
        self.ticker.is_running()
    }

    pub fn is_due(&mut self, now: Timestamp) -> bool {
        self.ticker.due(now)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.consecutive_failures >= self.reconnect_after
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_seen(&self) -> Option<Revision> {
        self.last_seen
    }

    /// One poll round for `cell`, held under `token`.
    pub fn poll<S: StateStore + ?Sized>(
        &mut self,
        store: &S,
        cell: CellId,
        token: &SessionToken,
    ) -> PollOutcome {
        let observed = store
            .read_cell(cell)
            .and_then(|c| store.read_global().map(|g| (c, g)));
        let (cell, global) = match observed {
            Ok(pair) => pair,
            Err(StoreError::NotFound(_)) => return PollOutcome::Released,
            Err(error) => return self.fail(error),
        };

        if self.consecutive_failures > 0 {
            log::info!(target: "poller", "store reachable again after {} failed polls", self.consecutive_failures);
            self.consecutive_failures = 0;
        }
        self.observe(store, &cell, token, global)
    }

    fn fail(&mut self, error: StoreError) -> PollOutcome {
        self.consecutive_failures += 1;
        let reconnecting = self.is_reconnecting();
        if self.consecutive_failures == self.reconnect_after {
            log::warn!(target: "poller", "{} consecutive poll failures, reconnecting: {}", self.consecutive_failures, error);
        } else {
            log::debug!(target: "poller", "poll failed ({}): {}", self.consecutive_failures, error);
        }
        PollOutcome::Failed {
            error,
            consecutive: self.consecutive_failures,
            reconnecting,
        }
    }

    fn observe<S: StateStore + ?Sized>(
        &mut self,
        store: &S,
        cell: &Cell,
        token: &SessionToken,
        global: GlobalEffectState,
    ) -> PollOutcome {
        if !cell.is_claimed_by(token) {
            if !cell.is_free() {
                log::warn!(target: "poller", "cell {} now belongs to another claimant", cell.id);
            }
            return PollOutcome::Released;
        }
        let revision = Revision {
            published: global.publish_timestamp,
            cell_updated: cell.updated_at,
        };
        match self.last_seen {
            Some(seen) if revision == seen => return PollOutcome::Unchanged,
            Some(seen) if revision < seen => {
                log::debug!(target: "poller", "discarding stale state {:?} (have {:?})", revision, seen);
                return PollOutcome::Stale;
            }
            _ => {}
        }

        let override_key = match cell.effect_override {
            Some(id) => match self.keys.key_for(store, id) {
                Ok(key) => Some(key),
                Err(e) => {
                    log::warn!(target: "poller", "unknown override effect {}: {}", id, e);
                    None
                }
            },
            None => None,
        };
        let key = resolve_effect(&global.current_effect, override_key.as_ref());
        self.last_seen = Some(revision);
        PollOutcome::Changed(ResolvedEffect {
            key,
            params: global.params,
            text: cell.assigned_text.clone(),
            revision,
        })
    }
}
