//! Single-writer publication of risk settings
//!
//! Readers take cheap immutable snapshots through [`RiskStore::snapshot`].
//! The one writer opens a [`RiskUpdate`], mutates a private draft and
//! publishes it with [`RiskUpdate::commit`]. Dropping an update without
//! committing discards the draft, so a half-finished adaptation run is
//! never observable.

use arc_swap::ArcSwap;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

use super::settings::RiskSettings;

pub struct RiskStore {
    live: ArcSwap<RiskSettings>,
    writer: Mutex<()>,
}

impl RiskStore {
    pub fn new(settings: RiskSettings) -> Self {
        Self {
            live: ArcSwap::from_pointee(settings),
            writer: Mutex::new(()),
        }
    }

    /// Read-only view of the current settings
    pub fn snapshot(&self) -> Arc<RiskSettings> {
        self.live.load_full()
    }

    /// Start a read-modify-write cycle. Blocks while another update is open.
    pub fn begin_update(&self) -> RiskUpdate<'_> {
        let guard = self.writer.lock();
        let draft = RiskSettings::clone(&self.live.load());
        RiskUpdate {
            _guard: guard,
            store: self,
            draft,
        }
    }
}

pub struct RiskUpdate<'a> {
    _guard: MutexGuard<'a, ()>,
    store: &'a RiskStore,
    draft: RiskSettings,
}

impl<'a> RiskUpdate<'a> {
    pub fn draft(&self) -> &RiskSettings {
        &self.draft
    }

    pub fn draft_mut(&mut self) -> &mut RiskSettings {
        &mut self.draft
    }

    /// Publish the draft as the live settings
    pub fn commit(self) -> Arc<RiskSettings> {
        let published = Arc::new(self.draft);
        self.store.live.store(Arc::clone(&published));
        published
    }
}
