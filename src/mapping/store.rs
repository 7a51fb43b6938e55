//! Active profile holder
//!
//! The profile is published through a `watch` channel as an
//! `Arc<MappingProfile>`. Applying a profile swaps the pointer; a resolver
//! in the middle of a tick keeps the `Arc` it started with and picks up the
//! new one at the next tick boundary. Readers never see a half-edited profile.

use crate::mapping::error::MappingError;
use crate::mapping::profile::MappingProfile;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug)]
pub struct ProfileStore {
    tx: watch::Sender<Arc<MappingProfile>>,
}

impl ProfileStore {
    pub fn new(initial: MappingProfile) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx }
    }

    /// Validates and publishes `profile`. An invalid profile is rejected
    /// and the active one stays in place.
    pub fn apply(&self, profile: MappingProfile) -> Result<(), MappingError> {
        if let Err(e) = profile.validate() {
            warn!("Rejected profile: {}", e);
            return Err(e);
        }
        info!(
            "Applying profile: {} assignments, {} button mappings, {} axis mappings",
            profile.device_assignments.len(),
            profile.button_mappings.len(),
            profile.axis_mappings.len()
        );
        self.tx.send_replace(Arc::new(profile));
        Ok(())
    }

    pub fn current(&self) -> Arc<MappingProfile> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<MappingProfile>> {
        self.tx.subscribe()
    }
}
