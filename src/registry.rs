// Registry module - the shared, lock-guarded list of monitored targets
//
// The registry is the only mutable state shared between the Control API
// handlers and the publisher loop. Every operation holds the lock only for
// the duration of the mutation or copy; collection work always happens on a
// snapshot taken by `list()`.

use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::target::{Target, TargetKey};

/// Errors returned by registry mutations
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{0} already exists in the list")]
    DuplicateTarget(TargetKey),

    #[error("{0} not found in the list")]
    NotFound(TargetKey),
}

/// Insertion-ordered set of targets, deduplicated by identity key
///
/// Cloning is cheap and every clone refers to the same underlying list.
#[derive(Clone, Default)]
pub struct TargetRegistry {
    targets: Arc<RwLock<Vec<Target>>>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a target unless one with the same identity key is present
    ///
    /// # Returns
    /// * `Ok(())` - Target accepted
    /// * `Err(RegistryError::DuplicateTarget)` - Key already registered, list unchanged
    pub fn add(&self, target: Target) -> Result<(), RegistryError> {
        let key = target.key();
        let mut targets = self.targets.write();

        if targets.iter().any(|existing| existing.key() == key) {
            debug!("Rejected duplicate target: {}", key);
            return Err(RegistryError::DuplicateTarget(key));
        }

        targets.push(target);
        info!("Added target: {} ({} registered)", key, targets.len());
        Ok(())
    }

    /// Removes the target with the given identity key
    ///
    /// # Returns
    /// * `Ok(Target)` - The removed target
    /// * `Err(RegistryError::NotFound)` - No such key, list unchanged
    pub fn remove(&self, key: &TargetKey) -> Result<Target, RegistryError> {
        let mut targets = self.targets.write();

        match targets.iter().position(|existing| existing.key() == *key) {
            Some(index) => {
                let removed = targets.remove(index);
                info!("Removed target: {} ({} registered)", key, targets.len());
                Ok(removed)
            }
            None => Err(RegistryError::NotFound(key.clone())),
        }
    }

    /// Copies out the current targets in insertion order
    pub fn list(&self) -> Vec<Target> {
        self.targets.read().clone()
    }

    pub fn len(&self) -> usize {
        self.targets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.read().is_empty()
    }
}
