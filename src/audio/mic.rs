//! Exclusive microphone ownership
//!
//! Only one feature may capture at a time. Holders get a [`MicLease`];
//! dropping the lease releases it, so abnormal teardown paths cannot leak
//! ownership.

use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MicError {
    #[error("microphone is held by {owner}")]
    Held { owner: String },

    #[error("microphone is already held by {owner}")]
    AlreadyOwned { owner: String },
}

#[derive(Debug, Default)]
struct Slot {
    owner: Option<String>,
    generation: u64,
}

/// Arbitrates the microphone between features
#[derive(Debug, Clone, Default)]
pub struct MicArbiter {
    slot: Arc<Mutex<Slot>>,
}

impl MicArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder, if any
    pub fn active_owner(&self) -> Option<String> {
        self.slot.lock().ok().and_then(|slot| slot.owner.clone())
    }

    /// Take exclusive ownership for `owner`
    pub fn acquire(&self, owner: &str) -> Result<MicLease, MicError> {
        let mut slot = match self.slot.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(current) = &slot.owner {
            return Err(if current == owner {
                MicError::AlreadyOwned {
                    owner: current.clone(),
                }
            } else {
                MicError::Held {
                    owner: current.clone(),
                }
            });
        }

        slot.generation += 1;
        slot.owner = Some(owner.to_string());
        info!("Microphone acquired by {}", owner);

        Ok(MicLease {
            arbiter: Arc::clone(&self.slot),
            owner: owner.to_string(),
            generation: slot.generation,
            released: false,
        })
    }

    /// Clear ownership regardless of who holds it
    pub fn force_release(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            if let Some(owner) = slot.owner.take() {
                warn!("Microphone force-released from {}", owner);
            }
        }
    }
}

/// Proof of microphone ownership
#[derive(Debug)]
pub struct MicLease {
    arbiter: Arc<Mutex<Slot>>,
    owner: String,
    generation: u64,
    released: bool,
}

impl MicLease {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Give the microphone back. Calling this twice is harmless.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Ok(mut slot) = self.arbiter.lock() {
            // A force release followed by a new acquire must not be undone here
            if slot.generation == self.generation && slot.owner.as_deref() == Some(&self.owner) {
                slot.owner = None;
                debug!("Microphone released by {}", self.owner);
            }
        }
    }
}

impl Drop for MicLease {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let mic = MicArbiter::new();
        let mut lease = mic.acquire("asr-note").unwrap();
        assert_eq!(mic.active_owner().as_deref(), Some("asr-note"));
        assert_eq!(lease.owner(), "asr-note");

        lease.release();
        assert_eq!(mic.active_owner(), None);
        lease.release();
        assert_eq!(mic.active_owner(), None);
    }

    #[test]
    fn test_second_owner_is_rejected_with_holder() {
        let mic = MicArbiter::new();
        let _lease = mic.acquire("speech-transcribe").unwrap();

        let err = mic.acquire("asr-note").unwrap_err();
        assert_eq!(
            err,
            MicError::Held {
                owner: "speech-transcribe".to_string()
            }
        );
        assert!(err.to_string().contains("speech-transcribe"));
    }

    #[test]
    fn test_same_owner_cannot_acquire_twice() {
        let mic = MicArbiter::new();
        let _lease = mic.acquire("asr-note").unwrap();
        assert!(matches!(
            mic.acquire("asr-note"),
            Err(MicError::AlreadyOwned { .. })
        ));
    }

    #[test]
    fn test_drop_releases() {
        let mic = MicArbiter::new();
        {
            let _lease = mic.acquire("asr-note").unwrap();
        }
        assert_eq!(mic.active_owner(), None);
        assert!(mic.acquire("speech-transcribe").is_ok());
    }

    #[test]
    fn test_stale_lease_does_not_release_new_holder() {
        let mic = MicArbiter::new();
        let mut stale = mic.acquire("asr-note").unwrap();
        mic.force_release();

        let _fresh = mic.acquire("asr-note").unwrap();
        stale.release();
        assert_eq!(mic.active_owner().as_deref(), Some("asr-note"));
    }
}
