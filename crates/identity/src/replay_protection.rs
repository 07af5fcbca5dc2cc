//! Nonce issuance and single-use enforcement.
//!
//! The registry is the only hot, write-heavy structure shared between
//! concurrent verification rounds. A nonce is recorded the first time a
//! round presents it, whatever that round's outcome, and any later round
//! presenting it is a replay. Entries are evicted one TTL after they were
//! issued or first seen.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use rand::RngCore;
use tracing::{debug, warn};

use crate::error::VerificationError;

/// Hard cap on tracked nonces to bound memory under flood.
const MAX_TRACKED_NONCES: usize = 100_000;

#[derive(Debug, Clone, Copy)]
enum NonceState {
    Issued { at: Instant },
    Consumed { at: Instant },
}

impl NonceState {
    fn since(&self) -> Instant {
        match self {
            NonceState::Issued { at } | NonceState::Consumed { at } => *at,
        }
    }
}

/// Shared nonce registry with TTL eviction.
#[derive(Debug, Clone)]
pub struct NonceRegistry {
    ttl: Duration,
    nonces: Arc<RwLock<HashMap<String, NonceState>>>,
}

impl NonceRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            nonces: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a fresh 32-byte hex nonce.
    pub fn issue(&self) -> Result<String, VerificationError> {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let nonce = hex::encode(bytes);

        let mut nonces = self.write()?;
        Self::evict(&mut nonces, self.ttl);
        nonces.insert(nonce.clone(), NonceState::Issued { at: Instant::now() });
        Ok(nonce)
    }

    /// Mark `nonce` as used. Fails on reuse or on an issued nonce that has
    /// outlived the TTL.
    pub fn consume(&self, nonce: &str) -> Result<(), VerificationError> {
        let now = Instant::now();
        let mut nonces = self.write()?;

        match nonces.get(nonce).copied() {
            Some(NonceState::Consumed { .. }) => {
                warn!(nonce, "nonce reuse rejected");
                return Err(VerificationError::ReplayDetected(format!(
                    "nonce {nonce} already used"
                )));
            }
            Some(NonceState::Issued { at }) if now.duration_since(at) > self.ttl => {
                nonces.insert(nonce.to_string(), NonceState::Consumed { at: now });
                return Err(VerificationError::ReplayDetected(format!(
                    "nonce {nonce} expired"
                )));
            }
            _ => {}
        }

        if nonces.len() >= MAX_TRACKED_NONCES {
            Self::evict(&mut nonces, self.ttl);
            if nonces.len() >= MAX_TRACKED_NONCES {
                return Err(VerificationError::ReplayDetected(
                    "nonce tracking limit reached".into(),
                ));
            }
        }
        nonces.insert(nonce.to_string(), NonceState::Consumed { at: now });
        debug!(nonce, "nonce consumed");
        Ok(())
    }

    /// Drop entries older than the TTL. Returns the number removed.
    pub fn cleanup(&self) -> usize {
        match self.nonces.write() {
            Ok(mut nonces) => Self::evict(&mut nonces, self.ttl),
            Err(_) => 0,
        }
    }

    pub fn tracked(&self) -> usize {
        self.nonces.read().map(|n| n.len()).unwrap_or(0)
    }

    fn evict(nonces: &mut HashMap<String, NonceState>, ttl: Duration) -> usize {
        let before = nonces.len();
        nonces.retain(|_, state| state.since().elapsed() <= ttl);
        before - nonces.len()
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, NonceState>>, VerificationError>
    {
        self.nonces
            .write()
            .map_err(|_| VerificationError::ReplayDetected("nonce registry poisoned".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issued_nonce_is_single_use() {
        let registry = NonceRegistry::new(Duration::from_secs(60));
        let nonce = registry.issue().unwrap();
        assert_eq!(nonce.len(), 64);
        assert!(registry.consume(&nonce).is_ok());
        assert!(matches!(
            registry.consume(&nonce),
            Err(VerificationError::ReplayDetected(_))
        ));
    }

    #[test]
    fn test_external_nonce_is_single_use() {
        let registry = NonceRegistry::new(Duration::from_secs(60));
        assert!(registry.consume("n1").is_ok());
        assert!(registry.consume("n1").is_err());
        assert!(registry.consume("n2").is_ok());
    }

    #[test]
    fn test_stale_issued_nonce_rejected() {
        let registry = NonceRegistry::new(Duration::from_millis(20));
        let nonce = registry.issue().unwrap();
        std::thread::sleep(Duration::from_millis(40));
        assert!(matches!(
            registry.consume(&nonce),
            Err(VerificationError::ReplayDetected(_))
        ));
    }

    #[test]
    fn test_cleanup_evicts_expired() {
        let registry = NonceRegistry::new(Duration::from_millis(20));
        registry.consume("a").unwrap();
        registry.consume("b").unwrap();
        assert_eq!(registry.tracked(), 2);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(registry.cleanup(), 2);
        assert_eq!(registry.tracked(), 0);
    }

    #[test]
    fn test_concurrent_consumers_single_winner() {
        let registry = NonceRegistry::new(Duration::from_secs(60));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.consume("shared").is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
    }
}
