//! Node registry for the renewal lifecycle.
//!
//! Tracks every enrolled node, its last-known-good measurement baseline and
//! where it stands in the identity lifecycle. Records are never deleted;
//! a node that stops renewing is only ever marked expired.
//!
//! # State Transitions
//!
//! ```text
//! Pending
//!     ↓ (record_success)
//! Active ──(record_success)──→ Active (renewed)
//!     ↓ (failure threshold / expire_lapsed)
//! Expired
//!     ↓ (reenroll)
//! Pending
//! ```
//!
//! There is no revoked state. The baseline is written only by
//! [`NodeRegistry::rotate_baseline`], which is an operator action and is
//! never reached from the attestation path.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use aegis_core::config::PCR_COUNT;

use crate::attestation::MobileSensorLocation;
use crate::error::{IdentityError, IdentityResult};
use crate::tpm::PcrValue;

/// Maximum number of state transitions to track per node.
const MAX_HISTORY_SIZE: usize = 100;

/// Lifecycle state of a node identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Enrolled, never successfully attested
    Pending {
        enrolled_at: u64,
    },

    /// Holding a valid identity
    Active {
        /// Last successful renewal (unix millis)
        renewed_at: u64,
        /// Identity lapses at this instant unless renewed
        expires_at: u64,
    },

    /// Identity lapsed; only re-enrollment leaves this state
    Expired {
        expired_at: u64,
        reason: String,
    },
}

impl NodeState {
    pub fn name(&self) -> &'static str {
        match self {
            NodeState::Pending { .. } => "Pending",
            NodeState::Active { .. } => "Active",
            NodeState::Expired { .. } => "Expired",
        }
    }
}

/// Record of a state transition for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from_state: String,
    pub to_state: String,
    pub timestamp: u64,
    pub reason: Option<String>,
    /// blake3 over `from->to;timestamp`
    pub transition_hash: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_uuid: String,
    /// Expected PCR values; `None` until an operator enrolls one.
    pub baseline: Option<Vec<PcrValue>>,
    /// Location the node claims to be deployed at.
    pub location: Option<MobileSensorLocation>,
    pub state: NodeState,
    pub consecutive_failures: u32,
    pub history: VecDeque<StateTransition>,
}

impl NodeRecord {
    fn new(
        node_uuid: String,
        baseline: Option<Vec<PcrValue>>,
        location: Option<MobileSensorLocation>,
    ) -> Self {
        Self {
            node_uuid,
            baseline,
            location,
            state: NodeState::Pending {
                enrolled_at: current_timestamp(),
            },
            consecutive_failures: 0,
            history: VecDeque::with_capacity(MAX_HISTORY_SIZE),
        }
    }

    fn transition(&mut self, new_state: NodeState, reason: Option<String>) {
        let now = current_timestamp();
        let from_state = self.state.name().to_string();
        let to_state = new_state.name().to_string();

        let transition_data = format!("{}->{};{}", from_state, to_state, now);
        let transition_hash = blake3::hash(transition_data.as_bytes()).as_bytes().to_vec();

        self.state = new_state;
        if self.history.len() >= MAX_HISTORY_SIZE {
            self.history.pop_front();
        }
        self.history.push_back(StateTransition {
            from_state,
            to_state,
            timestamp: now,
            reason,
            transition_hash,
        });
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.state, NodeState::Expired { .. })
    }

    /// True when the node holds an identity that has not yet lapsed at `now`.
    pub fn is_active_at(&self, now: u64) -> bool {
        matches!(self.state, NodeState::Active { expires_at, .. } if expires_at > now)
    }
}

/// Shared registry of node records keyed by node UUID.
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    nodes: Arc<RwLock<HashMap<String, NodeRecord>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enroll a new node in `Pending`.
    pub fn enroll(
        &self,
        node_uuid: impl Into<String>,
        baseline: Option<Vec<PcrValue>>,
        location: Option<MobileSensorLocation>,
    ) -> IdentityResult<()> {
        let node_uuid = node_uuid.into();
        let mut nodes = self.write()?;
        if nodes.contains_key(&node_uuid) {
            return Err(IdentityError::NodeExists { node_uuid });
        }
        info!(node_uuid = %node_uuid, has_baseline = baseline.is_some(), "node enrolled");
        nodes.insert(
            node_uuid.clone(),
            NodeRecord::new(node_uuid, baseline, location),
        );
        Ok(())
    }

    pub fn get(&self, node_uuid: &str) -> IdentityResult<NodeRecord> {
        self.read()?
            .get(node_uuid)
            .cloned()
            .ok_or_else(|| not_found(node_uuid))
    }

    /// Enrolled baseline, if any. Unknown nodes have none.
    pub fn baseline(&self, node_uuid: &str) -> Option<Vec<PcrValue>> {
        self.read()
            .ok()?
            .get(node_uuid)
            .and_then(|record| record.baseline.clone())
    }

    pub fn location(&self, node_uuid: &str) -> Option<MobileSensorLocation> {
        self.read()
            .ok()?
            .get(node_uuid)
            .and_then(|record| record.location.clone())
    }

    /// Operator-approved baseline replacement.
    pub fn rotate_baseline(&self, node_uuid: &str, baseline: Vec<PcrValue>) -> IdentityResult<()> {
        let mut nodes = self.write()?;
        let record = nodes.get_mut(node_uuid).ok_or_else(|| not_found(node_uuid))?;
        info!(
            node_uuid,
            pcrs = baseline.len(),
            "measurement baseline rotated"
        );
        record.baseline = Some(baseline);
        Ok(())
    }

    pub fn set_location(
        &self,
        node_uuid: &str,
        location: Option<MobileSensorLocation>,
    ) -> IdentityResult<()> {
        let mut nodes = self.write()?;
        let record = nodes.get_mut(node_uuid).ok_or_else(|| not_found(node_uuid))?;
        record.location = location;
        Ok(())
    }

    /// Transition: Pending | Active → Active (renewed). An expired node
    /// cannot renew until it is re-enrolled.
    pub fn record_success(&self, node_uuid: &str, identity_ttl: Duration) -> IdentityResult<NodeState> {
        let mut nodes = self.write()?;
        let record = nodes.get_mut(node_uuid).ok_or_else(|| not_found(node_uuid))?;
        if record.is_expired() {
            return Err(IdentityError::InvalidTransition {
                from: record.state.name().to_string(),
                to: "Active".to_string(),
            });
        }

        let now = current_timestamp();
        let reason = match record.state {
            NodeState::Pending { .. } => "first attestation passed",
            _ => "identity renewed",
        };
        record.consecutive_failures = 0;
        record.transition(
            NodeState::Active {
                renewed_at: now,
                expires_at: now.saturating_add(identity_ttl.as_millis() as u64),
            },
            Some(reason.to_string()),
        );
        Ok(record.state.clone())
    }

    /// Count a failed round. Reaching `threshold` consecutive failures
    /// expires the node.
    pub fn record_failure(&self, node_uuid: &str, threshold: u32) -> IdentityResult<NodeState> {
        let mut nodes = self.write()?;
        let record = nodes.get_mut(node_uuid).ok_or_else(|| not_found(node_uuid))?;
        if record.is_expired() {
            return Ok(record.state.clone());
        }

        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        if record.consecutive_failures >= threshold.max(1) {
            let reason = format!(
                "{} consecutive renewal failures",
                record.consecutive_failures
            );
            warn!(node_uuid, failures = record.consecutive_failures, "node identity expired");
            record.transition(
                NodeState::Expired {
                    expired_at: current_timestamp(),
                    reason: reason.clone(),
                },
                Some(reason),
            );
        }
        Ok(record.state.clone())
    }

    /// Expire every active node whose identity lapsed at or before `now`.
    /// Returns the UUIDs that changed.
    pub fn expire_lapsed(&self, now: u64) -> IdentityResult<Vec<String>> {
        let mut nodes = self.write()?;
        let mut expired = Vec::new();
        for record in nodes.values_mut() {
            if let NodeState::Active { expires_at, .. } = record.state {
                if expires_at <= now {
                    record.transition(
                        NodeState::Expired {
                            expired_at: now,
                            reason: "identity lapsed".to_string(),
                        },
                        Some("identity lapsed without renewal".to_string()),
                    );
                    expired.push(record.node_uuid.clone());
                }
            }
        }
        for node_uuid in &expired {
            info!(node_uuid = %node_uuid, "identity lapsed");
        }
        Ok(expired)
    }

    /// Transition: Expired → Pending.
    pub fn reenroll(&self, node_uuid: &str) -> IdentityResult<()> {
        let mut nodes = self.write()?;
        let record = nodes.get_mut(node_uuid).ok_or_else(|| not_found(node_uuid))?;
        if !record.is_expired() {
            return Err(IdentityError::InvalidTransition {
                from: record.state.name().to_string(),
                to: "Pending".to_string(),
            });
        }
        record.consecutive_failures = 0;
        record.transition(
            NodeState::Pending {
                enrolled_at: current_timestamp(),
            },
            Some("re-enrolled by operator".to_string()),
        );
        info!(node_uuid, "node re-enrolled");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.read().map(|nodes| nodes.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(
        &self,
    ) -> IdentityResult<std::sync::RwLockReadGuard<'_, HashMap<String, NodeRecord>>> {
        self.nodes
            .read()
            .map_err(|_| IdentityError::InvalidState("node registry poisoned".into()))
    }

    fn write(
        &self,
    ) -> IdentityResult<std::sync::RwLockWriteGuard<'_, HashMap<String, NodeRecord>>> {
        self.nodes
            .write()
            .map_err(|_| IdentityError::InvalidState("node registry poisoned".into()))
    }
}

/// Read an operator-approved baseline from a JSON list of PCR values.
pub fn load_baseline<P: AsRef<Path>>(path: P) -> IdentityResult<Vec<PcrValue>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let mut baseline: Vec<PcrValue> = serde_json::from_str(&content)?;
    if baseline.is_empty() {
        return Err(IdentityError::Config(format!(
            "baseline {} lists no PCRs",
            path.display()
        )));
    }
    let mut seen = BTreeSet::new();
    for pcr in &baseline {
        if pcr.index >= PCR_COUNT || !seen.insert(pcr.index) {
            return Err(IdentityError::Config(format!(
                "baseline {}: PCR {} out of range or repeated",
                path.display(),
                pcr.index
            )));
        }
        if pcr.value.len() != 32 {
            return Err(IdentityError::Config(format!(
                "baseline {}: PCR {} is not a SHA-256 digest",
                path.display(),
                pcr.index
            )));
        }
    }
    baseline.sort_by_key(|pcr| pcr.index);
    info!(path = %path.display(), pcrs = baseline.len(), "measurement baseline loaded");
    Ok(baseline)
}

fn not_found(node_uuid: &str) -> IdentityError {
    IdentityError::NodeNotFound {
        node_uuid: node_uuid.to_string(),
    }
}

pub(crate) fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(300);

    fn baseline() -> Vec<PcrValue> {
        (0..8)
            .map(|index| PcrValue {
                index,
                value: vec![0u8; 32],
            })
            .collect()
    }

    #[test]
    fn test_enroll_starts_pending() {
        let registry = NodeRegistry::new();
        registry.enroll("node-1", Some(baseline()), None).unwrap();
        let record = registry.get("node-1").unwrap();
        assert_eq!(record.state.name(), "Pending");
        assert!(registry.baseline("node-1").is_some());
        assert!(matches!(
            registry.enroll("node-1", None, None),
            Err(IdentityError::NodeExists { .. })
        ));
    }

    #[test]
    fn test_success_activates_and_renews() {
        let registry = NodeRegistry::new();
        registry.enroll("node-1", None, None).unwrap();
        let state = registry.record_success("node-1", TTL).unwrap();
        assert!(matches!(state, NodeState::Active { .. }));
        registry.record_success("node-1", TTL).unwrap();

        let record = registry.get("node-1").unwrap();
        assert_eq!(record.history.len(), 2);
        assert_eq!(record.history[1].from_state, "Active");
        assert_eq!(record.history[1].transition_hash.len(), 32);
        assert!(record.is_active_at(current_timestamp()));
    }

    #[test]
    fn test_failure_threshold_expires() {
        let registry = NodeRegistry::new();
        registry.enroll("node-1", None, None).unwrap();
        registry.record_success("node-1", TTL).unwrap();

        assert!(matches!(
            registry.record_failure("node-1", 3).unwrap(),
            NodeState::Active { .. }
        ));
        registry.record_failure("node-1", 3).unwrap();
        assert!(matches!(
            registry.record_failure("node-1", 3).unwrap(),
            NodeState::Expired { .. }
        ));

        // Hardware recovering does not bring the node back.
        assert!(matches!(
            registry.record_success("node-1", TTL),
            Err(IdentityError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let registry = NodeRegistry::new();
        registry.enroll("node-1", None, None).unwrap();
        registry.record_failure("node-1", 2).unwrap();
        registry.record_success("node-1", TTL).unwrap();
        registry.record_failure("node-1", 2).unwrap();
        assert_eq!(registry.get("node-1").unwrap().consecutive_failures, 1);
    }

    #[test]
    fn test_reenroll_only_from_expired() {
        let registry = NodeRegistry::new();
        registry.enroll("node-1", None, None).unwrap();
        assert!(registry.reenroll("node-1").is_err());

        registry.record_failure("node-1", 1).unwrap();
        registry.reenroll("node-1").unwrap();
        assert_eq!(registry.get("node-1").unwrap().state.name(), "Pending");
        assert!(registry.record_success("node-1", TTL).is_ok());
    }

    #[test]
    fn test_expire_lapsed() {
        let registry = NodeRegistry::new();
        registry.enroll("node-1", None, None).unwrap();
        registry.enroll("node-2", None, None).unwrap();
        registry.record_success("node-1", Duration::from_millis(1)).unwrap();
        registry.record_success("node-2", TTL).unwrap();

        let lapsed = registry.expire_lapsed(current_timestamp() + 10).unwrap();
        assert_eq!(lapsed, vec!["node-1".to_string()]);
        assert!(registry.get("node-1").unwrap().is_expired());
        assert!(!registry.get("node-2").unwrap().is_expired());
    }

    #[test]
    fn test_rotate_baseline() {
        let registry = NodeRegistry::new();
        registry.enroll("node-1", None, None).unwrap();
        assert!(registry.baseline("node-1").is_none());
        registry.rotate_baseline("node-1", baseline()).unwrap();
        assert_eq!(registry.baseline("node-1").unwrap().len(), 8);
        assert!(registry.rotate_baseline("missing", baseline()).is_err());
    }

    fn write_temp(contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("aegis-baseline-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_baseline_from_json() {
        let mut values = baseline();
        values.reverse();
        let path = write_temp(&serde_json::to_string(&values).unwrap());
        let loaded = load_baseline(&path);
        std::fs::remove_file(&path).unwrap();

        let loaded = loaded.unwrap();
        assert_eq!(loaded, baseline());
        let registry = NodeRegistry::new();
        registry.enroll("node-1", Some(loaded), None).unwrap();
        assert_eq!(registry.baseline("node-1").unwrap().len(), 8);
    }

    #[test]
    fn test_load_baseline_rejects_bad_values() {
        let zeros = "00".repeat(32);
        for contents in [
            "[]".to_string(),
            format!(r#"[{{"index":24,"value":"{zeros}"}}]"#),
            format!(r#"[{{"index":0,"value":"{zeros}"}},{{"index":0,"value":"{zeros}"}}]"#),
            r#"[{"index":0,"value":"abcd"}]"#.to_string(),
        ] {
            let path = write_temp(&contents);
            let result = load_baseline(&path);
            std::fs::remove_file(&path).unwrap();
            assert!(matches!(result, Err(IdentityError::Config(_))), "{contents}");
        }
        assert!(load_baseline("/nonexistent/aegis-baseline.json").is_err());
    }

    #[test]
    fn test_history_is_bounded() {
        let registry = NodeRegistry::new();
        registry.enroll("node-1", None, None).unwrap();
        for _ in 0..(MAX_HISTORY_SIZE + 20) {
            registry.record_success("node-1", TTL).unwrap();
        }
        assert_eq!(registry.get("node-1").unwrap().history.len(), MAX_HISTORY_SIZE);
    }
}
