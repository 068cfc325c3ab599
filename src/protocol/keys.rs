//! Rotating DRM key sessions.
//!
//! A key session bundles several short-lived content keys with staggered
//! expirations. Rotation replaces individual keys as they lapse, on a cycle
//! independent of the streaming session lifetime, so a leaked key is useful
//! for at most one rotation interval.

use log::{debug, info, warn};
use rand_core::{OsRng, RngCore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::error::DeliveryError;

/// One content key with its validity window.
#[derive(Debug, Clone)]
pub struct DrmKey {
    pub key_id: String,
    /// Position in the rotation stagger, stable across rotations.
    pub key_index: u32,
    pub created_at: i64,
    pub expires_at: i64,
    material: [u8; 32],
}

impl DrmKey {
    fn generate(key_index: u32, created_at: i64, expires_at: i64) -> Self {
        let mut material = [0u8; 32];
        OsRng.fill_bytes(&mut material);
        DrmKey {
            key_id: Uuid::new_v4().to_string(),
            key_index,
            created_at,
            expires_at,
            material,
        }
    }

    pub fn material(&self) -> &[u8; 32] {
        &self.material
    }
}

/// A user's rotating key bundle for one video.
#[derive(Debug, Clone)]
pub struct KeySet {
    pub session_id: String,
    pub user_id: String,
    pub video_id: String,
    pub created_at: i64,
    pub keys: Vec<DrmKey>,
}

impl KeySet {
    /// A set is live while any of its keys is still valid.
    pub fn is_live(&self, now: i64) -> bool {
        self.keys.iter().any(|k| now <= k.expires_at)
    }

    /// Expiry of the longest-lived key.
    pub fn expires_at(&self) -> i64 {
        self.keys.iter().map(|k| k.expires_at).max().unwrap_or(self.created_at)
    }
}

/// Issues key sessions and rotates their keys.
#[derive(Clone)]
pub struct KeyManager {
    sets: Arc<RwLock<HashMap<String, Arc<RwLock<KeySet>>>>>,
    keys_per_session: usize,
    rotation_secs: i64,
}

impl KeyManager {
    pub fn new(keys_per_session: usize, rotation_secs: i64) -> Self {
        KeyManager {
            sets: Arc::new(RwLock::new(HashMap::new())),
            keys_per_session,
            rotation_secs,
        }
    }

    /// Create a key session for (user, video), enforcing the concurrency cap
    /// over live key sessions. The i-th key expires (i + 1) rotation
    /// intervals from now.
    pub async fn create_key_session(
        &self,
        user_id: &str,
        video_id: &str,
        cap: usize,
        now: i64,
    ) -> Result<KeySet, DeliveryError> {
        let mut sets = self.sets.write().await;

        let mut active = 0;
        for entry in sets.values() {
            let set = entry.read().await;
            if set.user_id == user_id && set.video_id == video_id && set.is_live(now) {
                active += 1;
            }
        }
        if active >= cap {
            warn!(
                "Key session cap hit for user {} on video {}: {}/{}",
                user_id, video_id, active, cap
            );
            return Err(DeliveryError::ConcurrentStreamLimit { active, cap });
        }

        let keys = (0..self.keys_per_session)
            .map(|i| {
                DrmKey::generate(
                    i as u32,
                    now,
                    now + (i as i64 + 1) * self.rotation_secs,
                )
            })
            .collect();
        let set = KeySet {
            session_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            video_id: video_id.to_string(),
            created_at: now,
            keys,
        };

        info!(
            "Issued key session {} for user {} on video {} ({} keys)",
            set.session_id, user_id, video_id, self.keys_per_session
        );
        sets.insert(set.session_id.clone(), Arc::new(RwLock::new(set.clone())));
        Ok(set)
    }

    /// Replace every lapsed key in every live set with fresh material. A
    /// rotated key keeps its index and moves to the back of the stagger.
    /// Returns the number of keys replaced.
    pub async fn rotate(&self, now: i64) -> usize {
        let sets = self.sets.read().await;
        let mut rotated = 0;

        for entry in sets.values() {
            let mut set = entry.write().await;
            if !set.is_live(now) {
                // fully lapsed sets are the sweeper's problem
                continue;
            }
            let horizon = now + self.keys_per_session as i64 * self.rotation_secs;
            for key in set.keys.iter_mut() {
                if now > key.expires_at {
                    let index = key.key_index;
                    *key = DrmKey::generate(index, now, horizon);
                    rotated += 1;
                }
            }
        }

        if rotated > 0 {
            debug!("Rotated {} lapsed keys", rotated);
        }
        rotated
    }

    /// Hand out key material. The caller is expected to have verified a live
    /// token exchange and abuse standing first; this re-checks ownership and
    /// per-key expiry.
    pub async fn fetch_key(
        &self,
        key_id: &str,
        video_id: &str,
        user_id: &str,
        now: i64,
    ) -> Result<[u8; 32], DeliveryError> {
        let sets = self.sets.read().await;
        for entry in sets.values() {
            let set = entry.read().await;
            let Some(key) = set.keys.iter().find(|k| k.key_id == key_id) else {
                continue;
            };
            if set.user_id != user_id || set.video_id != video_id {
                warn!(
                    "Key {} requested outside its issuing identity (user {}, video {})",
                    key_id, user_id, video_id
                );
                return Err(DeliveryError::KeyAccessDenied {
                    reason: "key was not issued to this identity".to_string(),
                });
            }
            if now > key.expires_at {
                return Err(DeliveryError::KeyAccessDenied {
                    reason: "key has rotated out".to_string(),
                });
            }
            return Ok(*key.material());
        }
        Err(DeliveryError::KeyAccessDenied {
            reason: "unknown key".to_string(),
        })
    }

    /// Remove key sets whose every key lapsed more than `grace` seconds ago.
    pub async fn sweep(&self, now: i64, grace: i64) -> usize {
        let mut sets = self.sets.write().await;
        let mut stale = Vec::new();
        for (id, entry) in sets.iter() {
            let set = entry.read().await;
            if now > set.expires_at() + grace {
                stale.push(id.clone());
            }
        }
        for id in &stale {
            sets.remove(id);
            info!("Swept key session {}", id);
        }
        stale.len()
    }

    /// Live key sessions for a (user, video) pair.
    pub async fn live_count(&self, user_id: &str, video_id: &str, now: i64) -> usize {
        let sets = self.sets.read().await;
        let mut active = 0;
        for entry in sets.values() {
            let set = entry.read().await;
            if set.user_id == user_id && set.video_id == video_id && set.is_live(now) {
                active += 1;
            }
        }
        active
    }

    pub async fn len(&self) -> usize {
        self.sets.read().await.len()
    }
}
