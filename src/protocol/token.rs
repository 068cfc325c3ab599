//! Chunk authorization tokens and the delivery hash chain.
//!
//! Each delivered chunk is accompanied by a token that authorizes exactly
//! one follow-up request: the token's `idx` claim names the chunk index it
//! unlocks. The bootstrap token issued with session metadata carries
//! `idx = 0`. Freshness is enforced against the injected [`Clock`] rather
//! than the signature's `exp` so tests and replay analysis see one time
//! source.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::clock::Clock;
use super::error::DeliveryError;

/// Tolerated forward clock skew on the `iat` claim (seconds)
const IAT_SKEW_SECS: i64 = 60;

/// Claims carried by a chunk authorization token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkClaims {
    /// User the token was issued to.
    pub sub: String,
    /// Video the token is bound to.
    pub vid: String,
    /// Client fingerprint the token is bound to.
    pub fpt: String,
    /// Chunk index this token authorizes.
    pub idx: u64,
    pub iat: i64,
    pub exp: i64,
}

/// A signed token together with its freshness deadline.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: i64,
}

/// Issues and validates chunk authorization tokens.
pub struct TokenAuthority {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    token_ttl: i64,
    clock: Arc<dyn Clock>,
}

impl TokenAuthority {
    pub fn new(secret: &[u8], token_ttl_secs: i64, clock: Arc<dyn Clock>) -> Self {
        TokenAuthority {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            token_ttl: token_ttl_secs,
            clock,
        }
    }

    /// Generate a fresh signing secret.
    pub fn random_secret() -> [u8; 32] {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        secret
    }

    /// Issue a token authorizing `chunk_index` for this user, video, and
    /// fingerprint binding.
    pub fn issue(
        &self,
        user_id: &str,
        video_id: &str,
        fingerprint: &str,
        chunk_index: u64,
    ) -> Result<IssuedToken, DeliveryError> {
        let now = self.clock.now();
        let claims = ChunkClaims {
            sub: user_id.to_string(),
            vid: video_id.to_string(),
            fpt: fingerprint.to_string(),
            idx: chunk_index,
            iat: now,
            exp: now + self.token_ttl,
        };
        let token = encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| DeliveryError::Internal(format!("token signing failed: {}", e)))?;
        Ok(IssuedToken {
            token,
            expires_at: claims.exp,
        })
    }

    /// Validate a token against the requested chunk.
    ///
    /// Checks run in order: signature and video binding, fingerprint binding,
    /// freshness, then the authorized index. The first failure wins, so a
    /// stale token for the wrong chunk reports the binding problem rather
    /// than the sequence problem.
    pub fn validate(
        &self,
        token: &str,
        video_id: &str,
        fingerprint: &str,
        requested_index: u64,
    ) -> Result<ChunkClaims, DeliveryError> {
        let claims = self.inspect(token, video_id)?;

        if claims.fpt != fingerprint {
            return Err(DeliveryError::FingerprintMismatch);
        }

        self.check_freshness(&claims)?;

        if claims.idx != requested_index {
            return Err(DeliveryError::InvalidSequence {
                requested: requested_index,
                expected: claims.idx,
            });
        }

        Ok(claims)
    }

    /// Decode a token and verify signature, video binding, and freshness
    /// without pinning it to a chunk index. Used by key delivery, where the
    /// caller only needs proof of a live token exchange.
    pub fn inspect_fresh(&self, token: &str, video_id: &str) -> Result<ChunkClaims, DeliveryError> {
        let claims = self.inspect(token, video_id)?;
        self.check_freshness(&claims)?;
        Ok(claims)
    }

    fn inspect(&self, token: &str, video_id: &str) -> Result<ChunkClaims, DeliveryError> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Freshness is enforced below against the injected clock, not the
        // host clock jsonwebtoken would use.
        validation.validate_exp = false;

        let data = decode::<ChunkClaims>(token, &self.decoding_key, &validation).map_err(|e| {
            DeliveryError::InvalidToken {
                reason: e.to_string(),
            }
        })?;

        if data.claims.vid != video_id {
            return Err(DeliveryError::InvalidToken {
                reason: "token is bound to a different video".to_string(),
            });
        }
        Ok(data.claims)
    }

    fn check_freshness(&self, claims: &ChunkClaims) -> Result<(), DeliveryError> {
        let now = self.clock.now();
        if claims.iat > now + IAT_SKEW_SECS {
            return Err(DeliveryError::InvalidToken {
                reason: "token issued in the future".to_string(),
            });
        }
        if now - claims.iat > self.token_ttl {
            return Err(DeliveryError::TokenExpired {
                issued_at: claims.iat,
                now,
            });
        }
        Ok(())
    }
}

/// Hash-chain link binding the next chunk to this session's history.
///
/// The digest covers the next chunk index, the video, the client
/// fingerprint, and the server timestamp of the current delivery; the client
/// must echo it verbatim with the next request.
pub fn chain_link(next_index: u64, video_id: &str, fingerprint: &str, timestamp: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(next_index.to_string());
    hasher.update(":");
    hasher.update(video_id);
    hasher.update(":");
    hasher.update(fingerprint);
    hasher.update(":");
    hasher.update(timestamp.to_string());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::clock::ManualClock;

    fn authority(clock: Arc<ManualClock>) -> TokenAuthority {
        TokenAuthority::new(b"unit-test-secret", 30, clock)
    }

    #[test]
    fn test_issue_and_validate_round_trip() {
        let clock = Arc::new(ManualClock::at(1_000));
        let auth = authority(clock);

        let issued = auth.issue("u-1", "v-1", "fp-1", 4).unwrap();
        assert_eq!(issued.expires_at, 1_030);

        let claims = auth.validate(&issued.token, "v-1", "fp-1", 4).unwrap();
        assert_eq!(claims.sub, "u-1");
        assert_eq!(claims.idx, 4);
    }

    #[test]
    fn test_stale_token_is_rejected_without_sleeping() {
        let clock = Arc::new(ManualClock::at(1_000));
        let auth = authority(clock.clone());
        let issued = auth.issue("u-1", "v-1", "fp-1", 0).unwrap();

        // 30s is still fresh, 31s is not
        clock.advance(30);
        assert!(auth.validate(&issued.token, "v-1", "fp-1", 0).is_ok());
        clock.advance(1);
        match auth.validate(&issued.token, "v-1", "fp-1", 0) {
            Err(DeliveryError::TokenExpired { issued_at, now }) => {
                assert_eq!(issued_at, 1_000);
                assert_eq!(now, 1_031);
            }
            other => panic!("expected TokenExpired, got {:?}", other),
        }
    }

    #[test]
    fn test_fingerprint_binding() {
        let clock = Arc::new(ManualClock::at(1_000));
        let auth = authority(clock);
        let issued = auth.issue("u-1", "v-1", "fp-1", 0).unwrap();

        match auth.validate(&issued.token, "v-1", "fp-other", 0) {
            Err(DeliveryError::FingerprintMismatch) => {}
            other => panic!("expected FingerprintMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_wrong_index_is_a_sequence_error() {
        let clock = Arc::new(ManualClock::at(1_000));
        let auth = authority(clock);
        let issued = auth.issue("u-1", "v-1", "fp-1", 3).unwrap();

        match auth.validate(&issued.token, "v-1", "fp-1", 7) {
            Err(DeliveryError::InvalidSequence {
                requested,
                expected,
            }) => {
                assert_eq!(requested, 7);
                assert_eq!(expected, 3);
            }
            other => panic!("expected InvalidSequence, got {:?}", other),
        }
    }

    #[test]
    fn test_garbage_and_cross_video_tokens_are_invalid() {
        let clock = Arc::new(ManualClock::at(1_000));
        let auth = authority(clock);

        assert!(matches!(
            auth.validate("not-a-jwt", "v-1", "fp-1", 0),
            Err(DeliveryError::InvalidToken { .. })
        ));

        let issued = auth.issue("u-1", "v-1", "fp-1", 0).unwrap();
        assert!(matches!(
            auth.validate(&issued.token, "v-2", "fp-1", 0),
            Err(DeliveryError::InvalidToken { .. })
        ));
    }

    #[test]
    fn test_foreign_signature_is_rejected() {
        let clock = Arc::new(ManualClock::at(1_000));
        let ours = authority(clock.clone());
        let theirs = TokenAuthority::new(b"some-other-secret", 30, clock);

        let forged = theirs.issue("u-1", "v-1", "fp-1", 0).unwrap();
        assert!(matches!(
            ours.validate(&forged.token, "v-1", "fp-1", 0),
            Err(DeliveryError::InvalidToken { .. })
        ));
    }

    #[test]
    fn test_chain_link_is_deterministic_and_input_sensitive() {
        let a = chain_link(1, "v-1", "fp-1", 1_000);
        let b = chain_link(1, "v-1", "fp-1", 1_000);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        assert_ne!(a, chain_link(2, "v-1", "fp-1", 1_000));
        assert_ne!(a, chain_link(1, "v-2", "fp-1", 1_000));
        assert_ne!(a, chain_link(1, "v-1", "fp-2", 1_000));
        assert_ne!(a, chain_link(1, "v-1", "fp-1", 1_001));
    }

    #[test]
    fn test_random_secret_is_not_constant() {
        assert_ne!(TokenAuthority::random_secret(), TokenAuthority::random_secret());
    }
}
