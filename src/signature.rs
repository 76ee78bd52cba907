//! Signature verification cache for inbound webhook tokens
//!
//! A token is `base64url(signature || payload)` where `signature` is a 64-byte
//! ed25519 signature over `payload`, and `payload` is JSON
//! `{"exp": <epoch seconds>, "id": "<hex public key>"}`.
//!
//! Verified tokens are remembered until they expire so that a producer
//! reusing one token across many requests pays for the cryptography once.
//! There is no background timer: expired entries are swept on the
//! verification path, whenever a token misses the cache or is found stale.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ed25519_dalek::{
    Signature, SignatureError, Signer, SigningKey, VerifyingKey, PUBLIC_KEY_LENGTH,
    SIGNATURE_LENGTH,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, thiserror::Error)]
pub enum PublicKeyError {
    #[error("public key is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("public key must be {expected} bytes, got {0}", expected = PUBLIC_KEY_LENGTH)]
    Length(usize),
    #[error("public key is not a valid ed25519 point: {0}")]
    Invalid(#[from] SignatureError),
}

/// Why a token failed verification (logged, never returned to callers)
#[derive(Debug, thiserror::Error)]
enum TokenRejection {
    #[error("token is not base64url: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("token too short ({0} bytes)")]
    TooShort(usize),
    #[error("token payload is not valid claims JSON: {0}")]
    Claims(#[from] serde_json::Error),
    #[error("token expired at {0}")]
    Expired(i64),
    #[error("unknown public key {0}")]
    UnknownKey(String),
    #[error("bad signature: {0}")]
    Signature(#[from] SignatureError),
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    exp: i64,
    id: String,
}

/// Parse a hex encoded ed25519 public key, returning it with its key id
pub fn parse_public_key(hex_key: &str) -> Result<(String, VerifyingKey), PublicKeyError> {
    let bytes = hex::decode(hex_key.trim())?;
    let bytes: [u8; PUBLIC_KEY_LENGTH] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| PublicKeyError::Length(bytes.len()))?;
    let key = VerifyingKey::from_bytes(&bytes)?;
    Ok((key_id(&key), key))
}

/// Key id used in token claims: lowercase hex of the public key
pub fn key_id(key: &VerifyingKey) -> String {
    hex::encode(key.as_bytes())
}

/// Producer-side helper: sign a token valid until `exp` (epoch seconds)
///
/// The sink itself only verifies. This is for webhook producers, fixtures and
/// operator tooling that need to mint a token for a trusted key.
pub fn issue_token(signing_key: &SigningKey, exp: i64) -> Result<String, serde_json::Error> {
    let claims = TokenClaims {
        exp,
        id: key_id(&signing_key.verifying_key()),
    };
    let payload = serde_json::to_vec(&claims)?;
    let signature = signing_key.sign(&payload);

    let mut envelope = Vec::with_capacity(SIGNATURE_LENGTH + payload.len());
    envelope.extend_from_slice(&signature.to_bytes());
    envelope.extend_from_slice(&payload);
    Ok(URL_SAFE_NO_PAD.encode(envelope))
}

pub struct SignatureCache {
    known_keys: HashMap<String, VerifyingKey>,

    /// token -> expiry (epoch seconds)
    entries: Mutex<HashMap<String, i64>>,

    /// Number of cryptographic verifications performed
    verifications: AtomicU64,

    /// Timestamp function (for testing with mock time)
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl SignatureCache {
    /// Create a cache trusting `known_keys` (key id -> key), using system time
    pub fn new(known_keys: HashMap<String, VerifyingKey>) -> Self {
        Self::new_with_clock(known_keys, Box::new(|| chrono::Utc::now().timestamp()))
    }

    /// Create a cache with a custom timestamp function
    pub fn new_with_clock(
        known_keys: HashMap<String, VerifyingKey>,
        now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    ) -> Self {
        Self {
            known_keys,
            entries: Mutex::new(HashMap::new()),
            verifications: AtomicU64::new(0),
            now_fn,
        }
    }

    pub fn from_hex_keys<I, S>(keys: I) -> Result<Self, PublicKeyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let known_keys = keys
            .into_iter()
            .map(|k| parse_public_key(k.as_ref()))
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(Self::new(known_keys))
    }

    /// Check a token, consulting the cache first
    ///
    /// Fails closed: any decoding problem, an expired or unknown key, or a bad
    /// signature returns `false` and nothing is cached.
    pub fn verify(&self, token: &str) -> bool {
        let now = (self.now_fn)();

        {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(&expires_at) = entries.get(token) {
                if now < expires_at {
                    return true;
                }
                entries.remove(token);
                sweep(&mut entries, now);
                log::debug!("Cached signature expired at {}, caller must re-sign", expires_at);
                return false;
            }
            sweep(&mut entries, now);
        }

        // Cryptography runs outside the lock
        match self.check_token(token, now) {
            Ok(expires_at) => {
                self.entries
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(token.to_string(), expires_at);
                true
            }
            Err(reason) => {
                log::warn!("⚠️  Rejected webhook signature: {}", reason);
                false
            }
        }
    }

    fn check_token(&self, token: &str, now: i64) -> Result<i64, TokenRejection> {
        let envelope = URL_SAFE_NO_PAD.decode(token.trim().trim_end_matches('='))?;
        if envelope.len() <= SIGNATURE_LENGTH {
            return Err(TokenRejection::TooShort(envelope.len()));
        }

        let (signature_bytes, payload) = envelope.split_at(SIGNATURE_LENGTH);
        let claims: TokenClaims = serde_json::from_slice(payload)?;

        if now >= claims.exp {
            return Err(TokenRejection::Expired(claims.exp));
        }

        let key = self
            .known_keys
            .get(&claims.id.to_ascii_lowercase())
            .ok_or_else(|| TokenRejection::UnknownKey(claims.id.clone()))?;

        let signature = Signature::from_slice(signature_bytes)?;
        self.verifications.fetch_add(1, Ordering::Relaxed);
        key.verify_strict(payload, &signature)?;

        Ok(claims.exp)
    }

    pub fn verifications(&self) -> u64 {
        self.verifications.load(Ordering::Relaxed)
    }

    /// Entries currently cached, including ones not yet swept
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn sweep(entries: &mut HashMap<String, i64>, now: i64) {
    let before = entries.len();
    entries.retain(|_, expires_at| now < *expires_at);
    let evicted = before - entries.len();
    if evicted > 0 {
        log::debug!("Evicted {} expired signatures", evicted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const SEED: [u8; 32] = [7u8; 32];
    const OTHER_SEED: [u8; 32] = [9u8; 32];

    /// Cache trusting SEED's key, with a clock the test can move
    fn cache_with_clock(start: i64) -> (SignatureCache, Arc<AtomicU64>) {
        let clock = Arc::new(AtomicU64::new(start as u64));
        let clock_fn = clock.clone();
        let key = SigningKey::from_bytes(&SEED).verifying_key();
        let known = HashMap::from([(key_id(&key), key)]);
        let cache = SignatureCache::new_with_clock(
            known,
            Box::new(move || clock_fn.load(Ordering::SeqCst) as i64),
        );
        (cache, clock)
    }

    #[test]
    fn test_valid_token_verified_once() {
        let (cache, _clock) = cache_with_clock(1_000);
        let token = issue_token(&SigningKey::from_bytes(&SEED), 2_000).unwrap();

        assert!(cache.verify(&token));
        assert!(cache.verify(&token));
        assert_eq!(cache.verifications(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_expired_token_rejected() {
        let (cache, _clock) = cache_with_clock(5_000);
        let token = issue_token(&SigningKey::from_bytes(&SEED), 4_999).unwrap();

        assert!(!cache.verify(&token));
        assert!(cache.is_empty());
        // Expiry is checked before any cryptography
        assert_eq!(cache.verifications(), 0);

        // exp == now is already expired
        let token = issue_token(&SigningKey::from_bytes(&SEED), 5_000).unwrap();
        assert!(!cache.verify(&token));
    }

    #[test]
    fn test_cached_token_expires() {
        let (cache, clock) = cache_with_clock(1_000);
        let token = issue_token(&SigningKey::from_bytes(&SEED), 1_500).unwrap();

        assert!(cache.verify(&token));

        clock.store(1_500, Ordering::SeqCst);
        assert!(!cache.verify(&token));
        assert!(cache.is_empty());

        // Still rejected on the slow path afterwards
        assert!(!cache.verify(&token));
    }

    #[test]
    fn test_sweep_on_miss_evicts_stale_entries() {
        let (cache, clock) = cache_with_clock(1_000);
        let key = SigningKey::from_bytes(&SEED);

        assert!(cache.verify(&issue_token(&key, 1_100).unwrap()));
        assert!(cache.verify(&issue_token(&key, 1_200).unwrap()));
        assert_eq!(cache.len(), 2);

        clock.store(1_150, Ordering::SeqCst);
        assert!(cache.verify(&issue_token(&key, 5_000).unwrap()));

        // 1_100 swept, 1_200 and 5_000 remain
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let (cache, _clock) = cache_with_clock(1_000);
        let token = issue_token(&SigningKey::from_bytes(&OTHER_SEED), 2_000).unwrap();

        assert!(!cache.verify(&token));
        assert!(cache.is_empty());
        assert_eq!(cache.verifications(), 0);
    }

    #[test]
    fn test_tampered_token_rejected() {
        let (cache, _clock) = cache_with_clock(1_000);
        let signing_key = SigningKey::from_bytes(&SEED);

        // Signature made over a different payload than the one carried
        let claims = serde_json::to_vec(&TokenClaims {
            exp: 2_000,
            id: key_id(&signing_key.verifying_key()),
        })
        .unwrap();
        let forged_claims = serde_json::to_vec(&TokenClaims {
            exp: 9_999_999,
            id: key_id(&signing_key.verifying_key()),
        })
        .unwrap();
        let signature = signing_key.sign(&claims);
        let mut envelope = signature.to_bytes().to_vec();
        envelope.extend_from_slice(&forged_claims);
        let token = URL_SAFE_NO_PAD.encode(envelope);

        assert!(!cache.verify(&token));
        assert_eq!(cache.verifications(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_garbage_tokens_fail_closed() {
        let (cache, _clock) = cache_with_clock(1_000);

        assert!(!cache.verify(""));
        assert!(!cache.verify("not base64 !!"));
        assert!(!cache.verify(&URL_SAFE_NO_PAD.encode([0u8; 10])));
        assert!(!cache.verify(&URL_SAFE_NO_PAD.encode([0u8; 80])));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_padded_token_accepted() {
        let (cache, _clock) = cache_with_clock(1_000);
        let mut token = issue_token(&SigningKey::from_bytes(&SEED), 2_000).unwrap();
        while token.len() % 4 != 0 {
            token.push('=');
        }

        assert!(cache.verify(&token));
    }

    #[test]
    fn test_issued_token_carries_signed_claims() {
        let signing_key = SigningKey::from_bytes(&SEED);
        let token = issue_token(&signing_key, 2_000).unwrap();

        let envelope = URL_SAFE_NO_PAD.decode(&token).unwrap();
        let (signature, payload) = envelope.split_at(SIGNATURE_LENGTH);
        let claims: TokenClaims = serde_json::from_slice(payload).unwrap();

        assert_eq!(claims.exp, 2_000);
        assert_eq!(claims.id, key_id(&signing_key.verifying_key()));
        assert!(signing_key
            .verifying_key()
            .verify_strict(payload, &Signature::from_slice(signature).unwrap())
            .is_ok());
    }

    #[test]
    fn test_parse_public_key() {
        let key = SigningKey::from_bytes(&SEED).verifying_key();
        let encoded = hex::encode(key.as_bytes());

        let (id, parsed) = parse_public_key(&encoded.to_uppercase()).unwrap();
        assert_eq!(id, encoded);
        assert_eq!(parsed, key);

        assert!(matches!(
            parse_public_key("abcd"),
            Err(PublicKeyError::Length(2))
        ));
        assert!(matches!(parse_public_key("zz"), Err(PublicKeyError::Hex(_))));
    }
}
