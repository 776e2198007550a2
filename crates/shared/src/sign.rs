//! Content hashing and HMAC signing primitives.
//!
//! Every lineage entry and promotion bundle in the system is signed through
//! this module; nothing else touches the signing key. Verification uses
//! constant-time comparison.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::model::{LineageEntry, PromotionBundle};
use crate::{SpicaError, SpicaResult};

type HmacSha256 = Hmac<Sha256>;

/// SHA-256 of the given bytes, base64-encoded.
#[must_use]
pub fn content_hash_b64(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    BASE64.encode(hasher.finalize())
}

/// Canonical hash of a JSON value (serde_json over BTreeMap-backed types is
/// deterministic).
pub fn hash_json(value: &serde_json::Value) -> anyhow::Result<String> {
    Ok(content_hash_b64(&serde_json::to_vec(value)?))
}

fn mac(key: &[u8]) -> SpicaResult<HmacSha256> {
    HmacSha256::new_from_slice(key)
        .map_err(|_| SpicaError::KeyUnavailable("invalid HMAC key length".into()))
}

/// Constant-time equality over two base64 signatures.
#[must_use]
pub fn signatures_match(expected: &str, actual: &str) -> bool {
    let (Ok(a), Ok(b)) = (BASE64.decode(expected), BASE64.decode(actual)) else {
        return false;
    };
    a.ct_eq(&b).into()
}

// ── Lineage chain ──

/// HMAC-SHA256 over `(parent_hash, entry_hash)`, base64-encoded.
pub fn sign_lineage_entry(key: &[u8], parent_hash: &str, entry_hash: &str) -> SpicaResult<String> {
    let mut mac = mac(key)?;
    mac.update(parent_hash.as_bytes());
    mac.update(b"\x1f"); // field separator: hashes are base64, never contain 0x1f
    mac.update(entry_hash.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Verify a lineage chain from the root. Returns the number of valid leading
/// entries: a corrupted entry invalidates itself and every entry after it,
/// but entries before the corruption remain valid.
pub fn verify_lineage_chain(key: &[u8], chain: &[LineageEntry]) -> SpicaResult<usize> {
    let mut expected_parent = String::new();
    for (i, entry) in chain.iter().enumerate() {
        if entry.parent_hash != expected_parent {
            return Ok(i);
        }
        let expected = sign_lineage_entry(key, &entry.parent_hash, &entry.entry_hash)?;
        if !signatures_match(&expected, &entry.hmac_signature) {
            return Ok(i);
        }
        expected_parent = entry.entry_hash.clone();
    }
    Ok(chain.len())
}

// ── Promotion bundle ──

fn promotion_payload(bundle: &PromotionBundle) -> anyhow::Result<Vec<u8>> {
    let mut payload = serde_json::to_vec(&bundle.winner_config)?;
    payload.push(0x1f);
    payload.extend_from_slice(bundle.tournament_id.to_string().as_bytes());
    payload.push(0x1f);
    payload.extend_from_slice(bundle.created_at.to_rfc3339().as_bytes());
    Ok(payload)
}

/// HMAC-SHA256 over `(winner_config, tournament_id, created_at)`.
pub fn sign_promotion(key: &[u8], bundle: &PromotionBundle) -> SpicaResult<String> {
    let payload = promotion_payload(bundle)
        .map_err(|e| SpicaError::Internal(format!("promotion payload: {e}")))?;
    let mut mac = mac(key)?;
    mac.update(&payload);
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Signature verification failure refuses deployment outright.
pub fn verify_promotion(key: &[u8], bundle: &PromotionBundle) -> SpicaResult<()> {
    let expected = sign_promotion(key, bundle)?;
    if signatures_match(&expected, &bundle.hmac_signature) {
        Ok(())
    } else {
        Err(SpicaError::Signature(format!(
            "promotion bundle {} failed HMAC verification",
            bundle.tournament_id
        )))
    }
}
