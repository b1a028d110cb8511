//! Message-level Ed25519 signing for peer-to-peer trade messages
//!
//! Provides canonical payload construction, sealing, and verification for the
//! deposit-transaction and mediated-payout messages exchanged between trade
//! counterparties.
//!
//! ## Canonical Format
//!
//! Each message is serialized as `key=value\n` lines in a fixed order per
//! message type. Optional fields are omitted when absent. Binary fields are
//! base64-encoded. The SHA-256 hash of this canonical payload is signed with
//! Ed25519.
//!
//! ## Signing Scheme
//!
//! `ed25519-sha256-v1`: Sign(Ed25519, SHA-256(canonical_payload))

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD};
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

pub const SIGNING_SCHEME: &str = "ed25519-sha256-v1";

/// Detached envelope over a canonical payload
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Base64-encoded Ed25519 signature (64 bytes)
    pub signature_b64: String,
    /// Base64url-encoded Ed25519 public key of the sender (32 bytes)
    pub sender_key_b64url: String,
    /// Signing scheme identifier
    pub signing_scheme: String,
}

/// Seal a canonical payload: SHA-256 hash then Ed25519 sign
pub fn seal(private_key: &[u8; 32], canonical: &[u8]) -> Envelope {
    let hash = Sha256::digest(canonical);
    let signing_key = SigningKey::from_bytes(private_key);
    let signature = signing_key.sign(&hash);

    Envelope {
        signature_b64: BASE64.encode(signature.to_bytes()),
        sender_key_b64url: URL_SAFE_NO_PAD.encode(signing_key.verifying_key().as_bytes()),
        signing_scheme: SIGNING_SCHEME.to_string(),
    }
}

/// Verify an envelope against a canonical payload and the expected sender key
pub fn open(expected_sender: &[u8; 32], canonical: &[u8], envelope: &Envelope) -> Result<()> {
    if envelope.signing_scheme != SIGNING_SCHEME {
        return Err(anyhow!(
            "Unsupported signing scheme '{}', expected '{}'",
            envelope.signing_scheme,
            SIGNING_SCHEME
        ));
    }

    let claimed = parse_sender_key(&envelope.sender_key_b64url)?;
    if &claimed != expected_sender {
        return Err(anyhow!("Envelope sender key does not match expected peer key"));
    }

    let verifying_key = VerifyingKey::from_bytes(expected_sender)
        .map_err(|e| anyhow!("Invalid sender public key: {}", e))?;

    let sig_bytes = BASE64
        .decode(&envelope.signature_b64)
        .map_err(|e| anyhow!("Invalid signature base64: {}", e))?;
    let sig_array: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow!("Invalid signature length: expected 64 bytes, got {}", b.len()))?;

    let hash = Sha256::digest(canonical);
    verifying_key
        .verify(&hash, &Signature::from_bytes(&sig_array))
        .map_err(|_| anyhow!("Message signature verification failed"))
}

/// Parse a base64url-encoded sender key to bytes
pub fn parse_sender_key(sender_key_b64url: &str) -> Result<[u8; 32]> {
    let bytes = URL_SAFE_NO_PAD
        .decode(sender_key_b64url)
        .map_err(|e| anyhow!("Invalid sender key base64url: {}", e))?;

    bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow!("Invalid sender key length: expected 32 bytes, got {}", b.len()))
}

// ============================================================================
// Canonical payload builders — one per peer message type
// ============================================================================

/// Canonical payload for a deposit-transaction message.
pub fn canonical_deposit_tx(message_id: &str, trade_id: &str, sender: &str, tx_bytes: &[u8]) -> Vec<u8> {
    format!(
        "msg_type=DepositTx\nmessage_id={}\ntrade_id={}\nsender={}\ntx={}\n",
        message_id,
        trade_id,
        sender,
        BASE64.encode(tx_bytes),
    )
    .into_bytes()
}

/// Canonical payload for a mediated-payout signature message.
pub fn canonical_payout_signature(
    message_id: &str,
    trade_id: &str,
    sender: &str,
    signer_key_hex: &str,
    signature: &[u8],
) -> Vec<u8> {
    format!(
        "msg_type=MediatedPayoutSignature\nmessage_id={}\ntrade_id={}\nsender={}\nsigner_key={}\nsignature={}\n",
        message_id,
        trade_id,
        sender,
        signer_key_hex,
        BASE64.encode(signature),
    )
    .into_bytes()
}

/// Canonical payload for a mediated-payout-published message.
pub fn canonical_payout_published(
    message_id: &str,
    trade_id: &str,
    sender: &str,
    tx_bytes: &[u8],
) -> Vec<u8> {
    format!(
        "msg_type=MediatedPayoutPublished\nmessage_id={}\ntrade_id={}\nsender={}\ntx={}\n",
        message_id,
        trade_id,
        sender,
        BASE64.encode(tx_bytes),
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    #[test]
    fn test_seal_open_roundtrip() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let private_key = signing_key.to_bytes();
        let public_key = signing_key.verifying_key().to_bytes();

        let canonical = canonical_deposit_tx("msg-1", "trade-1", "node-a:9999", b"rawtx");
        let envelope = seal(&private_key, &canonical);
        assert_eq!(envelope.signing_scheme, SIGNING_SCHEME);

        open(&public_key, &canonical, &envelope).expect("verification should succeed");
    }

    #[test]
    fn test_tampered_payload_fails() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let private_key = signing_key.to_bytes();
        let public_key = signing_key.verifying_key().to_bytes();

        let canonical = canonical_payout_published("msg-1", "trade-1", "node-a:9999", b"payout");
        let envelope = seal(&private_key, &canonical);

        let tampered = canonical_payout_published("msg-1", "trade-1", "attacker:9999", b"payout");
        assert!(open(&public_key, &tampered, &envelope).is_err());
    }

    #[test]
    fn test_wrong_sender_key_fails() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let other_key = SigningKey::generate(&mut OsRng);

        let canonical = canonical_payout_signature("msg-1", "trade-1", "node-a:9999", "aa", b"sig");
        let envelope = seal(&signing_key.to_bytes(), &canonical);

        let result = open(&other_key.verifying_key().to_bytes(), &canonical, &envelope);
        assert!(result.is_err());
    }

    #[test]
    fn test_unsupported_scheme_rejected() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public_key = signing_key.verifying_key().to_bytes();

        let canonical = b"test";
        let mut envelope = seal(&signing_key.to_bytes(), canonical);
        envelope.signing_scheme = "rsa-sha256-v1".to_string();

        let result = open(&public_key, canonical, &envelope);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Unsupported signing scheme"));
    }

    #[test]
    fn test_canonical_determinism() {
        let c1 = canonical_deposit_tx("m", "t", "s", b"bytes");
        let c2 = canonical_deposit_tx("m", "t", "s", b"bytes");
        assert_eq!(c1, c2);
    }

    #[test]
    fn test_parse_sender_key_roundtrip() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public_key = signing_key.verifying_key().to_bytes();
        let encoded = URL_SAFE_NO_PAD.encode(public_key);
        assert_eq!(parse_sender_key(&encoded).unwrap(), public_key);
    }
}
