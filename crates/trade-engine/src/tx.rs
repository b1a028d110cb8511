//! Transaction model for the escrow protocol
//!
//! Transactions are hashed over a canonical `key=value\n` encoding so both
//! counterparties can build the same deposit transaction independently and
//! compare digests. The txid is always self-computed, never taken from the
//! peer's serialized bytes.

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 32-byte public key used for multisig escrow outputs
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PubKey(pub [u8; 32]);

impl PubKey {
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| anyhow!("Invalid public key hex: {}", e))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| anyhow!("Invalid public key length: expected 32 bytes, got {}", b.len()))?;
        Ok(PubKey(arr))
    }
}

impl std::fmt::Display for PubKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for PubKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PubKey({})", self.to_hex())
    }
}

impl Serialize for PubKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PubKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PubKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Reference to an unspent output being consumed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub prev_txid: String,
    pub prev_vout: u32,
    pub value: u64,
}

/// Value paid to an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: String,
    pub value: u64,
}

/// Unsigned transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTransaction {
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl RawTransaction {
    /// Canonical `key=value\n` encoding over which the txid is computed.
    ///
    /// Inputs and outputs are encoded in their stored order; callers that need
    /// both sides to agree on a digest must insert in deterministic order
    /// (see [`sort_inputs`]).
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut s = String::from("tx_type=raw\n");
        for input in &self.inputs {
            s.push_str(&format!(
                "in={}:{}:{}\n",
                input.prev_txid, input.prev_vout, input.value
            ));
        }
        for output in &self.outputs {
            s.push_str(&format!("out={}:{}\n", output.address, output.value));
        }
        s.into_bytes()
    }

    /// Self-computed transaction id: hex SHA-256 of the canonical encoding
    pub fn txid(&self) -> String {
        hex::encode(Sha256::digest(self.canonical_bytes()))
    }

    pub fn total_input_value(&self) -> u64 {
        self.inputs.iter().map(|i| i.value).sum()
    }

    pub fn total_output_value(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }
}

/// Sort inputs into the deterministic order both parties use when building
/// the shared deposit transaction.
pub fn sort_inputs(inputs: &mut [TxInput]) {
    inputs.sort_by(|a, b| {
        (a.prev_txid.as_str(), a.prev_vout).cmp(&(b.prev_txid.as_str(), b.prev_vout))
    });
}

/// One party's Ed25519 signature over a transaction digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureShare {
    pub signer: PubKey,
    /// Base64-encoded 64-byte signature
    pub signature_b64: String,
}

/// Fully signed transaction with signature shares in canonical order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub tx: RawTransaction,
    pub signatures: Vec<SignatureShare>,
}

impl SignedTransaction {
    /// Assemble both parties' shares in canonical multisig order.
    ///
    /// Canonical order is ascending signer key bytes, the same ordering used
    /// to derive the multisig address, so assembly and address derivation can
    /// never disagree. Fails if the shares do not come from exactly the two
    /// expected keys.
    pub fn assemble(
        tx: RawTransaction,
        shares: Vec<SignatureShare>,
        expected_signers: [PubKey; 2],
    ) -> Result<Self> {
        if shares.len() != 2 {
            bail!("Expected exactly 2 signature shares, got {}", shares.len());
        }

        let mut expected = expected_signers;
        expected.sort();

        let mut signatures = shares;
        signatures.sort_by_key(|s| s.signer);

        let actual = [signatures[0].signer, signatures[1].signer];
        if actual != expected {
            bail!(
                "Signature shares from unexpected keys: got [{}, {}], expected [{}, {}]",
                actual[0],
                actual[1],
                expected[0],
                expected[1]
            );
        }

        Ok(SignedTransaction { tx, signatures })
    }

    pub fn txid(&self) -> String {
        self.tx.txid()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("SignedTransaction serialization cannot fail")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| anyhow!("Invalid signed transaction bytes: {}", e))
    }
}

/// This party's half of the deposit transaction, sent to the finalizing peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialDeposit {
    pub tx: RawTransaction,
    pub signature: SignatureShare,
}

/// Payload of a deposit-transaction message.
///
/// The funding side sends its `Partial` half to the finalizer; the finalizer
/// answers with the `Published` fully signed transaction so both sides hold
/// the deposit record the payout protocols build on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DepositPayload {
    Partial(PartialDeposit),
    Published(SignedTransaction),
}

impl DepositPayload {
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("DepositPayload serialization cannot fail")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| anyhow!("Invalid deposit payload bytes: {}", e))
    }
}

/// Derive the 2-of-2 multisig escrow address from both parties' keys.
///
/// Keys are sorted before hashing so both sides derive the same address
/// regardless of argument order.
pub fn multisig_address(a: &PubKey, b: &PubKey) -> String {
    let (first, second) = if a.0 <= b.0 { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(b"escrow-2of2:");
    hasher.update(first.0);
    hasher.update(second.0);
    bs58::encode(hasher.finalize()).into_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> PubKey {
        PubKey([byte; 32])
    }

    fn sample_tx() -> RawTransaction {
        RawTransaction {
            inputs: vec![TxInput {
                prev_txid: "aa".repeat(32),
                prev_vout: 0,
                value: 1_002_000,
            }],
            outputs: vec![TxOutput {
                address: "escrow-addr".to_string(),
                value: 1_000_000,
            }],
        }
    }

    #[test]
    fn test_txid_is_deterministic() {
        let tx = sample_tx();
        assert_eq!(tx.txid(), tx.clone().txid());
        assert_eq!(tx.txid().len(), 64);
    }

    #[test]
    fn test_txid_changes_with_content() {
        let tx = sample_tx();
        let mut other = tx.clone();
        other.outputs[0].value += 1;
        assert_ne!(tx.txid(), other.txid());
    }

    #[test]
    fn test_sort_inputs_deterministic() {
        let a = TxInput { prev_txid: "bb".to_string(), prev_vout: 0, value: 1 };
        let b = TxInput { prev_txid: "aa".to_string(), prev_vout: 1, value: 2 };
        let c = TxInput { prev_txid: "aa".to_string(), prev_vout: 0, value: 3 };

        let mut one = vec![a.clone(), b.clone(), c.clone()];
        let mut two = vec![c.clone(), a.clone(), b.clone()];
        sort_inputs(&mut one);
        sort_inputs(&mut two);
        assert_eq!(one, two);
        assert_eq!(one[0], c);
        assert_eq!(one[2], a);
    }

    #[test]
    fn test_multisig_address_order_independent() {
        let (a, b) = (key(1), key(2));
        assert_eq!(multisig_address(&a, &b), multisig_address(&b, &a));
        assert_ne!(multisig_address(&a, &b), multisig_address(&a, &key(3)));
    }

    #[test]
    fn test_assemble_sorts_canonically() {
        let (low, high) = (key(1), key(2));
        let share_high = SignatureShare { signer: high, signature_b64: "hh".to_string() };
        let share_low = SignatureShare { signer: low, signature_b64: "ll".to_string() };

        let signed = SignedTransaction::assemble(
            sample_tx(),
            vec![share_high, share_low],
            [high, low],
        )
        .unwrap();

        assert_eq!(signed.signatures[0].signer, low);
        assert_eq!(signed.signatures[1].signer, high);
    }

    #[test]
    fn test_assemble_rejects_unexpected_signer() {
        let share_a = SignatureShare { signer: key(1), signature_b64: "a".to_string() };
        let share_c = SignatureShare { signer: key(3), signature_b64: "c".to_string() };

        let result = SignedTransaction::assemble(sample_tx(), vec![share_a, share_c], [key(1), key(2)]);
        assert!(result.is_err());
    }

    #[test]
    fn test_signed_tx_roundtrip() {
        let signed = SignedTransaction::assemble(
            sample_tx(),
            vec![
                SignatureShare { signer: key(1), signature_b64: "a".to_string() },
                SignatureShare { signer: key(2), signature_b64: "b".to_string() },
            ],
            [key(1), key(2)],
        )
        .unwrap();

        let restored = SignedTransaction::from_bytes(&signed.to_bytes()).unwrap();
        assert_eq!(restored, signed);
        assert_eq!(restored.txid(), signed.txid());
    }

    #[test]
    fn test_deposit_payload_roundtrip() {
        let partial = DepositPayload::Partial(PartialDeposit {
            tx: sample_tx(),
            signature: SignatureShare { signer: key(1), signature_b64: "s".to_string() },
        });
        match DepositPayload::from_bytes(&partial.to_bytes()).unwrap() {
            DepositPayload::Partial(p) => assert_eq!(p.tx.txid(), sample_tx().txid()),
            DepositPayload::Published(_) => panic!("wrong variant"),
        }
        assert!(DepositPayload::from_bytes(b"garbage").is_err());
    }

    #[test]
    fn test_pubkey_hex_roundtrip() {
        let k = key(7);
        assert_eq!(PubKey::from_hex(&k.to_hex()).unwrap(), k);
        assert!(PubKey::from_hex("zz").is_err());
        assert!(PubKey::from_hex("aabb").is_err());
    }
}
