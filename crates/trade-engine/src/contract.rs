//! Agreed trade terms
//!
//! The contract is fixed when the offer is taken. Its hash is recorded on the
//! trade at creation and re-checked before any payout signature is produced —
//! a mismatch means the session data was tampered with.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::tx::PubKey;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub maker_node_address: String,
    pub taker_node_address: String,
    pub maker_payout_address: String,
    pub taker_payout_address: String,
    /// Whether the maker takes the buyer side of this trade
    pub buyer_is_maker: bool,
    /// Trade amount in base units
    pub trade_amount: u64,
    /// Agreed price per unit in the fiat/counter currency
    pub price: Decimal,
    pub currency_code: String,
    pub buyer_security_deposit: u64,
    pub seller_security_deposit: u64,
    pub maker_multisig_key: PubKey,
    pub taker_multisig_key: PubKey,
}

impl Contract {
    /// Canonical `key=value\n` encoding, hashed for the recorded contract hash
    pub fn canonical_bytes(&self) -> Vec<u8> {
        format!(
            "contract_v=1\nmaker={}\ntaker={}\nmaker_payout={}\ntaker_payout={}\nbuyer_is_maker={}\namount={}\nprice={}\ncurrency={}\nbuyer_deposit={}\nseller_deposit={}\nmaker_key={}\ntaker_key={}\n",
            self.maker_node_address,
            self.taker_node_address,
            self.maker_payout_address,
            self.taker_payout_address,
            self.buyer_is_maker,
            self.trade_amount,
            self.price,
            self.currency_code,
            self.buyer_security_deposit,
            self.seller_security_deposit,
            self.maker_multisig_key,
            self.taker_multisig_key,
        )
        .into_bytes()
    }

    /// Hex SHA-256 over the canonical encoding
    pub fn hash(&self) -> String {
        hex::encode(Sha256::digest(self.canonical_bytes()))
    }

    /// Everything the deposit transaction escrows
    pub fn total_escrow(&self) -> u64 {
        self.buyer_security_deposit + self.seller_security_deposit + self.trade_amount
    }

    pub fn buyer_payout_address(&self) -> &str {
        if self.buyer_is_maker {
            &self.maker_payout_address
        } else {
            &self.taker_payout_address
        }
    }

    pub fn seller_payout_address(&self) -> &str {
        if self.buyer_is_maker {
            &self.taker_payout_address
        } else {
            &self.maker_payout_address
        }
    }

    pub fn multisig_keys(&self) -> [PubKey; 2] {
        [self.maker_multisig_key, self.taker_multisig_key]
    }

    pub fn own_multisig_key(&self, is_maker: bool) -> PubKey {
        if is_maker {
            self.maker_multisig_key
        } else {
            self.taker_multisig_key
        }
    }

    pub fn peer_multisig_key(&self, is_maker: bool) -> PubKey {
        if is_maker {
            self.taker_multisig_key
        } else {
            self.maker_multisig_key
        }
    }
}
