//! Transactions and unspent outputs.
//!
//! The wire format carries a single payment (`send_to`, `amount`); strict
//! UTXO accounting is recovered by synthesizing a change output for any
//! leftover input value when a transaction is applied to a view.

use std::fmt;

use serde_derive::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::destination::Destination;
use crate::hash::Hash256;

#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize,
)]
pub struct OutPoint {
    pub txid: Hash256,
    pub n: u8,
}

impl OutPoint {
    pub fn new(txid: Hash256, n: u8) -> Self {
        OutPoint { txid, n }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.n)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TxIn {
    pub prevout: OutPoint,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TxOut {
    pub dest: Destination,
    pub amount: Amount,
    pub tx_time: u32,
    pub lock_until: u32,
}

impl TxOut {
    pub fn new(dest: Destination, amount: Amount, tx_time: u32, lock_until: u32) -> Self {
        TxOut {
            dest,
            amount,
            tx_time,
            lock_until,
        }
    }

    pub fn is_null(&self) -> bool {
        self.amount <= 0 || self.dest.is_null()
    }

    /// Whether this output may not be spent yet at `height`.
    pub fn is_locked(&self, height: u32) -> bool {
        self.lock_until != 0 && height <= self.lock_until
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, Serialize, Deserialize)]
pub enum TxType {
    Token,
    /// Genesis mint.
    Genesis,
    /// Proof-of-work mint.
    Work,
    /// Delegated proof-of-stake mint.
    Stake,
    /// Delegate enrollment certificate.
    Cert,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u16,
    pub tx_type: TxType,
    pub tx_time: u32,
    pub lock_until: u32,
    pub inputs: Vec<TxIn>,
    pub send_to: Destination,
    pub amount: Amount,
    pub fee: Amount,
    pub data: Vec<u8>,
    pub sig: Vec<u8>,
}

impl Transaction {
    pub fn is_mint(&self) -> bool {
        matches!(self.tx_type, TxType::Genesis | TxType::Work | TxType::Stake)
    }

    pub fn txid(&self) -> Hash256 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.version.to_le_bytes());
        hasher.update(&(self.tx_type as u8).to_le_bytes());
        hasher.update(&self.tx_time.to_le_bytes());
        hasher.update(&self.lock_until.to_le_bytes());
        for input in &self.inputs {
            hasher.update(input.prevout.txid.as_bytes());
            hasher.update(&[input.prevout.n]);
        }
        hasher.update(self.send_to.as_bytes());
        hasher.update(&self.amount.to_le_bytes());
        hasher.update(&self.fee.to_le_bytes());
        hasher.update(&self.data);
        Hash256::from(hasher.finalize())
    }

    /// Anchor height of an enrollment certificate, stored as a little
    /// endian prefix of the payload; the remainder is the cert data proper.
    pub fn cert_anchor(&self) -> Option<(u32, &[u8])> {
        if self.tx_type != TxType::Cert || self.data.len() <= 4 {
            return None;
        }
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&self.data[..4]);
        Some((u32::from_le_bytes(prefix), &self.data[4..]))
    }
}

/// Resolved spending context of one transaction: who signed it and what
/// each input was worth when it was created.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct TxContext {
    pub dest_in: Destination,
    pub inputs: Vec<TxOut>,
}

impl TxContext {
    pub fn value_in(&self) -> Amount {
        self.inputs.iter().map(|i| i.amount).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            tx_type: TxType::Token,
            tx_time: 100,
            lock_until: 0,
            inputs: vec![TxIn {
                prevout: OutPoint::new(Hash256::digest(b"prev"), 0),
            }],
            send_to: Destination::from_bytes([7u8; 32]),
            amount: 500,
            fee: 10,
            data: vec![],
            sig: vec![],
        }
    }

    #[test]
    fn txid_covers_payment_fields() {
        let tx = sample_tx();
        let mut other = tx.clone();
        other.amount += 1;
        assert_ne!(tx.txid(), other.txid());
    }

    #[test]
    fn cert_anchor_requires_prefix() {
        let mut tx = sample_tx();
        tx.tx_type = TxType::Cert;
        tx.data = vec![];
        assert!(tx.cert_anchor().is_none());
        tx.data = 42u32.to_le_bytes().iter().copied().chain([1, 2, 3]).collect();
        let (anchor, payload) = tx.cert_anchor().unwrap();
        assert_eq!(anchor, 42);
        assert_eq!(payload, &[1, 2, 3]);
    }

    #[test]
    fn lock_applies_through_lock_height() {
        let out = TxOut::new(Destination::from_bytes([1u8; 32]), 10, 0, 5);
        assert!(out.is_locked(5));
        assert!(!out.is_locked(6));
        let unlocked = TxOut::new(Destination::from_bytes([1u8; 32]), 10, 0, 0);
        assert!(!unlocked.is_locked(0));
    }
}
