//! Block as observed from an RPC endpoint

use txflood_crypto::CryptoError;
use txflood_primitives::{Address, H256, U256};

use crate::SignedTransaction;

/// A transaction as listed in a block body.
///
/// Envelopes this crate can re-encode carry the full [`SignedTransaction`]
/// and their sender is recovered from the signature. Other envelope types
/// only keep the fields the pool needs, with the sender taken from the
/// endpoint's `from` field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockTransaction {
    /// Transaction hash
    pub hash: H256,
    /// Sender nonce
    pub nonce: u64,
    /// Sender as reported by the endpoint
    pub reported_from: Option<Address>,
    /// Recipient
    pub to: Option<Address>,
    /// Transferred value
    pub value: U256,
    /// Decoded transaction, when the envelope type is supported
    pub signed: Option<SignedTransaction>,
}

impl BlockTransaction {
    /// Sender of the transaction
    pub fn sender(&self) -> Result<Address, CryptoError> {
        match (&self.signed, self.reported_from) {
            (Some(tx), _) => tx.recover_sender(),
            (None, Some(from)) => Ok(from),
            (None, None) => Err(CryptoError::RecoveryFailed(
                "no signature or reported sender".into(),
            )),
        }
    }
}

impl From<SignedTransaction> for BlockTransaction {
    fn from(tx: SignedTransaction) -> Self {
        Self {
            hash: tx.hash(),
            nonce: tx.nonce(),
            reported_from: None,
            to: tx.to(),
            value: U256::from(tx.value()),
            signed: Some(tx),
        }
    }
}

/// A block with its full transaction list
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// Block number
    pub number: u64,
    /// Block hash
    pub hash: H256,
    /// Hash of the parent block
    pub parent_hash: H256,
    /// Unix timestamp in seconds
    pub timestamp: u64,
    /// Block gas limit
    pub gas_limit: u64,
    /// Gas used by all transactions
    pub gas_used: u64,
    /// Base fee per gas, absent before London
    pub base_fee_per_gas: Option<u128>,
    /// Transactions in block order
    pub transactions: Vec<BlockTransaction>,
}

impl Block {
    /// Number of transactions in the block
    pub fn tx_count(&self) -> usize {
        self.transactions.len()
    }
}
