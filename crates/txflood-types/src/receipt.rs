//! Transaction receipt types

use txflood_primitives::{Address, H256, U256};

/// Execution status of an included transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    /// Transaction reverted
    Failure = 0,
    /// Transaction succeeded
    Success = 1,
}

impl From<bool> for TxStatus {
    fn from(success: bool) -> Self {
        if success {
            TxStatus::Success
        } else {
            TxStatus::Failure
        }
    }
}

/// Receipt of an included transaction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    /// Hash of the transaction
    pub transaction_hash: H256,
    /// Position in the block
    pub transaction_index: u64,
    /// Hash of the including block
    pub block_hash: H256,
    /// Number of the including block
    pub block_number: u64,
    /// Sender
    pub from: Address,
    /// Recipient, `None` for contract creation
    pub to: Option<Address>,
    /// Execution status
    pub status: TxStatus,
    /// Gas used by this transaction
    pub gas_used: u64,
    /// Gas used in the block up to and including this transaction
    pub cumulative_gas_used: u64,
    /// Price per gas actually paid
    pub effective_gas_price: u128,
    /// Created contract, if any
    pub contract_address: Option<Address>,
}

impl Receipt {
    /// True if execution succeeded
    pub fn is_success(&self) -> bool {
        self.status == TxStatus::Success
    }

    /// Total fee paid: `effective_gas_price * gas_used`
    pub fn fee(&self) -> U256 {
        U256::from(self.effective_gas_price) * U256::from(self.gas_used)
    }
}
