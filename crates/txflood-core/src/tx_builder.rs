//! Fluent builder for unsigned transactions
//!
//! Nonce and chain id are left to the [`crate::Account`] that signs the result.

use bytes::Bytes;
use txflood_primitives::Address;
use txflood_types::{AccessListItem, DynamicFeeTx, LegacyTx, TransactionBody};

use crate::{PoolError, PoolResult};

/// Transaction builder with fluent API
#[derive(Debug, Clone, Default)]
pub struct TxBuilder {
    gas_limit: Option<u64>,
    gas_price: Option<u128>,
    max_fee_per_gas: Option<u128>,
    max_priority_fee_per_gas: Option<u128>,
    to: Option<Address>,
    value: u128,
    data: Bytes,
    access_list: Vec<AccessListItem>,
}

impl TxBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Plain value transfer with the 21000 intrinsic gas limit
    pub fn transfer(to: Address, value: u128) -> Self {
        Self::new().to(to).value(value).gas_limit(21_000)
    }

    /// Set the gas limit
    pub fn gas_limit(mut self, limit: u64) -> Self {
        self.gas_limit = Some(limit);
        self
    }

    /// Set the gas price; builds a legacy transaction
    pub fn gas_price(mut self, price: u128) -> Self {
        self.gas_price = Some(price);
        self
    }

    /// Set max fee per gas (EIP-1559)
    pub fn max_fee_per_gas(mut self, fee: u128) -> Self {
        self.max_fee_per_gas = Some(fee);
        self
    }

    /// Set max priority fee per gas (EIP-1559)
    pub fn max_priority_fee_per_gas(mut self, fee: u128) -> Self {
        self.max_priority_fee_per_gas = Some(fee);
        self
    }

    /// Set the recipient
    pub fn to(mut self, address: Address) -> Self {
        self.to = Some(address);
        self
    }

    /// Set the value to transfer (in wei)
    pub fn value(mut self, value: u128) -> Self {
        self.value = value;
        self
    }

    /// Set the input data
    pub fn data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    /// Add an access list entry (EIP-1559 only)
    pub fn access(mut self, item: AccessListItem) -> Self {
        self.access_list.push(item);
        self
    }

    /// Build the unsigned body.
    ///
    /// A set gas price without fee caps yields a legacy transaction,
    /// otherwise both EIP-1559 fee caps are required.
    pub fn build(&self, nonce: u64, chain_id: u64) -> PoolResult<TransactionBody> {
        let gas_limit = self.gas_limit.ok_or_else(|| missing("gas_limit"))?;

        let fee_caps = (self.max_fee_per_gas, self.max_priority_fee_per_gas);
        match (self.gas_price, fee_caps) {
            (Some(gas_price), (None, None)) => {
                if !self.access_list.is_empty() {
                    return Err(PoolError::TxBuild(
                        "access list requires a dynamic fee transaction".into(),
                    ));
                }
                Ok(TransactionBody::Legacy(LegacyTx {
                    chain_id: Some(chain_id),
                    nonce,
                    gas_price,
                    gas_limit,
                    to: self.to,
                    value: self.value,
                    data: self.data.clone(),
                }))
            }
            (None, (Some(max_fee_per_gas), Some(max_priority_fee_per_gas))) => {
                if max_priority_fee_per_gas > max_fee_per_gas {
                    return Err(PoolError::TxBuild(format!(
                        "tip {} above fee cap {}",
                        max_priority_fee_per_gas, max_fee_per_gas
                    )));
                }
                Ok(TransactionBody::DynamicFee(DynamicFeeTx {
                    chain_id,
                    nonce,
                    max_priority_fee_per_gas,
                    max_fee_per_gas,
                    gas_limit,
                    to: self.to,
                    value: self.value,
                    data: self.data.clone(),
                    access_list: self.access_list.clone(),
                }))
            }
            (Some(_), _) => Err(PoolError::TxBuild(
                "gas_price conflicts with EIP-1559 fee caps".into(),
            )),
            (None, (None, _)) => Err(missing("max_fee_per_gas")),
            (None, (Some(_), None)) => Err(missing("max_priority_fee_per_gas")),
        }
    }
}

fn missing(field: &str) -> PoolError {
    PoolError::TxBuild(format!("missing {}", field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use txflood_types::TxType;

    #[test]
    fn test_legacy_when_gas_price_set() {
        let body = TxBuilder::transfer(Address::ZERO, 1)
            .gas_price(5)
            .build(3, 1337)
            .unwrap();
        assert_eq!(body.tx_type(), TxType::Legacy);
        assert_eq!(body.nonce(), 3);
        assert_eq!(body.chain_id(), Some(1337));
    }

    #[test]
    fn test_dynamic_fee_when_caps_set() {
        let body = TxBuilder::transfer(Address::ZERO, 1)
            .max_fee_per_gas(10)
            .max_priority_fee_per_gas(2)
            .build(0, 1)
            .unwrap();
        assert_eq!(body.tx_type(), TxType::DynamicFee);
    }

    #[test]
    fn test_missing_fields() {
        assert!(TxBuilder::new().build(0, 1).is_err());
        assert!(TxBuilder::new().gas_limit(21_000).build(0, 1).is_err());
        assert!(TxBuilder::new()
            .gas_limit(21_000)
            .max_fee_per_gas(1)
            .build(0, 1)
            .is_err());
    }

    #[test]
    fn test_rejects_tip_above_cap() {
        let result = TxBuilder::transfer(Address::ZERO, 0)
            .max_fee_per_gas(1)
            .max_priority_fee_per_gas(2)
            .build(0, 1);
        assert!(matches!(result, Err(PoolError::TxBuild(_))));
    }
}
