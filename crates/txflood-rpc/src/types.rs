//! JSON wire types for blocks, transactions and receipts

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use txflood_crypto::Signature;
use txflood_primitives::{Address, H256, U256};
use txflood_types::{
    AccessListItem, Block, BlockTransaction, DynamicFeeTx, LegacyTx, Receipt, SignedTransaction,
    TransactionBody, TxStatus, TxType,
};

use crate::{RpcError, RpcResult};

/// Block identifier for RPC queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockId {
    /// Block number
    Number(u64),
    /// Latest block
    #[default]
    Latest,
    /// Pending state
    Pending,
}

impl Serialize for BlockId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            BlockId::Number(n) => serializer.serialize_str(&format!("0x{:x}", n)),
            BlockId::Latest => serializer.serialize_str("latest"),
            BlockId::Pending => serializer.serialize_str("pending"),
        }
    }
}

// ==================== Hex helpers ====================

pub(crate) mod quantity {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Copy + Into<u128>,
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{:x}", (*value).into()))
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: TryFrom<u128>,
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(D::Error::custom)
    }

    pub fn parse<T: TryFrom<u128>>(s: &str) -> Result<T, String> {
        let digits = s
            .strip_prefix("0x")
            .ok_or_else(|| format!("quantity without 0x prefix: {}", s))?;
        if digits.is_empty() {
            return Err(format!("empty quantity: {}", s));
        }
        let value = u128::from_str_radix(digits, 16).map_err(|e| format!("{}: {}", s, e))?;
        T::try_from(value).map_err(|_| format!("quantity out of range: {}", s))
    }
}

pub(crate) mod opt_quantity {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Copy + Into<u128>,
        S: Serializer,
    {
        match value {
            Some(v) => super::quantity::serialize(v, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        T: TryFrom<u128>,
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => super::quantity::parse(&s).map(Some).map_err(D::Error::custom),
            None => Ok(None),
        }
    }
}

mod u256_quantity {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use txflood_primitives::U256;

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:#x}", value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let s = String::deserialize(deserializer)?;
        let digits = s.strip_prefix("0x").unwrap_or(&s);
        U256::from_str_radix(digits, 16).map_err(|e| D::Error::custom(format!("{}: {:?}", s, e)))
    }
}

mod word {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use txflood_primitives::U256;

    pub fn serialize<S: Serializer>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:#x}", U256::from_big_endian(value)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let digits = s.strip_prefix("0x").unwrap_or(&s);
        if digits.len() > 64 {
            return Err(D::Error::custom(format!("word longer than 32 bytes: {}", s)));
        }
        let padded = format!("{:0>64}", digits);
        let mut out = [0u8; 32];
        hex::decode_to_slice(&padded, &mut out).map_err(D::Error::custom)?;
        Ok(out)
    }
}

mod hex_bytes {
    use bytes::Bytes;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(value)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(deserializer)?;
        let digits = s.strip_prefix("0x").unwrap_or(&s);
        hex::decode(digits).map(Bytes::from).map_err(D::Error::custom)
    }
}

// ==================== Transactions ====================

/// Access list entry as returned by nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcAccessListItem {
    /// Account address
    pub address: Address,
    /// Storage keys
    pub storage_keys: Vec<H256>,
}

/// Transaction object from `eth_getBlockByNumber(_, true)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    /// Transaction hash
    pub hash: H256,
    /// Sender nonce
    #[serde(with = "quantity")]
    pub nonce: u64,
    /// Sender as reported by the node
    #[serde(default)]
    pub from: Option<Address>,
    /// Recipient
    #[serde(default)]
    pub to: Option<Address>,
    /// Transferred value
    #[serde(with = "u256_quantity")]
    pub value: U256,
    /// Gas limit
    #[serde(with = "quantity")]
    pub gas: u64,
    /// Legacy gas price, or effective price for typed transactions
    #[serde(default, with = "opt_quantity", skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<u128>,
    /// Fee cap
    #[serde(default, with = "opt_quantity", skip_serializing_if = "Option::is_none")]
    pub max_fee_per_gas: Option<u128>,
    /// Tip cap
    #[serde(default, with = "opt_quantity", skip_serializing_if = "Option::is_none")]
    pub max_priority_fee_per_gas: Option<u128>,
    /// Call data
    #[serde(with = "hex_bytes")]
    pub input: Bytes,
    /// Envelope type
    #[serde(rename = "type", default, with = "opt_quantity", skip_serializing_if = "Option::is_none")]
    pub tx_type: Option<u8>,
    /// Chain id
    #[serde(default, with = "opt_quantity", skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    /// Signature v
    #[serde(with = "quantity")]
    pub v: u64,
    /// Signature r
    #[serde(with = "word")]
    pub r: [u8; 32],
    /// Signature s
    #[serde(with = "word")]
    pub s: [u8; 32],
    /// Access list of typed transactions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_list: Option<Vec<RpcAccessListItem>>,
}

impl RpcTransaction {
    fn decode_signed(&self) -> RpcResult<Option<SignedTransaction>> {
        if self.value.bits() > 128 {
            return Ok(None);
        }
        let value = self.value.low_u128();

        let (body, y_parity) = match self.tx_type.unwrap_or(0) {
            0 => {
                let (chain_id, parity) = legacy_v(self.v)?;
                let gas_price = self
                    .gas_price
                    .ok_or_else(|| RpcError::Decode("legacy transaction without gasPrice".into()))?;
                let body = TransactionBody::Legacy(LegacyTx {
                    chain_id,
                    nonce: self.nonce,
                    gas_price,
                    gas_limit: self.gas,
                    to: self.to,
                    value,
                    data: self.input.clone(),
                });
                (body, parity)
            }
            2 => {
                let chain_id = self
                    .chain_id
                    .ok_or_else(|| RpcError::Decode("typed transaction without chainId".into()))?;
                let (max_fee_per_gas, max_priority_fee_per_gas) =
                    match (self.max_fee_per_gas, self.max_priority_fee_per_gas) {
                        (Some(fee), Some(tip)) => (fee, tip),
                        _ => {
                            return Err(RpcError::Decode(
                                "dynamic fee transaction without fee caps".into(),
                            ))
                        }
                    };
                let access_list = self
                    .access_list
                    .clone()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|item| AccessListItem {
                        address: item.address,
                        storage_keys: item.storage_keys,
                    })
                    .collect();
                let body = TransactionBody::DynamicFee(DynamicFeeTx {
                    chain_id,
                    nonce: self.nonce,
                    max_priority_fee_per_gas,
                    max_fee_per_gas,
                    gas_limit: self.gas,
                    to: self.to,
                    value,
                    data: self.input.clone(),
                    access_list,
                });
                let parity = u8::try_from(self.v)
                    .ok()
                    .filter(|p| *p <= 1)
                    .ok_or_else(|| RpcError::Decode(format!("invalid y parity {}", self.v)))?;
                (body, parity)
            }
            _ => return Ok(None),
        };

        let signature = Signature {
            r: self.r,
            s: self.s,
            y_parity,
        };
        Ok(Some(body.into_signed(signature)))
    }
}

/// Split a legacy `v` into chain id and y parity
fn legacy_v(v: u64) -> RpcResult<(Option<u64>, u8)> {
    match v {
        27 | 28 => Ok((None, (v - 27) as u8)),
        v if v >= 35 => Ok((Some((v - 35) / 2), ((v - 35) % 2) as u8)),
        _ => Err(RpcError::Decode(format!("invalid legacy v {}", v))),
    }
}

impl TryFrom<RpcTransaction> for BlockTransaction {
    type Error = RpcError;

    fn try_from(tx: RpcTransaction) -> RpcResult<Self> {
        let signed = tx.decode_signed()?;
        // Keep only envelopes that re-encode to the hash the node reported
        let signed = match signed {
            Some(signed) if signed.hash() == tx.hash => Some(signed),
            Some(_) => {
                tracing::debug!(tx = %tx.hash, "re-encoded hash differs, using reported sender");
                None
            }
            None => None,
        };
        Ok(BlockTransaction {
            hash: tx.hash,
            nonce: tx.nonce,
            reported_from: tx.from,
            to: tx.to,
            value: tx.value,
            signed,
        })
    }
}

impl From<&SignedTransaction> for RpcTransaction {
    fn from(tx: &SignedTransaction) -> Self {
        let signature = tx.signature();
        let mut out = RpcTransaction {
            hash: tx.hash(),
            nonce: tx.nonce(),
            from: tx.recover_sender().ok(),
            to: tx.to(),
            value: U256::from(tx.value()),
            gas: tx.gas_limit(),
            gas_price: None,
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
            input: Bytes::new(),
            tx_type: None,
            chain_id: tx.body().chain_id(),
            v: tx.v(),
            r: signature.r,
            s: signature.s,
            access_list: None,
        };
        match tx.body() {
            TransactionBody::Legacy(body) => {
                out.tx_type = Some(TxType::Legacy as u8);
                out.gas_price = Some(body.gas_price);
                out.input = body.data.clone();
            }
            TransactionBody::DynamicFee(body) => {
                out.tx_type = Some(TxType::DynamicFee as u8);
                out.max_fee_per_gas = Some(body.max_fee_per_gas);
                out.max_priority_fee_per_gas = Some(body.max_priority_fee_per_gas);
                out.input = body.data.clone();
                out.access_list = Some(
                    body.access_list
                        .iter()
                        .map(|item| RpcAccessListItem {
                            address: item.address,
                            storage_keys: item.storage_keys.clone(),
                        })
                        .collect(),
                );
            }
        }
        out
    }
}

// ==================== Blocks ====================

/// Block object from `eth_getBlockByNumber(_, true)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlock {
    /// Block number
    #[serde(with = "quantity")]
    pub number: u64,
    /// Block hash
    pub hash: H256,
    /// Parent hash
    pub parent_hash: H256,
    /// Unix timestamp
    #[serde(with = "quantity")]
    pub timestamp: u64,
    /// Gas limit
    #[serde(with = "quantity")]
    pub gas_limit: u64,
    /// Gas used
    #[serde(with = "quantity")]
    pub gas_used: u64,
    /// Base fee, absent before London
    #[serde(default, with = "opt_quantity", skip_serializing_if = "Option::is_none")]
    pub base_fee_per_gas: Option<u128>,
    /// Full transaction objects
    #[serde(default)]
    pub transactions: Vec<RpcTransaction>,
}

impl TryFrom<RpcBlock> for Block {
    type Error = RpcError;

    fn try_from(block: RpcBlock) -> RpcResult<Self> {
        let transactions = block
            .transactions
            .into_iter()
            .map(BlockTransaction::try_from)
            .collect::<RpcResult<Vec<_>>>()?;
        Ok(Block {
            number: block.number,
            hash: block.hash,
            parent_hash: block.parent_hash,
            timestamp: block.timestamp,
            gas_limit: block.gas_limit,
            gas_used: block.gas_used,
            base_fee_per_gas: block.base_fee_per_gas,
            transactions,
        })
    }
}

// ==================== Receipts ====================

/// Receipt object from `eth_getTransactionReceipt` / `eth_getBlockReceipts`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReceipt {
    /// Transaction hash
    pub transaction_hash: H256,
    /// Index in block
    #[serde(with = "quantity")]
    pub transaction_index: u64,
    /// Including block hash
    pub block_hash: H256,
    /// Including block number
    #[serde(with = "quantity")]
    pub block_number: u64,
    /// Sender
    pub from: Address,
    /// Recipient
    #[serde(default)]
    pub to: Option<Address>,
    /// 1 for success, 0 for failure; absent on pre-Byzantium receipts
    #[serde(default, with = "opt_quantity", skip_serializing_if = "Option::is_none")]
    pub status: Option<u8>,
    /// Gas used by this transaction
    #[serde(with = "quantity")]
    pub gas_used: u64,
    /// Cumulative gas used
    #[serde(with = "quantity")]
    pub cumulative_gas_used: u64,
    /// Price per gas paid
    #[serde(default, with = "opt_quantity", skip_serializing_if = "Option::is_none")]
    pub effective_gas_price: Option<u128>,
    /// Created contract
    #[serde(default)]
    pub contract_address: Option<Address>,
}

impl From<RpcReceipt> for Receipt {
    fn from(r: RpcReceipt) -> Self {
        Receipt {
            transaction_hash: r.transaction_hash,
            transaction_index: r.transaction_index,
            block_hash: r.block_hash,
            block_number: r.block_number,
            from: r.from,
            to: r.to,
            status: TxStatus::from(r.status.map_or(true, |s| s == 1)),
            gas_used: r.gas_used,
            cumulative_gas_used: r.cumulative_gas_used,
            effective_gas_price: r.effective_gas_price.unwrap_or_default(),
            contract_address: r.contract_address,
        }
    }
}

impl From<&Receipt> for RpcReceipt {
    fn from(r: &Receipt) -> Self {
        RpcReceipt {
            transaction_hash: r.transaction_hash,
            transaction_index: r.transaction_index,
            block_hash: r.block_hash,
            block_number: r.block_number,
            from: r.from,
            to: r.to,
            status: Some(r.status as u8),
            gas_used: r.gas_used,
            cumulative_gas_used: r.cumulative_gas_used,
            effective_gas_price: Some(r.effective_gas_price),
            contract_address: r.contract_address,
        }
    }
}
