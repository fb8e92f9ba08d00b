//! Transaction types with EIP-2718 envelopes

use bytes::Bytes;
use rlp::RlpStream;
use txflood_crypto::{keccak256, recover_address, CryptoError, Signature};
use txflood_primitives::{Address, H256, U256};

/// Transaction type identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TxType {
    /// Pre-EIP-2718 transaction
    #[default]
    Legacy = 0,
    /// EIP-1559 dynamic fee transaction
    DynamicFee = 2,
}

/// Legacy transaction (type 0)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LegacyTx {
    /// EIP-155 chain id, `None` for unprotected transactions
    pub chain_id: Option<u64>,
    /// Sender nonce
    pub nonce: u64,
    /// Gas price in wei
    pub gas_price: u128,
    /// Gas limit
    pub gas_limit: u64,
    /// Recipient, `None` for contract creation
    pub to: Option<Address>,
    /// Transferred value in wei
    pub value: u128,
    /// Call data
    pub data: Bytes,
}

impl Default for LegacyTx {
    fn default() -> Self {
        Self {
            chain_id: None,
            nonce: 0,
            gas_price: 0,
            gas_limit: 21_000,
            to: None,
            value: 0,
            data: Bytes::new(),
        }
    }
}

/// EIP-1559 transaction (type 2)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DynamicFeeTx {
    /// Chain id
    pub chain_id: u64,
    /// Sender nonce
    pub nonce: u64,
    /// Tip cap
    pub max_priority_fee_per_gas: u128,
    /// Fee cap
    pub max_fee_per_gas: u128,
    /// Gas limit
    pub gas_limit: u64,
    /// Recipient, `None` for contract creation
    pub to: Option<Address>,
    /// Transferred value in wei
    pub value: u128,
    /// Call data
    pub data: Bytes,
    /// Pre-warmed storage slots
    pub access_list: Vec<AccessListItem>,
}

/// Access list entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessListItem {
    /// Account address
    pub address: Address,
    /// Storage keys
    pub storage_keys: Vec<H256>,
}

/// Unsigned transaction payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransactionBody {
    /// Legacy transaction
    Legacy(LegacyTx),
    /// EIP-1559 transaction
    DynamicFee(DynamicFeeTx),
}

impl TransactionBody {
    /// Envelope type
    pub fn tx_type(&self) -> TxType {
        match self {
            TransactionBody::Legacy(_) => TxType::Legacy,
            TransactionBody::DynamicFee(_) => TxType::DynamicFee,
        }
    }

    /// Sender nonce
    pub fn nonce(&self) -> u64 {
        match self {
            TransactionBody::Legacy(tx) => tx.nonce,
            TransactionBody::DynamicFee(tx) => tx.nonce,
        }
    }

    /// Overwrite the nonce
    pub fn set_nonce(&mut self, nonce: u64) {
        match self {
            TransactionBody::Legacy(tx) => tx.nonce = nonce,
            TransactionBody::DynamicFee(tx) => tx.nonce = nonce,
        }
    }

    /// Chain id, if replay protected
    pub fn chain_id(&self) -> Option<u64> {
        match self {
            TransactionBody::Legacy(tx) => tx.chain_id,
            TransactionBody::DynamicFee(tx) => Some(tx.chain_id),
        }
    }

    /// Hash that the sender signs
    pub fn signing_hash(&self) -> H256 {
        match self {
            TransactionBody::Legacy(tx) => {
                let mut s = RlpStream::new();
                match tx.chain_id {
                    Some(chain_id) => {
                        s.begin_list(9);
                        append_legacy_fields(&mut s, tx);
                        s.append(&chain_id);
                        s.append(&0u8);
                        s.append(&0u8);
                    }
                    None => {
                        s.begin_list(6);
                        append_legacy_fields(&mut s, tx);
                    }
                }
                keccak256(&s.out())
            }
            TransactionBody::DynamicFee(tx) => {
                let mut s = RlpStream::new_list(9);
                append_dynamic_fee_fields(&mut s, tx);
                keccak256(&typed_envelope(TxType::DynamicFee, &s.out()))
            }
        }
    }

    /// Attach a signature
    pub fn into_signed(self, signature: Signature) -> SignedTransaction {
        SignedTransaction::new(self, signature)
    }
}

/// Signed transaction with its hash computed once at construction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedTransaction {
    body: TransactionBody,
    signature: Signature,
    hash: H256,
}

impl SignedTransaction {
    /// Combine a body and signature
    pub fn new(body: TransactionBody, signature: Signature) -> Self {
        let hash = keccak256(&encode_envelope(&body, &signature));
        Self {
            body,
            signature,
            hash,
        }
    }

    /// Transaction hash
    pub fn hash(&self) -> H256 {
        self.hash
    }

    /// Unsigned payload
    pub fn body(&self) -> &TransactionBody {
        &self.body
    }

    /// Signature
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Envelope type
    pub fn tx_type(&self) -> TxType {
        self.body.tx_type()
    }

    /// Sender nonce
    pub fn nonce(&self) -> u64 {
        self.body.nonce()
    }

    /// Recipient
    pub fn to(&self) -> Option<Address> {
        match &self.body {
            TransactionBody::Legacy(tx) => tx.to,
            TransactionBody::DynamicFee(tx) => tx.to,
        }
    }

    /// Transferred value
    pub fn value(&self) -> u128 {
        match &self.body {
            TransactionBody::Legacy(tx) => tx.value,
            TransactionBody::DynamicFee(tx) => tx.value,
        }
    }

    /// Gas limit
    pub fn gas_limit(&self) -> u64 {
        match &self.body {
            TransactionBody::Legacy(tx) => tx.gas_limit,
            TransactionBody::DynamicFee(tx) => tx.gas_limit,
        }
    }

    /// Price per gas paid at the given base fee
    pub fn effective_gas_price(&self, base_fee: Option<u128>) -> u128 {
        match &self.body {
            TransactionBody::Legacy(tx) => tx.gas_price,
            TransactionBody::DynamicFee(tx) => match base_fee {
                Some(base_fee) => tx
                    .max_fee_per_gas
                    .min(base_fee.saturating_add(tx.max_priority_fee_per_gas)),
                None => tx.max_fee_per_gas,
            },
        }
    }

    /// Legacy `v` value as it appears on the wire
    pub fn v(&self) -> u64 {
        let parity = u64::from(self.signature.y_parity);
        match &self.body {
            TransactionBody::Legacy(tx) => match tx.chain_id {
                Some(chain_id) => chain_id * 2 + 35 + parity,
                None => 27 + parity,
            },
            TransactionBody::DynamicFee(_) => parity,
        }
    }

    /// EIP-2718 wire encoding, as submitted with `eth_sendRawTransaction`
    pub fn encode(&self) -> Bytes {
        Bytes::from(encode_envelope(&self.body, &self.signature))
    }

    /// Recover the sender from the signature
    pub fn recover_sender(&self) -> Result<Address, CryptoError> {
        recover_address(&self.body.signing_hash(), &self.signature)
    }
}

fn append_legacy_fields(s: &mut RlpStream, tx: &LegacyTx) {
    s.append(&tx.nonce);
    s.append(&U256::from(tx.gas_price));
    s.append(&tx.gas_limit);
    append_to(s, tx.to);
    s.append(&U256::from(tx.value));
    s.append(&tx.data.to_vec());
}

fn append_dynamic_fee_fields(s: &mut RlpStream, tx: &DynamicFeeTx) {
    s.append(&tx.chain_id);
    s.append(&tx.nonce);
    s.append(&U256::from(tx.max_priority_fee_per_gas));
    s.append(&U256::from(tx.max_fee_per_gas));
    s.append(&tx.gas_limit);
    append_to(s, tx.to);
    s.append(&U256::from(tx.value));
    s.append(&tx.data.to_vec());
    s.begin_list(tx.access_list.len());
    for item in &tx.access_list {
        s.begin_list(2);
        s.append(&item.address);
        s.append_list(&item.storage_keys);
    }
}

fn append_to(s: &mut RlpStream, to: Option<Address>) {
    match to {
        Some(address) => s.append(&address),
        None => s.append_empty_data(),
    };
}

fn append_signature(s: &mut RlpStream, v: u64, signature: &Signature) {
    s.append(&v);
    s.append(&U256::from_big_endian(&signature.r));
    s.append(&U256::from_big_endian(&signature.s));
}

fn typed_envelope(tx_type: TxType, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 1);
    out.push(tx_type as u8);
    out.extend_from_slice(payload);
    out
}

fn encode_envelope(body: &TransactionBody, signature: &Signature) -> Vec<u8> {
    match body {
        TransactionBody::Legacy(tx) => {
            let parity = u64::from(signature.y_parity);
            let v = match tx.chain_id {
                Some(chain_id) => chain_id * 2 + 35 + parity,
                None => 27 + parity,
            };
            let mut s = RlpStream::new_list(9);
            append_legacy_fields(&mut s, tx);
            append_signature(&mut s, v, signature);
            s.out().to_vec()
        }
        TransactionBody::DynamicFee(tx) => {
            let mut s = RlpStream::new_list(12);
            append_dynamic_fee_fields(&mut s, tx);
            append_signature(&mut s, u64::from(signature.y_parity), signature);
            typed_envelope(TxType::DynamicFee, &s.out())
        }
    }
}
