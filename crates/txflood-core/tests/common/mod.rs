//! Scripted in-memory chain served through the RPC `Transport` trait

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use k256::ecdsa::SigningKey;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use txflood_core::{Account, Endpoint, EndpointPool, EndpointPoolConfig, TxPool, TxPoolConfig};
use txflood_crypto::keccak256;
use txflood_primitives::{format_quantity, parse_quantity, Address, H256, U256};
use txflood_rpc::{RpcBlock, RpcError, RpcReceipt, RpcResult, RpcTransaction, Transport};
use txflood_types::{Receipt, SignedTransaction, TxStatus};

pub const CHAIN_ID: u64 = 1337;
pub const BASE_FEE: u128 = 1_000_000_000;

struct MinedBlock {
    block: RpcBlock,
    receipts: Vec<RpcReceipt>,
}

/// A single canonical chain that tests extend and reorganize
pub struct MockChain {
    blocks: Mutex<BTreeMap<u64, MinedBlock>>,
    sent: Mutex<Vec<H256>>,
    branch: AtomicUsize,
}

impl MockChain {
    /// Chain whose first block is at `start`
    pub fn new(start: u64) -> Arc<Self> {
        let chain = Arc::new(Self {
            blocks: Mutex::new(BTreeMap::new()),
            sent: Mutex::new(Vec::new()),
            branch: AtomicUsize::new(0),
        });
        let genesis_parent = keccak256(format!("parent-of-{}", start).as_bytes());
        chain.push_block(start, genesis_parent, Vec::new());
        chain
    }

    /// Current head number
    pub fn head(&self) -> u64 {
        self.blocks.lock().keys().next_back().copied().unwrap_or(0)
    }

    /// Hash of block `number`
    pub fn hash_of(&self, number: u64) -> H256 {
        self.blocks.lock()[&number].block.hash
    }

    /// Append a block with `txs`; returns its number
    pub fn mine(&self, txs: Vec<SignedTransaction>) -> u64 {
        let head = self.head();
        let parent = self.hash_of(head);
        self.push_block(head + 1, parent, txs);
        head + 1
    }

    /// Drop every block from `from` upward and mine `blocks` on a new branch
    pub fn reorg(&self, from: u64, blocks: Vec<Vec<SignedTransaction>>) {
        self.branch.fetch_add(1, Ordering::SeqCst);
        let _ = self.blocks.lock().split_off(&from);
        for txs in blocks {
            self.mine(txs);
        }
    }

    /// Append a block holding one transaction of an unknown envelope type
    /// whose sender the node does not report; returns its number
    pub fn mine_opaque(&self) -> u64 {
        let number = self.mine(Vec::new());
        let branch = self.branch.load(Ordering::SeqCst);
        let hash = keccak256(format!("opaque-{}-branch-{}", number, branch).as_bytes());
        let mut blocks = self.blocks.lock();
        let mined = blocks.get_mut(&number).unwrap();
        mined.block.transactions.push(RpcTransaction {
            hash,
            nonce: 0,
            from: None,
            to: None,
            value: U256::zero(),
            gas: 21_000,
            gas_price: None,
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
            input: Bytes::new(),
            tx_type: Some(0x7e),
            chain_id: None,
            v: 0,
            r: [0; 32],
            s: [0; 32],
            access_list: None,
        });
        mined.block.gas_used = 21_000;
        mined.receipts.push(RpcReceipt::from(&Receipt {
            transaction_hash: hash,
            transaction_index: 0,
            block_hash: mined.block.hash,
            block_number: number,
            from: Address::ZERO,
            to: None,
            status: TxStatus::Success,
            gas_used: 21_000,
            cumulative_gas_used: 21_000,
            effective_gas_price: BASE_FEE,
            contract_address: None,
        }));
        number
    }

    /// Start reporting `from` for the transactions of block `number` that lack a sender
    pub fn report_sender(&self, number: u64, from: Address) {
        let mut blocks = self.blocks.lock();
        let mined = blocks.get_mut(&number).unwrap();
        for tx in mined.block.transactions.iter_mut().filter(|tx| tx.from.is_none()) {
            tx.from = Some(from);
        }
    }

    /// Hashes submitted through any transport, in order
    pub fn sent(&self) -> Vec<H256> {
        self.sent.lock().clone()
    }

    /// Transport serving this chain
    pub fn transport(self: &Arc<Self>) -> Arc<ChainTransport> {
        Arc::new(ChainTransport {
            chain: self.clone(),
            send_error: Mutex::new(None),
            sends: AtomicUsize::new(0),
        })
    }

    /// Endpoint serving this chain, head cache disabled
    pub fn endpoint(self: &Arc<Self>, rpchost: &str) -> (Arc<ChainTransport>, Arc<Endpoint>) {
        let transport = self.transport();
        let endpoint = Endpoint::with_transport(rpchost, transport.clone())
            .unwrap()
            .with_head_cache_ttl(std::time::Duration::ZERO);
        (transport, Arc::new(endpoint))
    }

    fn push_block(&self, number: u64, parent_hash: H256, txs: Vec<SignedTransaction>) {
        let branch = self.branch.load(Ordering::SeqCst);
        let hash = keccak256(format!("block-{}-branch-{}", number, branch).as_bytes());
        let mut cumulative = 0;
        let receipts = txs
            .iter()
            .enumerate()
            .map(|(index, tx)| {
                cumulative += 21_000;
                RpcReceipt::from(&Receipt {
                    transaction_hash: tx.hash(),
                    transaction_index: index as u64,
                    block_hash: hash,
                    block_number: number,
                    from: tx.recover_sender().unwrap(),
                    to: tx.to(),
                    status: TxStatus::Success,
                    gas_used: 21_000,
                    cumulative_gas_used: cumulative,
                    effective_gas_price: tx.effective_gas_price(Some(BASE_FEE)),
                    contract_address: None,
                })
            })
            .collect();
        let block = RpcBlock {
            number,
            hash,
            parent_hash,
            timestamp: 1_700_000_000 + number * 12,
            gas_limit: 30_000_000,
            gas_used: cumulative,
            base_fee_per_gas: Some(BASE_FEE),
            transactions: txs.iter().map(RpcTransaction::from).collect(),
        };
        self.blocks.lock().insert(number, MinedBlock { block, receipts });
    }

    fn nonce_at(&self, address: &Address, height: u64) -> u64 {
        self.blocks
            .lock()
            .range(..=height)
            .flat_map(|(_, mined)| mined.block.transactions.iter())
            .filter(|tx| tx.from == Some(*address))
            .map(|tx| tx.nonce + 1)
            .max()
            .unwrap_or(0)
    }

    fn receipt(&self, hash: &H256) -> Option<RpcReceipt> {
        self.blocks
            .lock()
            .values()
            .flat_map(|mined| mined.receipts.iter())
            .find(|r| r.transaction_hash == *hash)
            .cloned()
    }
}

/// One endpoint's view of a [`MockChain`], with injectable send failures
pub struct ChainTransport {
    chain: Arc<MockChain>,
    send_error: Mutex<Option<RpcError>>,
    sends: AtomicUsize,
}

impl ChainTransport {
    /// Make every submission through this transport fail
    pub fn fail_sends(&self, error: RpcError) {
        *self.send_error.lock() = Some(error);
    }

    /// Submissions received, failed ones included
    pub fn send_count(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    fn height_param(&self, params: &[Value]) -> u64 {
        match params.first().and_then(Value::as_str) {
            Some(tag) if tag.starts_with("0x") => parse_quantity(tag).unwrap_or(0),
            _ => self.chain.head(),
        }
    }
}

#[async_trait]
impl Transport for ChainTransport {
    async fn request_json(&self, method: &str, params: Vec<Value>) -> RpcResult<Value> {
        let chain = &self.chain;
        match method {
            "eth_chainId" => Ok(Value::from(format_quantity(CHAIN_ID))),
            "eth_blockNumber" => Ok(Value::from(format_quantity(chain.head()))),
            "eth_gasPrice" | "eth_maxPriorityFeePerGas" => Ok(Value::from("0x3b9aca00")),
            "eth_getBalance" => Ok(Value::from("0xde0b6b3a7640000")),
            "web3_clientVersion" => Ok(Value::from("MockChain/v1")),
            "eth_getTransactionCount" => {
                let address = params
                    .first()
                    .and_then(Value::as_str)
                    .and_then(|s| Address::from_hex(s).ok())
                    .unwrap_or(Address::ZERO);
                let height = self.height_param(&params[1..]);
                Ok(Value::from(format_quantity(chain.nonce_at(&address, height))))
            }
            "eth_getBlockByNumber" => {
                let number = self.height_param(&params);
                let blocks = chain.blocks.lock();
                Ok(match blocks.get(&number) {
                    Some(mined) => serde_json::to_value(&mined.block)?,
                    None => Value::Null,
                })
            }
            "eth_getBlockReceipts" => {
                let number = self.height_param(&params);
                let blocks = chain.blocks.lock();
                Ok(match blocks.get(&number) {
                    Some(mined) => serde_json::to_value(&mined.receipts)?,
                    None => Value::Null,
                })
            }
            "eth_getTransactionReceipt" => {
                let hash = params
                    .first()
                    .and_then(Value::as_str)
                    .and_then(|s| H256::from_hex(s).ok())
                    .unwrap_or(H256::ZERO);
                Ok(match chain.receipt(&hash) {
                    Some(receipt) => serde_json::to_value(receipt)?,
                    None => Value::Null,
                })
            }
            "eth_sendRawTransaction" => {
                self.sends.fetch_add(1, Ordering::SeqCst);
                if let Some(error) = self.send_error.lock().clone() {
                    return Err(error);
                }
                let raw = params.first().and_then(Value::as_str).unwrap_or("0x");
                let bytes = hex::decode(raw.trim_start_matches("0x"))
                    .map_err(|e| RpcError::Serialization(e.to_string()))?;
                let hash = keccak256(&bytes);
                chain.sent.lock().push(hash);
                Ok(Value::from(hash.to_hex()))
            }
            _ => Err(RpcError::Rpc {
                code: -32601,
                message: format!("method {} not found", method),
            }),
        }
    }
}

// ==================== Fixtures ====================

/// Pool config with short timeouts for tests
pub fn test_pool_config() -> TxPoolConfig {
    TxPoolConfig {
        receipt_poll_retries: 1,
        receipt_poll_delay_ms: 10,
        ..Default::default()
    }
}

/// Endpoint pool over `endpoints`, every one starting good
pub fn endpoint_pool(endpoints: Vec<Arc<Endpoint>>) -> Arc<EndpointPool> {
    Arc::new(EndpointPool::new(endpoints, EndpointPoolConfig::default()))
}

/// Tx pool over one endpoint of `chain`
pub fn single_endpoint_pool(chain: &Arc<MockChain>) -> (Arc<ChainTransport>, Arc<TxPool>) {
    let (transport, endpoint) = chain.endpoint("http://node-a");
    let pool = TxPool::new(endpoint_pool(vec![endpoint]), test_pool_config());
    (transport, pool)
}

/// Account with a fixed key and the test chain id
pub fn account(seed: u8) -> Arc<Account> {
    let key = SigningKey::from_slice(&[seed; 32]).unwrap();
    let account = Account::new(key);
    account.set_chain_id(CHAIN_ID);
    Arc::new(account)
}
