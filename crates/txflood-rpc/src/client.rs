//! Typed JSON-RPC client

use serde_json::Value;
use std::sync::Arc;
use txflood_primitives::{Address, H256, U256};
use txflood_types::{Block, Receipt};

use crate::transport::{deserialize_response, Transport};
use crate::types::{quantity, BlockId, RpcBlock, RpcReceipt};
use crate::{RpcError, RpcResult};

/// Client for the RPC calls the pool consumes
#[derive(Clone)]
pub struct RpcClient {
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient").finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Create a client over a shared transport
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Create a client owning the given transport
    pub fn with_transport(transport: impl Transport + 'static) -> Self {
        Self::new(Arc::new(transport))
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> RpcResult<T> {
        let value = self.transport.request_json(method, params).await?;
        deserialize_response(value)
    }

    async fn request_quantity<T: TryFrom<u128>>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> RpcResult<T> {
        let result: String = self.request(method, params).await?;
        quantity::parse(&result).map_err(RpcError::Decode)
    }

    // ==================== Chain Info ====================

    /// Chain id
    pub async fn chain_id(&self) -> RpcResult<u64> {
        self.request_quantity("eth_chainId", vec![]).await
    }

    /// Current head block number
    pub async fn block_number(&self) -> RpcResult<u64> {
        self.request_quantity("eth_blockNumber", vec![]).await
    }

    /// Suggested gas price
    pub async fn gas_price(&self) -> RpcResult<u128> {
        self.request_quantity("eth_gasPrice", vec![]).await
    }

    /// Suggested priority fee
    pub async fn max_priority_fee_per_gas(&self) -> RpcResult<u128> {
        self.request_quantity("eth_maxPriorityFeePerGas", vec![])
            .await
    }

    /// Node software version string
    pub async fn client_version(&self) -> RpcResult<String> {
        self.request("web3_clientVersion", vec![]).await
    }

    // ==================== Account Queries ====================

    /// Transaction count of an address at the given block
    pub async fn nonce_at(&self, address: &Address, block: BlockId) -> RpcResult<u64> {
        self.request_quantity(
            "eth_getTransactionCount",
            vec![Value::String(address.to_hex()), serde_json::to_value(block)?],
        )
        .await
    }

    /// Balance of an address at the given block
    pub async fn balance(&self, address: &Address, block: BlockId) -> RpcResult<U256> {
        let result: String = self
            .request(
                "eth_getBalance",
                vec![Value::String(address.to_hex()), serde_json::to_value(block)?],
            )
            .await?;
        let digits = result.strip_prefix("0x").unwrap_or(&result);
        U256::from_str_radix(digits, 16)
            .map_err(|_| RpcError::Decode(format!("invalid balance {}", result)))
    }

    // ==================== Transactions ====================

    /// Submit EIP-2718 encoded transaction bytes
    pub async fn send_raw_transaction(&self, raw: &[u8]) -> RpcResult<H256> {
        let hex = format!("0x{}", hex::encode(raw));
        let result: String = self
            .request("eth_sendRawTransaction", vec![Value::String(hex)])
            .await?;
        Ok(H256::from_hex(&result)?)
    }

    /// Receipt of a transaction, `None` while it is unknown or pending
    pub async fn receipt(&self, hash: &H256) -> RpcResult<Option<Receipt>> {
        let result: Option<RpcReceipt> = self
            .request(
                "eth_getTransactionReceipt",
                vec![Value::String(hash.to_hex())],
            )
            .await?;
        Ok(result.map(Receipt::from))
    }

    // ==================== Blocks ====================

    /// Block with full transactions, `None` if the node does not have it
    pub async fn block_by_number(&self, number: u64) -> RpcResult<Option<Block>> {
        let result: Option<RpcBlock> = self
            .request(
                "eth_getBlockByNumber",
                vec![serde_json::to_value(BlockId::Number(number))?, Value::Bool(true)],
            )
            .await?;
        result.map(Block::try_from).transpose()
    }

    /// All receipts of a block, `None` if the node does not have it
    pub async fn block_receipts(&self, number: u64) -> RpcResult<Option<Vec<Receipt>>> {
        let result: Option<Vec<RpcReceipt>> = self
            .request(
                "eth_getBlockReceipts",
                vec![serde_json::to_value(BlockId::Number(number))?],
            )
            .await?;
        Ok(result.map(|receipts| receipts.into_iter().map(Receipt::from).collect()))
    }
}
