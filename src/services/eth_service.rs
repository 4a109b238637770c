use chrono::{DateTime, Utc};
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, BlockNumber, Bytes, TransactionReceipt, TransactionRequest, H256, U256,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{NetworkConfig, NetworkType};
use crate::errors::{OracleError, OracleResult};
use crate::services::metrics_service::MetricsService;

/// A transaction in the mempool for more than this many blocks without a
/// receipt is considered stuck.
const STUCK_BLOCK_THRESHOLD: u64 = 10;

/// Replacement transactions bump the gas price by this factor.
const REPLACEMENT_GAS_BUMP_NUM: u64 = 12;
const REPLACEMENT_GAS_BUMP_DEN: u64 = 10;

/// Transaction lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
    Stuck,
}

/// Tracked submission record, retained until terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingTx {
    pub tx_hash: H256,
    pub nonce: U256,
    pub gas_price: U256,
    pub submitted_at: DateTime<Utc>,
    /// Chain head at submission time, used for stuck detection.
    pub submitted_block: u64,
    pub status: TxStatus,
    pub block_number: Option<u64>,
}

/// Parameters for an outgoing transaction.
#[derive(Debug, Clone, Default)]
pub struct TransactionParams {
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub gas: Option<U256>,
    /// Explicit nonce, used by replacement transactions; fresh submissions
    /// go through the nonce gate instead.
    pub nonce: Option<U256>,
    pub gas_price: Option<U256>,
}

#[derive(Debug)]
struct NonceCache {
    next_nonce: U256,
    cached_at: Instant,
}

/// Manages all chain interactions: nonce-safe submission, gas pricing,
/// pre-flight simulation, pending transaction tracking and stuck
/// transaction replacement.
pub struct EthereumService {
    config: NetworkConfig,
    provider: Provider<Http>,
    wallet: Option<LocalWallet>,
    /// Exclusive gate protecting the assign+increment pair per address.
    nonce_cache: Mutex<HashMap<Address, NonceCache>>,
    gas_price_cache: Mutex<Option<(U256, Instant)>>,
    pending: RwLock<HashMap<H256, PendingTx>>,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
    metrics: Option<Arc<MetricsService>>,
}

impl EthereumService {
    pub fn new(
        config: NetworkConfig,
        private_key: Option<String>,
        metrics: Option<Arc<MetricsService>>,
    ) -> OracleResult<Self> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|e| OracleError::Configuration(format!("Invalid RPC URL: {}", e)))?;

        let wallet = match private_key {
            Some(key) => {
                let wallet = key
                    .trim_start_matches("0x")
                    .parse::<LocalWallet>()
                    .map_err(|e| {
                        OracleError::Configuration(format!("Invalid private key: {}", e))
                    })?
                    .with_chain_id(config.chain_id);
                info!("Transaction signer configured for {:?}", wallet.address());
                Some(wallet)
            }
            None => None,
        };

        Ok(Self {
            config,
            provider,
            wallet,
            nonce_cache: Mutex::new(HashMap::new()),
            gas_price_cache: Mutex::new(None),
            pending: RwLock::new(HashMap::new()),
            monitor_handle: Mutex::new(None),
            metrics,
        })
    }

    pub fn signer_address(&self) -> Option<Address> {
        self.wallet.as_ref().map(|w| w.address())
    }

    fn network_label(&self) -> &'static str {
        match self.config.network_type {
            NetworkType::Mainnet => "mainnet",
            NetworkType::Testnet => "testnet",
            NetworkType::Private => "private",
        }
    }

    /// Start the background loop that tracks pending transactions.
    pub async fn start_monitoring(self: &Arc<Self>) {
        let mut handle = self.monitor_handle.lock().await;
        if handle.is_some() {
            return;
        }

        let service = Arc::clone(self);
        *handle = Some(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                if let Err(e) = service.monitor_pending_once().await {
                    error!("Error monitoring transactions: {}", e);
                }
            }
        }));
    }

    pub async fn shutdown(&self) {
        if let Some(handle) = self.monitor_handle.lock().await.take() {
            handle.abort();
        }
    }

    /// Current gas price, cached for `gas_price_update_interval`.
    ///
    /// `optimal = min(max(2 * base_fee, suggested), max_gas_price)`
    pub async fn optimal_gas_price(&self) -> OracleResult<U256> {
        let mut cache = self.gas_price_cache.lock().await;
        if let Some((price, at)) = cache.as_ref() {
            if at.elapsed() < Duration::from_secs(self.config.gas_price_update_interval) {
                return Ok(*price);
            }
        }

        let base_fee = self
            .provider
            .get_block(BlockNumber::Latest)
            .await?
            .and_then(|block| block.base_fee_per_gas)
            .unwrap_or_default();
        let suggested = self.provider.get_gas_price().await?;

        let max_gas_price = U256::from(self.config.max_gas_price);
        let optimal = std::cmp::min(std::cmp::max(base_fee * 2, suggested), max_gas_price);

        debug!(
            "Gas price refreshed: base_fee={} suggested={} optimal={}",
            base_fee, suggested, optimal
        );
        *cache = Some((optimal, Instant::now()));
        Ok(optimal)
    }

    /// Next nonce for an address, cached until `max_nonce_cache_age`.
    async fn assign_nonce(
        &self,
        cache: &mut HashMap<Address, NonceCache>,
        address: Address,
    ) -> OracleResult<U256> {
        let max_age = Duration::from_secs(self.config.max_nonce_cache_age);

        if let Some(entry) = cache.get(&address) {
            if entry.cached_at.elapsed() < max_age {
                return Ok(entry.next_nonce);
            }
        }

        let nonce = self
            .provider
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await?;
        cache.insert(
            address,
            NonceCache {
                next_nonce: nonce,
                cached_at: Instant::now(),
            },
        );
        Ok(nonce)
    }

    /// Simulate the transaction against current state; failures abort the
    /// submission entirely.
    async fn simulate(&self, tx: &TypedTransaction) -> OracleResult<()> {
        self.provider.call(tx, None).await.map_err(|e| {
            OracleError::Blockchain(format!("Transaction simulation failed: {}", e))
        })?;
        Ok(())
    }

    /// Send a transaction with automatic nonce management, gas pricing and
    /// pre-flight simulation. Returns the transaction hash once accepted by
    /// the node.
    pub async fn send_transaction(&self, params: TransactionParams) -> OracleResult<H256> {
        let wallet = self.wallet.as_ref().ok_or_else(|| {
            OracleError::Configuration("No signing key configured".to_string())
        })?;
        let from = wallet.address();
        let start = Instant::now();

        let gas_price = match params.gas_price {
            Some(price) => price,
            None => self.optimal_gas_price().await?,
        };
        if gas_price > U256::from(self.config.max_gas_price) {
            return Err(OracleError::Blockchain(format!(
                "Gas price {} exceeds configured maximum",
                gas_price
            )));
        }

        let tx_hash = match params.nonce {
            // Replacement path: the nonce is pinned by the caller.
            Some(nonce) => {
                self.submit_with_nonce(wallet, from, &params, nonce, gas_price)
                    .await?
            }
            None => {
                // The gate covers only the assign+increment pair; the
                // submission itself runs outside it.
                let nonce = {
                    let mut cache = self.nonce_cache.lock().await;
                    let nonce = self.assign_nonce(&mut cache, from).await?;
                    if let Some(entry) = cache.get_mut(&from) {
                        entry.next_nonce = nonce + 1;
                    }
                    nonce
                };

                match self
                    .submit_with_nonce(wallet, from, &params, nonce, gas_price)
                    .await
                {
                    Ok(hash) => hash,
                    Err(err) => {
                        // Hand the nonce back unless a later assignment has
                        // already moved past it.
                        let mut cache = self.nonce_cache.lock().await;
                        if let Some(entry) = cache.get_mut(&from) {
                            if entry.next_nonce == nonce + 1 {
                                entry.next_nonce = nonce;
                            }
                        }
                        return Err(err);
                    }
                }
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics
                .blockchain_operation_duration
                .with_label_values(&["send_transaction"])
                .observe(start.elapsed().as_secs_f64());
        }

        Ok(tx_hash)
    }

    async fn submit_with_nonce(
        &self,
        wallet: &LocalWallet,
        from: Address,
        params: &TransactionParams,
        nonce: U256,
        gas_price: U256,
    ) -> OracleResult<H256> {
        let request = TransactionRequest::new()
            .from(from)
            .to(params.to)
            .value(params.value)
            .data(params.data.clone())
            .nonce(nonce)
            .gas_price(gas_price)
            .chain_id(self.config.chain_id);

        let mut tx: TypedTransaction = request.into();
        match params.gas {
            Some(gas) => tx.set_gas(gas),
            None => {
                let estimate = self.provider.estimate_gas(&tx, None).await?;
                tx.set_gas(estimate)
            }
        };

        self.simulate(&tx).await?;

        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| OracleError::Blockchain(format!("Signing failed: {}", e)))?;
        let raw = tx.rlp_signed(&signature);

        let submitted_block = self.provider.get_block_number().await?.as_u64();
        let pending = self.provider.send_raw_transaction(raw).await?;
        let tx_hash = pending.tx_hash();

        info!("Transaction submitted: {:?} nonce={}", tx_hash, nonce);
        {
            let mut tracked = self.pending.write().await;
            tracked.insert(
                tx_hash,
                PendingTx {
                    tx_hash,
                    nonce,
                    gas_price,
                    submitted_at: Utc::now(),
                    submitted_block,
                    status: TxStatus::Pending,
                    block_number: None,
                },
            );
        }

        Ok(tx_hash)
    }

    /// Wait for a transaction to reach the requested confirmation depth.
    ///
    /// A receipt disappearing mid-wait (reorg) reverts to polling; the
    /// timeout does not cancel the underlying transaction.
    pub async fn wait_for_transaction(
        &self,
        tx_hash: H256,
        wait_timeout: Option<u64>,
        confirmations: Option<u64>,
    ) -> OracleResult<TransactionReceipt> {
        let timeout_secs = wait_timeout.unwrap_or(self.config.transaction_timeout);
        let confirmations = confirmations.unwrap_or(self.config.required_confirmations);
        let poll_interval = Duration::from_secs(self.config.block_time.max(2) / 2);
        let start = Instant::now();

        let wait = async {
            loop {
                if let Some(receipt) = self.provider.get_transaction_receipt(tx_hash).await? {
                    if let Some(block) = receipt.block_number {
                        let head = self.provider.get_block_number().await?;
                        if head.as_u64().saturating_sub(block.as_u64()) >= confirmations {
                            self.apply_receipt(&receipt).await;
                            return Ok(receipt);
                        }
                    }
                }
                sleep(poll_interval).await;
            }
        };

        let result = timeout(Duration::from_secs(timeout_secs), wait)
            .await
            .map_err(|_| OracleError::Timeout(timeout_secs))?;

        if let Some(metrics) = &self.metrics {
            metrics
                .blockchain_operation_duration
                .with_label_values(&["wait_for_transaction"])
                .observe(start.elapsed().as_secs_f64());
        }

        result
    }

    async fn apply_receipt(&self, receipt: &TransactionReceipt) {
        let mut tracked = self.pending.write().await;
        if let Some(entry) = tracked.get_mut(&receipt.transaction_hash) {
            entry.block_number = receipt.block_number.map(|b| b.as_u64());
            entry.status = if receipt.status.map(|s| s.as_u64()) == Some(1) {
                TxStatus::Confirmed
            } else {
                TxStatus::Failed
            };
        }
    }

    /// One pass of the pending transaction monitor. Runs every 60 s from
    /// the background loop; public so tests can drive it directly.
    pub async fn monitor_pending_once(&self) -> OracleResult<()> {
        let current_block = self.provider.get_block_number().await?.as_u64();

        let snapshot: Vec<PendingTx> = {
            let tracked = self.pending.read().await;
            tracked
                .values()
                .filter(|tx| tx.status == TxStatus::Pending)
                .cloned()
                .collect()
        };

        if let Some(metrics) = &self.metrics {
            metrics
                .current_block_number
                .with_label_values(&[self.network_label()])
                .set(current_block as f64);
            metrics
                .pending_transactions
                .with_label_values(&[self.network_label()])
                .set(snapshot.len() as f64);
        }

        for entry in snapshot {
            match self.provider.get_transaction_receipt(entry.tx_hash).await? {
                Some(receipt) => {
                    self.apply_receipt(&receipt).await;
                    debug!(
                        "Transaction {:?} finalized with status {:?}",
                        entry.tx_hash, receipt.status
                    );
                }
                None => match self.provider.get_transaction(entry.tx_hash).await? {
                    Some(tx) if tx.block_number.is_none() => {
                        if current_block.saturating_sub(entry.submitted_block)
                            > STUCK_BLOCK_THRESHOLD
                        {
                            self.handle_stuck_transaction(&entry, &tx).await;
                        }
                    }
                    Some(_) => {
                        // Mined but no receipt yet; leave it pending.
                    }
                    None => {
                        warn!("Transaction {:?} no longer known to the node", entry.tx_hash);
                        let mut tracked = self.pending.write().await;
                        if let Some(tx) = tracked.get_mut(&entry.tx_hash) {
                            tx.status = TxStatus::Failed;
                        }
                    }
                },
            }
        }

        Ok(())
    }

    /// Replace a stuck transaction with an identical body at a bumped gas
    /// price sharing the same nonce. The original is retained as Stuck.
    async fn handle_stuck_transaction(
        &self,
        entry: &PendingTx,
        canonical: &ethers::types::Transaction,
    ) {
        let new_gas_price =
            entry.gas_price * REPLACEMENT_GAS_BUMP_NUM / REPLACEMENT_GAS_BUMP_DEN;
        if new_gas_price > U256::from(self.config.max_gas_price) {
            warn!(
                "Stuck transaction {:?} cannot be replaced within the gas ceiling",
                entry.tx_hash
            );
            return;
        }

        let params = TransactionParams {
            to: canonical.to.unwrap_or_default(),
            value: canonical.value,
            data: canonical.input.clone(),
            gas: Some(canonical.gas),
            nonce: Some(entry.nonce),
            gas_price: Some(new_gas_price),
        };

        match self.send_transaction(params).await {
            Ok(new_hash) => {
                warn!(
                    "Replaced stuck transaction {:?} with {:?} at gas price {}",
                    entry.tx_hash, new_hash, new_gas_price
                );
                let mut tracked = self.pending.write().await;
                if let Some(old) = tracked.get_mut(&entry.tx_hash) {
                    old.status = TxStatus::Stuck;
                }
            }
            Err(e) => {
                error!(
                    "Failed to replace stuck transaction {:?}: {}",
                    entry.tx_hash, e
                );
            }
        }
    }

    pub async fn pending_transactions(&self) -> Vec<PendingTx> {
        let tracked = self.pending.read().await;
        tracked.values().cloned().collect()
    }

    pub async fn transaction_status(&self, tx_hash: &H256) -> Option<TxStatus> {
        let tracked = self.pending.read().await;
        tracked.get(tx_hash).map(|tx| tx.status)
    }

    pub async fn estimate_gas(&self, tx: &TypedTransaction) -> OracleResult<U256> {
        Ok(self.provider.estimate_gas(tx, None).await?)
    }

    pub async fn block_number(&self) -> OracleResult<u64> {
        Ok(self.provider.get_block_number().await?.as_u64())
    }
}
