use ethers::types::{Address, Bytes, U256};

use oracle_control_plane::services::eth_service::{
    EthereumService, TransactionParams, TxStatus,
};

use crate::fixtures::{network_config, TEST_PRIVATE_KEY};
use crate::helpers::spawn_mock_chain;

fn service_for(url: &str) -> EthereumService {
    EthereumService::new(network_config(url), Some(TEST_PRIVATE_KEY.to_string()), None)
        .expect("eth service")
}

fn simple_params() -> TransactionParams {
    TransactionParams {
        to: Address::random(),
        value: U256::zero(),
        data: Bytes::from(vec![0xde, 0xad, 0xbe, 0xef]),
        gas: Some(U256::from(100_000u64)),
        nonce: None,
        gas_price: None,
    }
}

#[tokio::test]
async fn test_optimal_gas_price_formula() {
    let chain = spawn_mock_chain(true).await;
    {
        let mut state = chain.state.lock().await;
        state.base_fee = 1_000_000_000;
        state.gas_price = 1_500_000_000;
    }
    let service = service_for(&chain.url);

    // max(2 * base_fee, suggested) = 2 gwei, below the ceiling.
    let price = service.optimal_gas_price().await.expect("gas price");
    assert_eq!(price, U256::from(2_000_000_000u64));
}

#[tokio::test]
async fn test_gas_price_is_capped_by_config() {
    let chain = spawn_mock_chain(true).await;
    {
        let mut state = chain.state.lock().await;
        // Push the suggestion far beyond the 500 gwei ceiling.
        state.base_fee = 400_000_000_000;
        state.gas_price = 900_000_000_000;
    }
    let service = service_for(&chain.url);

    let price = service.optimal_gas_price().await.expect("gas price");
    assert_eq!(price, U256::from(500_000_000_000u128));
}

#[tokio::test]
async fn test_nonce_sequence_across_submissions() {
    let chain = spawn_mock_chain(true).await;
    let service = service_for(&chain.url);

    service
        .send_transaction(simple_params())
        .await
        .expect("first send");
    service
        .send_transaction(simple_params())
        .await
        .expect("second send");

    let sent = chain.sent_transactions().await;
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].1.nonce, U256::zero());
    assert_eq!(sent[1].1.nonce, U256::from(1));
}

#[tokio::test]
async fn test_concurrent_submissions_get_distinct_nonces() {
    let chain = spawn_mock_chain(true).await;
    let service = service_for(&chain.url);

    // In-flight submissions only queue at the nonce gate; every one must
    // still come out with its own nonce.
    let sends = (0..4).map(|_| service.send_transaction(simple_params()));
    let results = futures::future::join_all(sends).await;
    for result in results {
        assert!(result.is_ok());
    }

    let mut nonces: Vec<u64> = chain
        .sent_transactions()
        .await
        .iter()
        .map(|(_, tx)| tx.nonce.as_u64())
        .collect();
    nonces.sort_unstable();
    assert_eq!(nonces, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_submission_is_tracked_and_confirmed() {
    let chain = spawn_mock_chain(true).await;
    let service = service_for(&chain.url);

    let tx_hash = service
        .send_transaction(simple_params())
        .await
        .expect("send");
    assert_eq!(
        service.transaction_status(&tx_hash).await,
        Some(TxStatus::Pending)
    );

    service.monitor_pending_once().await.expect("monitor");
    assert_eq!(
        service.transaction_status(&tx_hash).await,
        Some(TxStatus::Confirmed)
    );
}

#[tokio::test]
async fn test_stuck_transaction_replacement() {
    let chain = spawn_mock_chain(false).await;
    let service = service_for(&chain.url);

    let tx_hash = service
        .send_transaction(simple_params())
        .await
        .expect("send");
    let original_gas_price = chain.sent_transactions().await[0].1.gas_price;

    // Not yet past the stuck threshold: nothing happens.
    chain.advance_blocks(5).await;
    service.monitor_pending_once().await.expect("monitor");
    assert_eq!(
        service.transaction_status(&tx_hash).await,
        Some(TxStatus::Pending)
    );
    assert_eq!(chain.sent_transactions().await.len(), 1);

    // Past the threshold: a replacement with the same nonce and a 1.2x
    // gas price is submitted, the original is retained as Stuck.
    chain.advance_blocks(7).await;
    service.monitor_pending_once().await.expect("monitor");

    let sent = chain.sent_transactions().await;
    assert_eq!(sent.len(), 2);
    let (replacement_hash, replacement) = (sent[1].0, sent[1].1.clone());
    assert_eq!(replacement.nonce, sent[0].1.nonce);
    assert_eq!(
        replacement.gas_price,
        original_gas_price * U256::from(12) / U256::from(10)
    );

    assert_eq!(
        service.transaction_status(&tx_hash).await,
        Some(TxStatus::Stuck)
    );
    assert_eq!(
        service.transaction_status(&replacement_hash).await,
        Some(TxStatus::Pending)
    );

    // Once the replacement mines, the monitor confirms it; the original
    // stays Stuck.
    chain.mine_success(replacement_hash).await;
    service.monitor_pending_once().await.expect("monitor");
    assert_eq!(
        service.transaction_status(&replacement_hash).await,
        Some(TxStatus::Confirmed)
    );
    assert_eq!(
        service.transaction_status(&tx_hash).await,
        Some(TxStatus::Stuck)
    );
}

#[tokio::test]
async fn test_wait_for_transaction_times_out() {
    let chain = spawn_mock_chain(false).await;
    let service = service_for(&chain.url);

    let tx_hash = service
        .send_transaction(simple_params())
        .await
        .expect("send");

    let result = service.wait_for_transaction(tx_hash, Some(1), Some(1)).await;
    assert!(result.is_err());
    // The timeout does not cancel the underlying transaction.
    assert_eq!(
        service.transaction_status(&tx_hash).await,
        Some(TxStatus::Pending)
    );
}

#[tokio::test]
async fn test_wait_for_transaction_confirms() {
    let chain = spawn_mock_chain(true).await;
    let service = service_for(&chain.url);

    let tx_hash = service
        .send_transaction(simple_params())
        .await
        .expect("send");
    let receipt = service
        .wait_for_transaction(tx_hash, Some(30), Some(2))
        .await
        .expect("receipt");
    assert_eq!(receipt.status.map(|s| s.as_u64()), Some(1));
}
