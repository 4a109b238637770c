pub mod contract_registry;
pub mod eth_service;
pub mod metrics_service;
pub mod oracle_service;
pub mod signing_service;
