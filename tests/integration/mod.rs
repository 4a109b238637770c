pub mod eth_service_test;
pub mod pipeline_test;
