pub mod adapters_test;
pub mod scheduler_test;
pub mod validation_test;
