pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod props;
pub mod scheduler;
pub mod shutdown;
