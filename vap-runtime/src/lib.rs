pub mod attestation;
pub mod config;
pub mod error;
pub mod identity;
pub mod joblog;
pub mod marketplace;
pub mod port_pool;
pub mod rate_limit;
pub mod types;

pub use config::DispatcherConfig;
pub use error::DispatcherError;
pub use identity::{Identity, IdentityRecord};
pub use joblog::JobLog;
pub use marketplace::MarketplaceClient;
pub use port_pool::PortPool;
pub use rate_limit::AcceptRateLimiter;
pub use types::*;
