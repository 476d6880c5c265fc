pub mod config;
pub mod error;
pub mod policy;

pub use config::{
    load_dotenv, MirrorSettings, ProviderConfig, RateLimitConfig, RuntimeConfig,
    RuntimeSettings, TransportKind, TransportParams, MIN_QPS,
};
pub use error::*;
pub use policy::{AutoApprovePolicy, PermissionType};
