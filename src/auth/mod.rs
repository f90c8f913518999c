// 认证模块 - 提供 token 签发、恢复、设备注册表与设备淘汰

pub mod device_registry;
pub mod models;
pub mod token;
pub mod token_id;
pub mod token_store;

// 重新导出主要类型
pub use device_registry::{EvictionOutcome, EvictionPolicy, RegistryEntry};
pub use models::{devices_key, record_key, SessionValue};
pub use token::{Token, UserIdentity};
pub use token_id::new_token_id;
pub use token_store::TokenStore;
