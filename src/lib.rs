//! api-token：基于 Redis 的 API token 签发、恢复与设备淘汰
//!
//! - [`auth::TokenStore`]：token 存储与设备注册表
//! - [`auth::Token`]：面向调用方的 token 句柄
//! - [`http`]：`{token, data}` / `{code, data}` JSON 适配层

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod http;
pub mod infra;
pub mod logging;

pub use auth::{SessionValue, Token, TokenStore, UserIdentity};
pub use config::AppConfig;
pub use error::{Result, TokenError};
pub use infra::{MemoryBackend, RedisBackend, SessionBackend};
