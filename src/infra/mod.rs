// Infrastructure layer - 基础设施层
// 负责存储后端（Redis / 内存）与监控指标

pub mod backend;
pub mod memory;
pub mod metrics;
pub mod redis;

// 重新导出主要类型
pub use self::backend::{Batch, Command, SessionBackend, Transaction};
pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;
