//! 存储后端契约
//!
//! Token 存储只依赖这里定义的能力：
//! - hash 记录的读写删与按 key 的 TTL
//! - `HSETNX` 式的条件写入（返回是否抢到）
//! - 批量流水线执行（可选 MULTI/EXEC 原子提交）
//! - WATCH 乐观事务：监视 key，读取，提交一批命令；监视期间 key 被改动则整批放弃
//!
//! 生产环境由 [`RedisBackend`](super::redis::RedisBackend) 实现，
//! 测试与本地开发使用 [`MemoryBackend`](super::memory::MemoryBackend)。

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::Result;

/// 流水线中的单条写命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// HSET key field value [field value ...]
    HSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    /// HDEL key field
    HDel { key: String, field: String },
    /// DEL key
    Del { key: String },
    /// EXPIRE key seconds
    Expire { key: String, ttl: Duration },
}

/// 一批写命令，一次往返提交
#[derive(Debug, Clone, Default)]
pub struct Batch {
    commands: Vec<Command>,
    atomic: bool,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以 MULTI/EXEC 包裹整批命令
    pub fn atomic(&mut self) -> &mut Self {
        self.atomic = true;
        self
    }

    pub fn hset(
        &mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.commands.push(Command::HSet {
            key: key.into(),
            fields: vec![(field.into(), value.into())],
        });
        self
    }

    pub fn hset_multiple(
        &mut self,
        key: impl Into<String>,
        fields: Vec<(String, String)>,
    ) -> &mut Self {
        self.commands.push(Command::HSet {
            key: key.into(),
            fields,
        });
        self
    }

    pub fn hdel(&mut self, key: impl Into<String>, field: impl Into<String>) -> &mut Self {
        self.commands.push(Command::HDel {
            key: key.into(),
            field: field.into(),
        });
        self
    }

    pub fn del(&mut self, key: impl Into<String>) -> &mut Self {
        self.commands.push(Command::Del { key: key.into() });
        self
    }

    pub fn expire(&mut self, key: impl Into<String>, ttl: Duration) -> &mut Self {
        self.commands.push(Command::Expire {
            key: key.into(),
            ttl,
        });
        self
    }

    pub fn is_atomic(&self) -> bool {
        self.atomic
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }
}

/// TTL 以秒为单位下发，不足一秒的按一秒处理
pub fn ttl_secs(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1).min(i64::MAX as u64) as i64
}

/// 存储后端
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// HGETALL；key 不存在时返回空表
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hlen(&self, key: &str) -> Result<usize>;

    /// HSETNX：字段不存在时写入，返回是否写入成功
    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// 批量 EXISTS，结果与 `keys` 一一对应
    async fn exists_many(&self, keys: &[String]) -> Result<Vec<bool>>;

    /// EXPIRE；key 不存在时返回 false
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// 剩余 TTL；key 不存在或未设置过期时返回 `None`
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// 执行一批写命令
    async fn execute(&self, batch: Batch) -> Result<()>;

    /// 开启乐观事务：WATCH `keys`
    async fn watch(&self, keys: &[String]) -> Result<Box<dyn Transaction>>;
}

/// 已 WATCH 的事务会话
///
/// 调用方必须以 `commit` 或 `discard` 结束会话。
#[async_trait]
pub trait Transaction: Send {
    async fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>>;

    async fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>>;

    async fn exists(&mut self, key: &str) -> Result<bool>;

    /// 对多个 hash 读取同一字段，key 不存在时对应位置为 `None`
    async fn hget_many(&mut self, keys: &[String], field: &str) -> Result<Vec<Option<String>>>;

    /// MULTI/EXEC 提交；返回 `false` 表示被监视的 key 已被改动，整批未生效
    async fn commit(&mut self, batch: Batch) -> Result<bool>;

    /// UNWATCH
    async fn discard(&mut self) -> Result<()>;
}
