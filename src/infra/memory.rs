//! 进程内存储后端
//!
//! 语义与 Redis 对齐：hash 在最后一个字段删除后随之消失、TTL 惰性过期、
//! HSET 不影响已有 TTL、WATCH 基于 key 版本号检测并发修改。
//! 用于测试与 `--memory` 模式，不做持久化。

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::backend::{Batch, Command, SessionBackend, Transaction};
use crate::error::{Result, TokenError};

#[derive(Debug, Default)]
struct Entry {
    fields: HashMap<String, String>,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    /// 每次写入 / 删除 / 过期都会递增，WATCH 以此判断 key 是否被改动
    versions: HashMap<String, u64>,
    offline: bool,
    forced_conflicts: usize,
}

impl State {
    fn bump(&mut self, key: &str) {
        *self.versions.entry(key.to_string()).or_insert(0) += 1;
    }

    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    /// 过期 key 惰性删除
    fn purge(&mut self, key: &str) {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.entries.remove(key);
            self.bump(key);
        }
    }

    fn live(&mut self, key: &str) -> Option<&Entry> {
        self.purge(key);
        self.entries.get(key)
    }

    fn check_online(&self, op: &str) -> Result<()> {
        if self.offline {
            return Err(TokenError::backend(op, "memory backend is offline"));
        }
        Ok(())
    }

    fn hgetall(&mut self, key: &str) -> HashMap<String, String> {
        self.live(key).map(|e| e.fields.clone()).unwrap_or_default()
    }

    fn hget(&mut self, key: &str, field: &str) -> Option<String> {
        self.live(key).and_then(|e| e.fields.get(field).cloned())
    }

    fn exists(&mut self, key: &str) -> bool {
        self.live(key).is_some()
    }

    fn apply(&mut self, command: &Command) {
        match command {
            Command::HSet { key, fields } => {
                if fields.is_empty() {
                    return;
                }
                self.purge(key);
                let entry = self.entries.entry(key.clone()).or_default();
                for (field, value) in fields {
                    entry.fields.insert(field.clone(), value.clone());
                }
                self.bump(key);
            }
            Command::HDel { key, field } => {
                self.purge(key);
                let mut removed = false;
                let mut emptied = false;
                if let Some(entry) = self.entries.get_mut(key) {
                    removed = entry.fields.remove(field).is_some();
                    emptied = entry.fields.is_empty();
                }
                if emptied {
                    self.entries.remove(key);
                }
                if removed {
                    self.bump(key);
                }
            }
            Command::Del { key } => {
                self.purge(key);
                if self.entries.remove(key).is_some() {
                    self.bump(key);
                }
            }
            Command::Expire { key, ttl } => {
                self.set_expiry(key, *ttl);
            }
        }
    }

    fn set_expiry(&mut self, key: &str, ttl: Duration) -> bool {
        self.purge(key);
        let updated = match self.entries.get_mut(key) {
            Some(entry) => {
                // 超出 Instant 表示范围时视为永不过期
                entry.expires_at = Instant::now().checked_add(ttl);
                true
            }
            None => false,
        };
        if updated {
            self.bump(key);
        }
        updated
    }

    fn apply_batch(&mut self, batch: &Batch) {
        for command in batch.commands() {
            self.apply(command);
        }
    }
}

/// 内存后端，克隆后共享同一份数据
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟后端不可达：之后的所有调用都返回 `Backend` 错误
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// 让接下来 `n` 次事务提交都报告冲突
    pub fn inject_watch_conflicts(&self, n: usize) {
        self.state.lock().forced_conflicts = n;
    }

    /// 当前存活的 key 数
    pub fn key_count(&self) -> usize {
        let mut state = self.state.lock();
        let keys: Vec<String> = state.entries.keys().cloned().collect();
        for key in &keys {
            state.purge(key);
        }
        state.entries.len()
    }
}

#[async_trait]
impl SessionBackend for MemoryBackend {
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut state = self.state.lock();
        state.check_online("HGETALL")?;
        Ok(state.hgetall(key))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut state = self.state.lock();
        state.check_online("HGET")?;
        Ok(state.hget(key, field))
    }

    async fn hlen(&self, key: &str) -> Result<usize> {
        let mut state = self.state.lock();
        state.check_online("HLEN")?;
        Ok(state.live(key).map(|e| e.fields.len()).unwrap_or(0))
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let mut state = self.state.lock();
        state.check_online("HSETNX")?;
        if state.hget(key, field).is_some() {
            return Ok(false);
        }
        state.apply(&Command::HSet {
            key: key.to_string(),
            fields: vec![(field.to_string(), value.to_string())],
        });
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock();
        state.check_online("EXISTS")?;
        Ok(state.exists(key))
    }

    async fn exists_many(&self, keys: &[String]) -> Result<Vec<bool>> {
        let mut state = self.state.lock();
        state.check_online("EXISTS")?;
        Ok(keys.iter().map(|k| state.exists(k)).collect())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock();
        state.check_online("EXPIRE")?;
        Ok(state.set_expiry(key, ttl))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut state = self.state.lock();
        state.check_online("TTL")?;
        Ok(state
            .live(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn execute(&self, batch: Batch) -> Result<()> {
        let mut state = self.state.lock();
        state.check_online("EXEC")?;
        state.apply_batch(&batch);
        Ok(())
    }

    async fn watch(&self, keys: &[String]) -> Result<Box<dyn Transaction>> {
        let mut state = self.state.lock();
        state.check_online("WATCH")?;
        let mut watched = Vec::with_capacity(keys.len());
        for key in keys {
            state.purge(key);
            watched.push((key.clone(), state.version(key)));
        }
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            watched,
            finished: false,
        }))
    }
}

/// 内存后端的 WATCH 会话
pub struct MemoryTransaction {
    state: Arc<Mutex<State>>,
    watched: Vec<(String, u64)>,
    finished: bool,
}

impl MemoryTransaction {
    fn ensure_open(&self, op: &str) -> Result<()> {
        if self.finished {
            return Err(TokenError::backend(op, "transaction already finished"));
        }
        Ok(())
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>> {
        self.ensure_open("HGETALL")?;
        let mut state = self.state.lock();
        state.check_online("HGETALL")?;
        Ok(state.hgetall(key))
    }

    async fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>> {
        self.ensure_open("HGET")?;
        let mut state = self.state.lock();
        state.check_online("HGET")?;
        Ok(state.hget(key, field))
    }

    async fn exists(&mut self, key: &str) -> Result<bool> {
        self.ensure_open("EXISTS")?;
        let mut state = self.state.lock();
        state.check_online("EXISTS")?;
        Ok(state.exists(key))
    }

    async fn hget_many(&mut self, keys: &[String], field: &str) -> Result<Vec<Option<String>>> {
        self.ensure_open("HGET")?;
        let mut state = self.state.lock();
        state.check_online("HGET")?;
        Ok(keys.iter().map(|k| state.hget(k, field)).collect())
    }

    async fn commit(&mut self, batch: Batch) -> Result<bool> {
        self.ensure_open("EXEC")?;
        self.finished = true;
        let mut state = self.state.lock();
        state.check_online("EXEC")?;

        if state.forced_conflicts > 0 {
            state.forced_conflicts -= 1;
            return Ok(false);
        }

        for (key, _) in &self.watched {
            state.purge(key);
        }
        let changed = self
            .watched
            .iter()
            .any(|(key, version)| state.version(key) != *version);
        if changed {
            return Ok(false);
        }

        state.apply_batch(&batch);
        Ok(true)
    }

    async fn discard(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hdel_last_field_removes_key() {
        let backend = MemoryBackend::new();
        let mut batch = Batch::new();
        batch.hset("devices:u1", "c1", "t1");
        backend.execute(batch).await.unwrap();
        assert!(backend.exists("devices:u1").await.unwrap());

        let mut batch = Batch::new();
        batch.hdel("devices:u1", "c1");
        backend.execute(batch).await.unwrap();
        assert!(!backend.exists("devices:u1").await.unwrap());
        assert_eq!(backend.hlen("devices:u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_huge_ttl_does_not_overflow() {
        let backend = MemoryBackend::new();
        let mut batch = Batch::new();
        batch
            .hset("record:t", "uid", "u1")
            .expire("record:t", Duration::MAX);
        backend.execute(batch).await.unwrap();

        assert!(backend.exists("record:t").await.unwrap());
        assert!(backend.expire("record:t", Duration::MAX).await.unwrap());
    }

    #[tokio::test]
    async fn test_hset_nx_only_first_wins() {
        let backend = MemoryBackend::new();
        assert!(backend.hset_nx("devices:u1", "c1", "a").await.unwrap());
        assert!(!backend.hset_nx("devices:u1", "c1", "b").await.unwrap());
        assert_eq!(
            backend.hget("devices:u1", "c1").await.unwrap().as_deref(),
            Some("a")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_is_lazy_and_complete() {
        let backend = MemoryBackend::new();
        let mut batch = Batch::new();
        batch
            .hset("record:t", "uid", "u1")
            .expire("record:t", Duration::from_secs(10));
        backend.execute(batch).await.unwrap();

        let ttl = backend.ttl("record:t").await.unwrap().unwrap();
        assert!(ttl <= Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!backend.exists("record:t").await.unwrap());
        assert!(backend.hgetall("record:t").await.unwrap().is_empty());
        assert_eq!(backend.ttl("record:t").await.unwrap(), None);
        assert!(!backend.expire("record:t", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_watch_detects_concurrent_write() {
        let backend = MemoryBackend::new();
        backend.hset_nx("devices:u1", "c1", "a").await.unwrap();

        let mut tx = backend.watch(&["devices:u1".to_string()]).await.unwrap();
        assert_eq!(tx.hgetall("devices:u1").await.unwrap().len(), 1);

        backend.hset_nx("devices:u1", "c2", "b").await.unwrap();

        let mut batch = Batch::new();
        batch.atomic().hdel("devices:u1", "c1");
        assert!(!tx.commit(batch).await.unwrap());
        assert_eq!(backend.hlen("devices:u1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_watch_commits_when_untouched() {
        let backend = MemoryBackend::new();
        backend.hset_nx("devices:u1", "c1", "a").await.unwrap();

        let mut tx = backend.watch(&["devices:u1".to_string()]).await.unwrap();
        let mut batch = Batch::new();
        batch.atomic().hdel("devices:u1", "c1").del("record:a");
        assert!(tx.commit(batch).await.unwrap());
        assert!(!backend.exists("devices:u1").await.unwrap());

        let err = tx.commit(Batch::new()).await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_injected_conflicts_and_offline() {
        let backend = MemoryBackend::new();
        backend.inject_watch_conflicts(1);

        let mut tx = backend.watch(&["k".to_string()]).await.unwrap();
        assert!(!tx.commit(Batch::new()).await.unwrap());
        let mut tx = backend.watch(&["k".to_string()]).await.unwrap();
        assert!(tx.commit(Batch::new()).await.unwrap());

        backend.set_offline(true);
        assert!(matches!(
            backend.exists("k").await,
            Err(TokenError::Backend { .. })
        ));
    }
}
