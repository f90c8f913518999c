// RedisBackend - Redis 存储后端实现
// 基于 bb8-redis 连接池

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use bb8_redis::RedisConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::backend::{ttl_secs, Batch, Command, SessionBackend, Transaction};
use crate::config::RedisConfig;
use crate::error::{Result, TokenError};

type Conn = PooledConnection<'static, RedisConnectionManager>;

/// Redis 存储后端（基于连接池）
#[derive(Clone)]
pub struct RedisBackend {
    pool: Arc<Pool<RedisConnectionManager>>,
    /// 单条 Redis 命令的执行超时
    command_timeout: Duration,
}

/// 执行带超时的 Redis 操作
async fn with_timeout<F, T>(timeout: Duration, op: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| TokenError::Timeout {
            op: op.to_string(),
            millis: timeout.as_millis() as u64,
        })?
}

fn redis_err(op: &str, key: &str) -> impl FnOnce(redis::RedisError) -> TokenError {
    let op = format!("{} {}", op, key);
    move |e| TokenError::backend(op, e)
}

/// 把一批写命令转换为 Redis pipeline，所有回复都忽略
fn to_pipeline(batch: &Batch) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    if batch.is_atomic() {
        pipe.atomic();
    }
    for command in batch.commands() {
        match command {
            Command::HSet { key, fields } => {
                pipe.hset_multiple(key, fields.as_slice()).ignore();
            }
            Command::HDel { key, field } => {
                pipe.hdel(key, field).ignore();
            }
            Command::Del { key } => {
                pipe.del(key).ignore();
            }
            Command::Expire { key, ttl } => {
                pipe.expire(key, ttl_secs(*ttl)).ignore();
            }
        }
    }
    pipe
}

impl RedisBackend {
    /// 创建新的 Redis 后端（从 RedisConfig 配置）
    pub async fn new(config: &RedisConfig) -> Result<Self> {
        let manager = RedisConnectionManager::new(config.url.clone())
            .map_err(|e| TokenError::backend("create redis manager", e))?;

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .min_idle(Some(config.min_idle))
            .connection_timeout(config.connection_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .build(manager)
            .await
            .map_err(|e| TokenError::backend("create redis pool", e))?;

        let backend = Self {
            pool: Arc::new(pool),
            command_timeout: config.command_timeout(),
        };

        // 测试连接
        backend
            .with_timeout("PING", async {
                let mut conn = backend.get_conn().await?;
                let _: String = conn
                    .ping()
                    .await
                    .map_err(|e| TokenError::backend("PING", e))?;
                Ok(())
            })
            .await?;

        tracing::info!(
            "✅ Redis 连接池已创建 (pool_size={}, min_idle={}, conn_timeout={}s, cmd_timeout={}ms, idle_timeout={}s)",
            config.pool_size,
            config.min_idle,
            config.connection_timeout_secs,
            config.command_timeout_ms,
            config.idle_timeout_secs,
        );

        Ok(backend)
    }

    /// 获取连接池状态（活跃连接数、空闲连接数）
    pub fn pool_state(&self) -> bb8::State {
        self.pool.state()
    }

    /// 从连接池获取连接
    async fn get_conn(&self) -> Result<PooledConnection<'_, RedisConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| TokenError::backend("get redis connection", e))
    }

    async fn with_timeout<F, T>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        with_timeout(self.command_timeout, op, fut).await
    }
}

#[async_trait]
impl SessionBackend for RedisBackend {
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.with_timeout("HGETALL", async {
            let mut conn = self.get_conn().await?;
            conn.hgetall(key).await.map_err(redis_err("HGETALL", key))
        })
        .await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.with_timeout("HGET", async {
            let mut conn = self.get_conn().await?;
            conn.hget(key, field).await.map_err(redis_err("HGET", key))
        })
        .await
    }

    async fn hlen(&self, key: &str) -> Result<usize> {
        self.with_timeout("HLEN", async {
            let mut conn = self.get_conn().await?;
            conn.hlen(key).await.map_err(redis_err("HLEN", key))
        })
        .await
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        self.with_timeout("HSETNX", async {
            let mut conn = self.get_conn().await?;
            conn.hset_nx(key, field, value)
                .await
                .map_err(redis_err("HSETNX", key))
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.with_timeout("EXISTS", async {
            let mut conn = self.get_conn().await?;
            conn.exists(key).await.map_err(redis_err("EXISTS", key))
        })
        .await
    }

    async fn exists_many(&self, keys: &[String]) -> Result<Vec<bool>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.with_timeout("EXISTS", async {
            let mut conn = self.get_conn().await?;
            // Pipeline: 多个 EXISTS 合并为单次 RTT
            let mut pipe = redis::pipe();
            for key in keys {
                pipe.exists(key);
            }
            pipe.query_async::<Vec<bool>>(&mut *conn)
                .await
                .map_err(|e| TokenError::backend(format!("EXISTS x{}", keys.len()), e))
        })
        .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.with_timeout("EXPIRE", async {
            let mut conn = self.get_conn().await?;
            conn.expire(key, ttl_secs(ttl))
                .await
                .map_err(redis_err("EXPIRE", key))
        })
        .await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.with_timeout("TTL", async {
            let mut conn = self.get_conn().await?;
            let secs: i64 = conn.ttl(key).await.map_err(redis_err("TTL", key))?;
            // -2: key 不存在；-1: 未设置过期
            Ok((secs >= 0).then(|| Duration::from_secs(secs as u64)))
        })
        .await
    }

    async fn execute(&self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.with_timeout("EXEC", async {
            let mut conn = self.get_conn().await?;
            let pipe = to_pipeline(&batch);
            if !batch.is_atomic() {
                return pipe
                    .query_async::<()>(&mut *conn)
                    .await
                    .map_err(|e| TokenError::backend(format!("pipeline x{}", batch.len()), e));
            }
            // 连接上残留的 WATCH 会让 EXEC 返回 nil，此时没有任何写入生效
            let reply = pipe
                .query_async::<Option<redis::Value>>(&mut *conn)
                .await
                .map_err(|e| TokenError::backend(format!("MULTI/EXEC x{}", batch.len()), e))?;
            match reply {
                Some(_) => Ok(()),
                None => Err(TokenError::backend("EXEC", "transaction aborted")),
            }
        })
        .await
    }

    async fn watch(&self, keys: &[String]) -> Result<Box<dyn Transaction>> {
        let timeout = self.command_timeout;
        // WATCH 状态绑定在连接上，事务期间独占一条连接
        let conn = with_timeout(timeout, "WATCH", async {
            let mut conn = self
                .pool
                .get_owned()
                .await
                .map_err(|e| TokenError::backend("get redis connection", e))?;
            redis::cmd("WATCH")
                .arg(keys)
                .query_async::<()>(&mut *conn)
                .await
                .map_err(|e| TokenError::backend(format!("WATCH {}", keys.join(" ")), e))?;
            Ok(conn)
        })
        .await?;

        Ok(Box::new(RedisTransaction {
            conn: Some(conn),
            command_timeout: timeout,
            finished: false,
        }))
    }
}

/// Redis WATCH 会话，持有一条独占连接直到提交或放弃
///
/// 未经 `commit` / `discard` 就被丢弃时（例如请求被取消），
/// 在后台发送 UNWATCH 后再把连接还给连接池。
pub struct RedisTransaction {
    conn: Option<Conn>,
    command_timeout: Duration,
    finished: bool,
}

impl RedisTransaction {
    fn open_conn(&mut self, op: &str) -> Result<&mut Conn> {
        if self.finished {
            return Err(TokenError::backend(op, "transaction already finished"));
        }
        self.conn
            .as_mut()
            .ok_or_else(|| TokenError::backend(op, "transaction connection released"))
    }

    async fn unwatch(&mut self) -> Result<()> {
        let timeout = self.command_timeout;
        let conn = self.open_conn("UNWATCH")?;
        with_timeout(timeout, "UNWATCH", async move {
            redis::cmd("UNWATCH")
                .query_async::<()>(&mut **conn)
                .await
                .map_err(|e| TokenError::backend("UNWATCH", e))
        })
        .await?;
        self.finished = true;
        Ok(())
    }
}

#[async_trait]
impl Transaction for RedisTransaction {
    async fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>> {
        let timeout = self.command_timeout;
        let conn = self.open_conn("HGETALL")?;
        with_timeout(timeout, "HGETALL", async move {
            conn.hgetall(key).await.map_err(redis_err("HGETALL", key))
        })
        .await
    }

    async fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>> {
        let timeout = self.command_timeout;
        let conn = self.open_conn("HGET")?;
        with_timeout(timeout, "HGET", async move {
            conn.hget(key, field).await.map_err(redis_err("HGET", key))
        })
        .await
    }

    async fn exists(&mut self, key: &str) -> Result<bool> {
        let timeout = self.command_timeout;
        let conn = self.open_conn("EXISTS")?;
        with_timeout(timeout, "EXISTS", async move {
            conn.exists(key).await.map_err(redis_err("EXISTS", key))
        })
        .await
    }

    async fn hget_many(&mut self, keys: &[String], field: &str) -> Result<Vec<Option<String>>> {
        let timeout = self.command_timeout;
        let conn = self.open_conn("HGET")?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        with_timeout(timeout, "HGET", async move {
            let mut pipe = redis::pipe();
            for key in keys {
                pipe.hget(key, field);
            }
            pipe.query_async::<Vec<Option<String>>>(&mut **conn)
                .await
                .map_err(|e| TokenError::backend(format!("HGET {} x{}", field, keys.len()), e))
        })
        .await
    }

    async fn commit(&mut self, batch: Batch) -> Result<bool> {
        if batch.is_empty() {
            self.unwatch().await?;
            return Ok(true);
        }

        let timeout = self.command_timeout;
        let conn = self.open_conn("EXEC")?;
        let mut pipe = to_pipeline(&batch);
        pipe.atomic();
        // EXEC 返回 nil 表示被监视的 key 已被改动
        let reply = with_timeout(timeout, "EXEC", async move {
            pipe.query_async::<Option<redis::Value>>(&mut **conn)
                .await
                .map_err(|e| TokenError::backend(format!("MULTI/EXEC x{}", batch.len()), e))
        })
        .await?;
        // EXEC 无论成功与否都会清除连接上的 WATCH
        self.finished = true;
        Ok(reply.is_some())
    }

    async fn discard(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.unwatch().await
    }
}

impl Drop for RedisTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let timeout = self.command_timeout;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let result = with_timeout(timeout, "UNWATCH", async {
                        redis::cmd("UNWATCH")
                            .query_async::<()>(&mut *conn)
                            .await
                            .map_err(|e| TokenError::backend("UNWATCH", e))
                    })
                    .await;
                    if let Err(e) = result {
                        warn!("⚠️ 事务被丢弃后 UNWATCH 失败: {}", e);
                    }
                });
            }
            Err(_) => {
                warn!("⚠️ 事务在运行时之外被丢弃，连接上可能残留 WATCH");
            }
        }
    }
}
