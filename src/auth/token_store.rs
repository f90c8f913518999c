//! Token 存储
//!
//! 维护两类 key：
//! - `record:<token>`：Session 记录（hash，带 TTL）
//! - `devices:<uid>`：设备注册表（hash，clientId -> token，无 TTL）
//!
//! 所有状态都在存储后端中，`TokenStore` 本身只持有配置，可随意克隆共享。
//! 注册表的多条目读改写（淘汰、条件删除、过期条目清理）都在 WATCH 事务中完成。

use chrono::{DateTime, Utc};
use std::slice;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::device_registry::{EvictionOutcome, EvictionPolicy, RegistryEntry};
use super::models::{devices_key, record_key, SessionValue, FIELD_LATEST_TIME};
use super::token_id::new_token_id;
use crate::config::{TokenConfig, MAX_TTL_DAYS_LIMIT};
use crate::error::{Result, TokenError};
use crate::infra::backend::{Batch, SessionBackend, Transaction};
use crate::infra::metrics;

/// 淘汰事务最多尝试次数（首次 + 冲突后重试一次）
const EVICTION_ATTEMPTS: usize = 2;
/// createOrReuse 争抢注册表条目的最多轮数
const REGISTRY_ATTEMPTS: usize = 3;
/// 心跳事务最多尝试次数
const TOUCH_ATTEMPTS: usize = 2;

/// 日志中只打印 token 前缀
fn short(token: &str) -> &str {
    token.get(..8).unwrap_or(token)
}

fn require_uid(uid: &str) -> Result<()> {
    if uid.is_empty() {
        return Err(TokenError::invalid("uid is empty"));
    }
    Ok(())
}

/// 事务出错时放弃 WATCH，再把原错误交给调用方
async fn finish<T>(tx: &mut dyn Transaction, result: Result<T>) -> Result<T> {
    if result.is_err() {
        if let Err(e) = tx.discard().await {
            debug!("UNWATCH 失败: {}", e);
        }
    }
    result
}

#[derive(Clone)]
pub struct TokenStore {
    backend: Arc<dyn SessionBackend>,
    policy: EvictionPolicy,
    max_ttl: Duration,
}

impl TokenStore {
    pub fn new(backend: Arc<dyn SessionBackend>, config: &TokenConfig) -> Result<Self> {
        let policy = EvictionPolicy::from_config(config)?;
        if config.max_ttl_days == 0 || config.max_ttl_days > MAX_TTL_DAYS_LIMIT {
            return Err(TokenError::Configuration(format!(
                "max_ttl_days must be in 1..={} (got {})",
                MAX_TTL_DAYS_LIMIT, config.max_ttl_days
            )));
        }
        let max_ttl = config.max_ttl();
        Ok(Self {
            backend,
            policy,
            max_ttl,
        })
    }

    pub fn max_ttl(&self) -> Duration {
        self.max_ttl
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// 未指定、为零或超过上限的 TTL 一律按上限处理
    pub fn clamp_ttl(&self, ttl: Option<Duration>) -> Duration {
        match ttl {
            Some(ttl) if !ttl.is_zero() && ttl <= self.max_ttl => ttl,
            _ => self.max_ttl,
        }
    }

    // ============================================================
    // 签发
    // ============================================================

    /// 签发新 token，覆盖该设备上已有的 token（后登录者生效）
    pub async fn create(&self, value: &SessionValue) -> Result<String> {
        value.validate()?;
        let ctx =
            |e: TokenError| e.context(format!("create uid={} client_id={}", value.uid, value.client_id));

        let devices = devices_key(&value.uid);
        let old = self
            .backend
            .hget(&devices, &value.client_id)
            .await
            .map_err(ctx)?;

        let token = new_token_id(&value.uid, &value.client_id);
        let record = record_key(&token);

        // 删除旧记录、写新记录、登记设备，一次 MULTI/EXEC
        let mut batch = Batch::new();
        batch.atomic();
        if let Some(old) = &old {
            batch.del(record_key(old));
        }
        batch
            .hset_multiple(&record, value.to_fields())
            .expire(&record, self.max_ttl)
            .hset(&devices, &value.client_id, &token);
        self.backend.execute(batch).await.map_err(ctx)?;

        info!(
            uid = %value.uid,
            client_id = %value.client_id,
            token = short(&token),
            replaced = old.is_some(),
            "✅ 签发 token"
        );
        metrics::record_issued("overwrite");

        self.evict_if_needed(&value.uid).await.map_err(ctx)?;
        Ok(token)
    }

    /// 签发或复用 token（先登录者生效）
    ///
    /// 并发调用同一 (uid, clientId) 时所有调用方拿到同一个 token。
    /// 先写入临时记录再争抢注册表条目，条目永远不会指向尚未写入的记录。
    pub async fn create_or_reuse(&self, value: &SessionValue) -> Result<String> {
        value.validate()?;
        let ctx = |e: TokenError| {
            e.context(format!(
                "create_or_reuse uid={} client_id={}",
                value.uid, value.client_id
            ))
        };

        self.evict_if_needed(&value.uid).await.map_err(ctx)?;

        let devices = devices_key(&value.uid);
        let token = new_token_id(&value.uid, &value.client_id);
        let record = record_key(&token);

        let mut batch = Batch::new();
        batch
            .atomic()
            .hset_multiple(&record, value.to_fields())
            .expire(&record, self.max_ttl);
        self.backend.execute(batch).await.map_err(ctx)?;

        for _ in 0..REGISTRY_ATTEMPTS {
            if self
                .backend
                .hset_nx(&devices, &value.client_id, &token)
                .await
                .map_err(ctx)?
            {
                info!(
                    uid = %value.uid,
                    client_id = %value.client_id,
                    token = short(&token),
                    "✅ 签发 token"
                );
                metrics::record_issued("reuse");
                return Ok(token);
            }

            // 条目已被占用：读出胜者
            let winner = match self
                .backend
                .hget(&devices, &value.client_id)
                .await
                .map_err(ctx)?
            {
                Some(winner) => winner,
                // 胜者刚被删除，重新争抢
                None => continue,
            };

            if self.touch(&winner, value.latest_time).await.map_err(ctx)? {
                self.discard_provisional(&record).await;
                info!(
                    uid = %value.uid,
                    client_id = %value.client_id,
                    token = short(&winner),
                    "♻️ 复用已有 token"
                );
                metrics::record_reused();
                return Ok(winner);
            }

            // 胜者的记录已过期：CAS 替换失效条目，保留自己的 token
            if self
                .replace_stale_entry(&devices, &value.client_id, &winner, &token)
                .await
                .map_err(ctx)?
            {
                info!(
                    uid = %value.uid,
                    client_id = %value.client_id,
                    token = short(&token),
                    stale = short(&winner),
                    "✅ 签发 token（替换失效条目）"
                );
                metrics::record_issued("reuse");
                return Ok(token);
            }
        }

        self.discard_provisional(&record).await;
        Err(ctx(TokenError::backend(
            "HSETNX",
            "device registry contention, giving up",
        )))
    }

    async fn discard_provisional(&self, record: &str) {
        let mut batch = Batch::new();
        batch.del(record);
        if let Err(e) = self.backend.execute(batch).await {
            warn!("删除临时记录失败 {}: {}", record, e);
        }
    }

    /// 注册表条目仍指向已过期的 `stale` 时替换为 `token`
    async fn replace_stale_entry(
        &self,
        devices: &str,
        client_id: &str,
        stale: &str,
        token: &str,
    ) -> Result<bool> {
        let stale_record = record_key(stale);
        let mut tx = self
            .backend
            .watch(&[devices.to_string(), stale_record.clone()])
            .await?;
        let result = Self::try_replace_stale(
            tx.as_mut(),
            devices,
            client_id,
            stale,
            &stale_record,
            token,
        )
        .await;
        finish(tx.as_mut(), result).await
    }

    async fn try_replace_stale(
        tx: &mut dyn Transaction,
        devices: &str,
        client_id: &str,
        stale: &str,
        stale_record: &str,
        token: &str,
    ) -> Result<bool> {
        let current = tx.hget(devices, client_id).await?;
        if current.as_deref() != Some(stale) || tx.exists(stale_record).await? {
            tx.discard().await?;
            return Ok(false);
        }
        let mut batch = Batch::new();
        batch.atomic().hset(devices, client_id, token);
        tx.commit(batch).await
    }

    // ============================================================
    // 查询与续期
    // ============================================================

    /// 读取 Session 记录；token 不存在或已过期时返回 `None`
    pub async fn resume(&self, token: &str) -> Result<Option<SessionValue>> {
        if token.is_empty() {
            return Ok(None);
        }
        let fields = self
            .backend
            .hgetall(&record_key(token))
            .await
            .map_err(|e| e.context(format!("resume token={}", short(token))))?;
        if fields.is_empty() {
            debug!(token = short(token), "token 不存在或已过期");
            return Ok(None);
        }
        Ok(Some(SessionValue::from_fields(&fields)))
    }

    pub async fn exists(&self, token: &str) -> Result<bool> {
        if token.is_empty() {
            return Ok(false);
        }
        self.backend
            .exists(&record_key(token))
            .await
            .map_err(|e| e.context(format!("exists token={}", short(token))))
    }

    /// 延长 TTL；token 不存在时返回 false
    pub async fn refresh_ttl(&self, token: &str, ttl: Option<Duration>) -> Result<bool> {
        if token.is_empty() {
            return Ok(false);
        }
        let ttl = self.clamp_ttl(ttl);
        self.backend
            .expire(&record_key(token), ttl)
            .await
            .map_err(|e| e.context(format!("refresh_ttl token={}", short(token))))
    }

    /// 实际剩余 TTL
    pub async fn remaining_ttl(&self, token: &str) -> Result<Option<Duration>> {
        if token.is_empty() {
            return Ok(None);
        }
        self.backend
            .ttl(&record_key(token))
            .await
            .map_err(|e| e.context(format!("remaining_ttl token={}", short(token))))
    }

    /// 心跳：更新 latestTime 并把 TTL 续满
    ///
    /// 只在记录仍存在时生效（WATCH 记录 key），不会复活已过期的记录。
    pub async fn touch(&self, token: &str, latest_time: DateTime<Utc>) -> Result<bool> {
        if token.is_empty() {
            return Ok(false);
        }
        let ctx = |e: TokenError| e.context(format!("touch token={}", short(token)));
        let record = record_key(token);

        for _ in 0..TOUCH_ATTEMPTS {
            let mut tx = self
                .backend
                .watch(slice::from_ref(&record))
                .await
                .map_err(ctx)?;
            let result = self.try_touch(tx.as_mut(), &record, latest_time).await;
            if let Some(touched) = finish(tx.as_mut(), result).await.map_err(ctx)? {
                return Ok(touched);
            }
            debug!(token = short(token), "心跳事务冲突，重试");
        }

        // 持续冲突说明记录正被并发更新，只续期
        self.backend
            .expire(&record, self.max_ttl)
            .await
            .map_err(ctx)
    }

    async fn try_touch(
        &self,
        tx: &mut dyn Transaction,
        record: &str,
        latest_time: DateTime<Utc>,
    ) -> Result<Option<bool>> {
        if !tx.exists(record).await? {
            tx.discard().await?;
            return Ok(Some(false));
        }
        let mut batch = Batch::new();
        batch
            .atomic()
            .hset(record, FIELD_LATEST_TIME, latest_time.timestamp().to_string())
            .expire(record, self.max_ttl);
        Ok(tx.commit(batch).await?.then_some(true))
    }

    // ============================================================
    // 删除
    // ============================================================

    /// 删除 token，幂等；返回调用前 token 是否存在
    ///
    /// 注册表条目只在仍指向本 token 时才删除。
    pub async fn delete(&self, token: &str) -> Result<bool> {
        let Some(value) = self.resume(token).await? else {
            return Ok(false);
        };
        let ctx = |e: TokenError| e.context(format!("delete token={}", short(token)));

        let record = record_key(token);
        let devices = devices_key(&value.uid);
        let mut tx = self
            .backend
            .watch(slice::from_ref(&devices))
            .await
            .map_err(ctx)?;
        let result =
            Self::try_delete(tx.as_mut(), &record, &devices, &value.client_id, token).await;
        let committed = finish(tx.as_mut(), result).await.map_err(ctx)?;

        if !committed {
            // 注册表被并发修改：只删记录，失效条目由后续查询清理
            let mut batch = Batch::new();
            batch.del(&record);
            self.backend.execute(batch).await.map_err(ctx)?;
        }

        info!(
            uid = %value.uid,
            client_id = %value.client_id,
            token = short(token),
            "🗑️ 删除 token"
        );
        metrics::record_deleted(1);
        Ok(true)
    }

    async fn try_delete(
        tx: &mut dyn Transaction,
        record: &str,
        devices: &str,
        client_id: &str,
        token: &str,
    ) -> Result<bool> {
        let current = tx.hget(devices, client_id).await?;
        let mut batch = Batch::new();
        batch.atomic().del(record);
        if current.as_deref() == Some(token) {
            batch.hdel(devices, client_id);
        }
        tx.commit(batch).await
    }

    /// 删除用户所有设备的 token（"退出所有设备"），返回删除的条目数
    pub async fn delete_all_for_user(&self, uid: &str) -> Result<usize> {
        require_uid(uid)?;
        let ctx = |e: TokenError| e.context(format!("delete_all_for_user uid={}", uid));

        let devices = devices_key(uid);
        let registry = self.backend.hgetall(&devices).await.map_err(ctx)?;
        if registry.is_empty() {
            return Ok(0);
        }

        let mut batch = Batch::new();
        batch.atomic();
        for (client_id, token) in &registry {
            batch.del(record_key(token)).hdel(&devices, client_id);
        }
        self.backend.execute(batch).await.map_err(ctx)?;

        info!(uid = %uid, count = registry.len(), "🗑️ 删除用户全部 token");
        metrics::record_deleted(registry.len() as u64);
        Ok(registry.len())
    }

    /// 删除用户某个设备的 token（"踢下线"）；设备不存在时返回 false
    pub async fn delete_client_for_user(&self, uid: &str, client_id: &str) -> Result<bool> {
        require_uid(uid)?;
        if client_id.is_empty() {
            return Err(TokenError::invalid("clientId is empty"));
        }
        let ctx = |e: TokenError| {
            e.context(format!(
                "delete_client_for_user uid={} client_id={}",
                uid, client_id
            ))
        };

        let devices = devices_key(uid);
        let Some(token) = self
            .backend
            .hget(&devices, client_id)
            .await
            .map_err(ctx)?
        else {
            return Ok(false);
        };

        let mut batch = Batch::new();
        batch
            .atomic()
            .del(record_key(&token))
            .hdel(&devices, client_id);
        self.backend.execute(batch).await.map_err(ctx)?;

        info!(uid = %uid, client_id = %client_id, token = short(&token), "🗑️ 删除设备 token");
        metrics::record_deleted(1);
        Ok(true)
    }

    // ============================================================
    // 按用户查询
    // ============================================================

    /// 查找设备当前的 token；条目失效时顺带清理
    pub async fn find_by_user_client(&self, uid: &str, client_id: &str) -> Result<Option<String>> {
        require_uid(uid)?;
        if client_id.is_empty() {
            return Err(TokenError::invalid("clientId is empty"));
        }
        let ctx = |e: TokenError| {
            e.context(format!(
                "find_by_user_client uid={} client_id={}",
                uid, client_id
            ))
        };

        self.evict_if_needed(uid).await.map_err(ctx)?;

        let devices = devices_key(uid);
        let Some(token) = self
            .backend
            .hget(&devices, client_id)
            .await
            .map_err(ctx)?
        else {
            return Ok(None);
        };

        if self
            .backend
            .exists(&record_key(&token))
            .await
            .map_err(ctx)?
        {
            return Ok(Some(token));
        }

        self.drop_stale_entries(uid, &[(client_id.to_string(), token)])
            .await;
        Ok(None)
    }

    /// 用户所有存活设备的 (clientId, token)，按 clientId 排序
    pub async fn find_devices(&self, uid: &str) -> Result<Vec<(String, String)>> {
        require_uid(uid)?;
        let ctx = |e: TokenError| e.context(format!("find_devices uid={}", uid));

        self.evict_if_needed(uid).await.map_err(ctx)?;

        let registry = self
            .backend
            .hgetall(&devices_key(uid))
            .await
            .map_err(ctx)?;
        let mut entries: Vec<(String, String)> = registry.into_iter().collect();
        entries.sort();

        let keys: Vec<String> = entries.iter().map(|(_, token)| record_key(token)).collect();
        let alive = self.backend.exists_many(&keys).await.map_err(ctx)?;

        let (live, stale): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .zip(alive)
            .partition(|(_, alive)| *alive);
        let live: Vec<(String, String)> = live.into_iter().map(|(entry, _)| entry).collect();
        let stale: Vec<(String, String)> = stale.into_iter().map(|(entry, _)| entry).collect();

        if !stale.is_empty() {
            self.drop_stale_entries(uid, &stale).await;
        }
        Ok(live)
    }

    /// 用户所有存活的 token
    pub async fn find_all_for_user(&self, uid: &str) -> Result<Vec<String>> {
        Ok(self
            .find_devices(uid)
            .await?
            .into_iter()
            .map(|(_, token)| token)
            .collect())
    }

    /// 尽力清理失效条目：只删除仍指向失效 token 的条目，失败只记日志
    async fn drop_stale_entries(&self, uid: &str, stale: &[(String, String)]) {
        let devices = devices_key(uid);
        let mut tx = match self.backend.watch(slice::from_ref(&devices)).await {
            Ok(tx) => tx,
            Err(e) => {
                warn!(uid = %uid, "清理失效设备条目失败: {}", e);
                return;
            }
        };
        let result = Self::try_drop_stale(tx.as_mut(), &devices, stale).await;
        match finish(tx.as_mut(), result).await {
            Ok(Some(0)) => {}
            Ok(Some(n)) => debug!(uid = %uid, count = n, "🧹 清理失效设备条目"),
            Ok(None) => debug!(uid = %uid, "注册表并发修改，跳过失效条目清理"),
            Err(e) => warn!(uid = %uid, "清理失效设备条目失败: {}", e),
        }
    }

    async fn try_drop_stale(
        tx: &mut dyn Transaction,
        devices: &str,
        stale: &[(String, String)],
    ) -> Result<Option<usize>> {
        let mut batch = Batch::new();
        batch.atomic();
        let mut count = 0;
        for (client_id, token) in stale {
            if tx.hget(devices, client_id).await?.as_deref() == Some(token.as_str()) {
                batch.hdel(devices, client_id);
                count += 1;
            }
        }
        if batch.is_empty() {
            tx.discard().await?;
            return Ok(Some(0));
        }
        Ok(tx.commit(batch).await?.then_some(count))
    }

    // ============================================================
    // 设备淘汰
    // ============================================================

    /// 注册表达到上限时执行淘汰
    pub async fn evict_if_needed(&self, uid: &str) -> Result<EvictionOutcome> {
        let len = self
            .backend
            .hlen(&devices_key(uid))
            .await
            .map_err(|e| e.context(format!("evict uid={}", uid)))?;
        if !self.policy.should_evict(len) {
            return Ok(EvictionOutcome::Skipped);
        }
        self.evict(uid).await
    }

    /// 淘汰最久未活跃的设备直到剩余 `min` 个
    ///
    /// 整个读-算-写在 WATCH `devices:<uid>` 的事务中完成；冲突时重试一次，
    /// 仍冲突则放弃，由下一次触发淘汰的操作继续。
    pub async fn evict(&self, uid: &str) -> Result<EvictionOutcome> {
        let ctx = |e: TokenError| e.context(format!("evict uid={}", uid));
        let devices = devices_key(uid);

        for attempt in 1..=EVICTION_ATTEMPTS {
            let mut tx = self
                .backend
                .watch(slice::from_ref(&devices))
                .await
                .map_err(ctx)?;
            let result = self.try_evict(tx.as_mut(), &devices).await;
            match finish(tx.as_mut(), result).await.map_err(ctx)? {
                Some(0) => return Ok(EvictionOutcome::Skipped),
                Some(n) => {
                    info!(uid = %uid, evicted = n, "🔻 淘汰不活跃设备");
                    metrics::record_evicted(n as u64);
                    return Ok(EvictionOutcome::Evicted(n));
                }
                None => {
                    debug!(uid = %uid, attempt, "淘汰事务冲突");
                    metrics::record_eviction_conflict();
                }
            }
        }

        warn!(
            uid = %uid,
            attempts = EVICTION_ATTEMPTS,
            "⚠️ 设备淘汰持续冲突，本次放弃"
        );
        metrics::record_eviction_abandoned();
        Ok(EvictionOutcome::Abandoned)
    }

    /// 返回 `Some(n)` 表示已提交（n 为淘汰数），`None` 表示事务冲突
    async fn try_evict(&self, tx: &mut dyn Transaction, devices: &str) -> Result<Option<usize>> {
        let registry = tx.hgetall(devices).await?;
        // 触发检查之后注册表可能已变小
        if !self.policy.should_evict(registry.len()) {
            tx.discard().await?;
            return Ok(Some(0));
        }

        let entries: Vec<(String, String)> = registry.into_iter().collect();
        let keys: Vec<String> = entries.iter().map(|(_, token)| record_key(token)).collect();
        let times = tx.hget_many(&keys, FIELD_LATEST_TIME).await?;

        let entries = entries
            .into_iter()
            .zip(times)
            .map(|((client_id, token), time)| RegistryEntry {
                client_id,
                token,
                latest_time: time.map(|t| t.parse().unwrap_or(0)),
            })
            .collect();

        let victims = self.policy.plan(entries);
        let mut batch = Batch::new();
        batch.atomic();
        for victim in &victims {
            batch
                .del(record_key(&victim.token))
                .hdel(devices, &victim.client_id);
        }
        Ok(tx.commit(batch).await?.then_some(victims.len()))
    }
}
