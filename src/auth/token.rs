use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use tracing::debug;

use super::models::SessionValue;
use super::token_store::TokenStore;
use crate::error::Result;

/// token 所属用户
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserIdentity {
    /// 尚未读取 Session 记录
    Unresolved,
    Resolved(String),
}

/// 面向调用方的 token 句柄
///
/// 除了已解析的用户和读到的 Session 记录外不持有任何状态，
/// 所有存储操作都委托给 [`TokenStore`]。
pub struct Token {
    store: TokenStore,
    id: String,
    identity: UserIdentity,
    value: Option<SessionValue>,
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("value", &self.value)
            .finish()
    }
}

impl Token {
    /// 登录成功：签发新 token，覆盖该设备已有的 token
    pub async fn new_session(store: &TokenStore, value: SessionValue) -> Result<Self> {
        let id = store.create(&value).await?;
        Ok(Self {
            store: store.clone(),
            id,
            identity: UserIdentity::Resolved(value.uid.clone()),
            value: Some(value),
        })
    }

    /// 登录成功：该设备已有有效 token 时复用，否则签发新 token
    ///
    /// 复用时 Session 记录是胜者写入的，这里不缓存 `value`。
    pub async fn new_session_or_reuse(store: &TokenStore, value: SessionValue) -> Result<Self> {
        let id = store.create_or_reuse(&value).await?;
        Ok(Self {
            store: store.clone(),
            id,
            identity: UserIdentity::Resolved(value.uid),
            value: None,
        })
    }

    /// 从客户端提交的 token 恢复，不访问存储
    pub fn resume_from(store: &TokenStore, id: impl Into<String>) -> Self {
        Self {
            store: store.clone(),
            id: id.into(),
            identity: UserIdentity::Unresolved,
            value: None,
        }
    }

    /// 按 (uid, clientId) 查找当前 token
    pub async fn resume_from_user_client(
        store: &TokenStore,
        uid: &str,
        client_id: &str,
    ) -> Result<Option<Self>> {
        let id = store.find_by_user_client(uid, client_id).await?;
        Ok(id.map(|id| Self {
            store: store.clone(),
            id,
            identity: UserIdentity::Resolved(uid.to_string()),
            value: None,
        }))
    }

    /// 用户所有存活的 token
    pub async fn all_for_user(store: &TokenStore, uid: &str) -> Result<Vec<Self>> {
        let ids = store.find_all_for_user(uid).await?;
        Ok(ids
            .into_iter()
            .map(|id| Self {
                store: store.clone(),
                id,
                identity: UserIdentity::Resolved(uid.to_string()),
                value: None,
            })
            .collect())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    pub async fn is_valid(&self) -> Result<bool> {
        self.store.exists(&self.id).await
    }

    /// 所属用户；token 不存在时返回 `None`。成功读取后不再访问存储
    pub async fn user_id(&mut self) -> Result<Option<String>> {
        if let UserIdentity::Resolved(uid) = &self.identity {
            return Ok(Some(uid.clone()));
        }
        Ok(self.value().await?.map(|v| v.uid.clone()))
    }

    /// Session 记录，首次调用时读取并缓存
    pub async fn value(&mut self) -> Result<Option<&SessionValue>> {
        if self.value.is_none() {
            match self.store.resume(&self.id).await? {
                Some(value) => {
                    self.identity = UserIdentity::Resolved(value.uid.clone());
                    self.value = Some(value);
                }
                None => return Ok(None),
            }
        }
        Ok(self.value.as_ref())
    }

    pub async fn refresh_ttl(&self, ttl: Option<Duration>) -> Result<bool> {
        self.store.refresh_ttl(&self.id, ttl).await
    }

    pub async fn remaining_ttl(&self) -> Result<Option<Duration>> {
        self.store.remaining_ttl(&self.id).await
    }

    /// 心跳：更新最近活跃时间并续满 TTL
    pub async fn heartbeat(&mut self, at: DateTime<Utc>) -> Result<bool> {
        let touched = self.store.touch(&self.id, at).await?;
        if !touched {
            self.value = None;
        } else if let Some(value) = self.value.take() {
            self.value = Some(value.with_latest_time(at));
        }
        Ok(touched)
    }

    /// 退出登录，幂等
    pub async fn logout(&mut self) -> Result<bool> {
        debug!(uid = ?self.identity, "退出登录");
        self.value = None;
        self.store.delete(&self.id).await
    }
}
