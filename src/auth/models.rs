use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Result, TokenError};

/// Session 记录字段名（存储为 hash 字段）
pub const FIELD_UID: &str = "uid";
pub const FIELD_CLIENT_ID: &str = "clientId";
pub const FIELD_SESSION: &str = "session";
pub const FIELD_LATEST_TIME: &str = "latestTime";

/// Session 记录 key：`record:<token>`
pub fn record_key(token: &str) -> String {
    format!("record:{}", token)
}

/// 设备注册表 key：`devices:<uid>`，字段为 clientId，值为 token
pub fn devices_key(uid: &str) -> String {
    format!("devices:{}", uid)
}

/// Session 记录
///
/// 一个 token 对应一条记录。`latest_time` 精确到秒，含义由调用方决定
/// （最近登录时间、最近心跳时间等）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionValue {
    pub uid: String,
    pub client_id: String,
    /// 调用方自定义的会话数据，可以为空
    pub session: String,
    pub latest_time: DateTime<Utc>,
}

/// 截断到秒
fn truncate_to_secs(time: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(time.timestamp(), 0).unwrap_or_default()
}

impl SessionValue {
    /// 以当前时间作为 `latest_time` 创建记录
    pub fn new(uid: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            client_id: client_id.into(),
            session: String::new(),
            latest_time: truncate_to_secs(Utc::now()),
        }
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = session.into();
        self
    }

    pub fn with_latest_time(mut self, time: DateTime<Utc>) -> Self {
        self.latest_time = truncate_to_secs(time);
        self
    }

    /// 创建类操作的前置条件：uid 与 clientId 非空
    pub fn validate(&self) -> Result<()> {
        if self.uid.is_empty() {
            return Err(TokenError::invalid("uid is empty"));
        }
        if self.client_id.is_empty() {
            return Err(TokenError::invalid("clientId is empty"));
        }
        Ok(())
    }

    /// 编码为 hash 字段
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            (FIELD_UID.to_string(), self.uid.clone()),
            (FIELD_CLIENT_ID.to_string(), self.client_id.clone()),
            (FIELD_SESSION.to_string(), self.session.clone()),
            (
                FIELD_LATEST_TIME.to_string(),
                self.latest_time.timestamp().to_string(),
            ),
        ]
    }

    /// 从 hash 字段解码
    ///
    /// 时间戳缺失或无法解析时解码为 0（UNIX 纪元），不报错。
    pub fn from_fields(fields: &HashMap<String, String>) -> Self {
        let field = |name: &str| fields.get(name).cloned().unwrap_or_default();
        let latest_time = fields
            .get(FIELD_LATEST_TIME)
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or_default();

        Self {
            uid: field(FIELD_UID),
            client_id: field(FIELD_CLIENT_ID),
            session: field(FIELD_SESSION),
            latest_time,
        }
    }
}
