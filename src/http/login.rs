use axum::response::Json;
use serde::Serialize;

use super::reqres::LoginResponse;
use crate::auth::{SessionValue, Token, TokenStore};
use crate::error::Result;

/// 登录结果，由业务登录逻辑产生并序列化为 [`LoginResponse`]
#[derive(Debug, Default)]
pub struct LoginOutcome {
    uid: String,
    token: Option<Token>,
}

impl LoginOutcome {
    /// 登录失败：响应中 uid 与 token 为空串
    pub fn failed() -> Self {
        Self::default()
    }

    /// 以已有 token 登录成功；token 已失效时按失败处理
    pub async fn succeed(mut token: Token) -> Result<Self> {
        Ok(match token.user_id().await? {
            Some(uid) => Self {
                uid,
                token: Some(token),
            },
            None => Self::failed(),
        })
    }

    /// 签发新 token，顶掉该设备上的旧会话
    pub async fn succeed_and_overwrite(store: &TokenStore, value: SessionValue) -> Result<Self> {
        let uid = value.uid.clone();
        let token = Token::new_session(store, value).await?;
        Ok(Self {
            uid,
            token: Some(token),
        })
    }

    /// 该设备已有有效 token 时沿用，否则签发新 token
    pub async fn succeed_and_set_or_use_old(
        store: &TokenStore,
        value: SessionValue,
    ) -> Result<Self> {
        let uid = value.uid.clone();
        let token = Token::new_session_or_reuse(store, value).await?;
        Ok(Self {
            uid,
            token: Some(token),
        })
    }

    pub fn is_success(&self) -> bool {
        self.token.is_some()
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn token(&self) -> Option<&Token> {
        self.token.as_ref()
    }

    pub fn into_response<T: Serialize>(self, data: T) -> Json<LoginResponse<T>> {
        Json(LoginResponse {
            token: self
                .token
                .map(|t| t.id().to_string())
                .unwrap_or_default(),
            uid: self.uid,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenConfig;
    use crate::infra::MemoryBackend;
    use std::sync::Arc;

    fn store() -> TokenStore {
        TokenStore::new(Arc::new(MemoryBackend::new()), &TokenConfig::default()).unwrap()
    }

    #[test]
    fn test_failed_login_has_empty_ids() {
        let Json(resp) = LoginOutcome::failed().into_response(serde_json::json!({}));
        assert_eq!(resp.uid, "");
        assert_eq!(resp.token, "");
    }

    #[tokio::test]
    async fn test_succeed_with_expired_token_fails() {
        let store = store();
        let token = Token::resume_from(&store, "does-not-exist");
        let outcome = LoginOutcome::succeed(token).await.unwrap();
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn test_set_or_use_old_returns_existing() {
        let store = store();
        let first = LoginOutcome::succeed_and_overwrite(&store, SessionValue::new("u1", "c1"))
            .await
            .unwrap();
        let second =
            LoginOutcome::succeed_and_set_or_use_old(&store, SessionValue::new("u1", "c1"))
                .await
                .unwrap();

        assert_eq!(second.uid(), "u1");
        assert_eq!(
            first.token().map(|t| t.id().to_string()),
            second.token().map(|t| t.id().to_string())
        );
    }
}
