//! 凭据管理 - 按租户缓存 access token，过期或收到 401 时用 refresh token 换新

use crate::error::CredentialError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// 提前刷新的余量
const EXPIRY_MARGIN_SECS: u64 = 60;
/// 服务端未返回 expires_in 时的默认有效期
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// 租户
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tenant {
    /// 源目录所在租户
    Source,
    /// 目标目录和记录库所在租户
    Destination,
}

impl std::fmt::Display for Tenant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tenant::Source => write!(f, "source"),
            Tenant::Destination => write!(f, "destination"),
        }
    }
}

/// 凭据提供者
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// 获取有效 token，首次访问时惰性获取
    async fn get_token(&self, tenant: Tenant) -> Result<String, CredentialError>;

    /// 强制刷新 token（收到凭据过期错误时由重试层调用）
    async fn refresh(&self, tenant: Tenant) -> Result<String, CredentialError>;
}

/// OAuth 客户端配置
#[derive(Debug, Clone)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

#[derive(Debug, Default)]
struct TokenSlot {
    access_token: Option<String>,
    expires_at: Option<Instant>,
    refreshed_at: Option<Instant>,
    /// 刷新失败后记录原因，本次运行内该租户不再尝试
    poisoned: Option<String>,
}

impl TokenSlot {
    fn valid_token(&self) -> Option<&str> {
        match (&self.access_token, self.expires_at) {
            (Some(token), Some(expires_at)) if Instant::now() < expires_at => Some(token),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
    error: Option<String>,
    error_description: Option<String>,
}

/// 基于 refresh token 的进程级 token 缓存
///
/// 每个租户一把锁：同一租户的刷新串行执行，并发调用方等待正在进行的刷新，
/// 而不是各自再发一次请求。进程退出时缓存随之丢弃。
pub struct OAuthCredentials {
    http: reqwest::Client,
    token_url: String,
    clients: HashMap<Tenant, OAuthClientConfig>,
    slots: HashMap<Tenant, Mutex<TokenSlot>>,
}

impl OAuthCredentials {
    pub fn new(
        http: reqwest::Client,
        token_url: impl Into<String>,
        clients: HashMap<Tenant, OAuthClientConfig>,
    ) -> Self {
        let slots = clients
            .keys()
            .map(|tenant| (*tenant, Mutex::new(TokenSlot::default())))
            .collect();
        Self {
            http,
            token_url: token_url.into(),
            clients,
            slots,
        }
    }

    fn slot(&self, tenant: Tenant) -> Result<&Mutex<TokenSlot>, CredentialError> {
        self.slots.get(&tenant).ok_or_else(|| CredentialError {
            tenant,
            message: "未配置该租户的 OAuth 客户端".to_string(),
        })
    }

    /// 用 refresh token 换取新的 access token
    async fn fetch_token(&self, tenant: Tenant) -> Result<(String, Duration), CredentialError> {
        let fail = |message: String| CredentialError { tenant, message };

        let client = self
            .clients
            .get(&tenant)
            .ok_or_else(|| fail("未配置该租户的 OAuth 客户端".to_string()))?;

        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("refresh_token", client.refresh_token.as_str()),
                ("client_id", client.client_id.as_str()),
                ("client_secret", client.client_secret.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| fail(format!("token 请求失败: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(fail(format!("token 接口返回 HTTP {}: {}", status.as_u16(), body)));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| fail(format!("token 响应解析失败: {}", e)))?;

        if let Some(error) = body.error {
            return Err(fail(body.error_description.unwrap_or(error)));
        }

        let token = body
            .access_token
            .ok_or_else(|| fail("token 响应缺少 access_token".to_string()))?;
        let expires_in = body.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        let lifetime = Duration::from_secs(expires_in.saturating_sub(EXPIRY_MARGIN_SECS));

        Ok((token, lifetime))
    }

    async fn refill(&self, tenant: Tenant, slot: &mut TokenSlot) -> Result<String, CredentialError> {
        match self.fetch_token(tenant).await {
            Ok((token, lifetime)) => {
                let now = Instant::now();
                slot.access_token = Some(token.clone());
                slot.expires_at = Some(now + lifetime);
                slot.refreshed_at = Some(now);
                debug!("{} token 已更新，有效期 {}s", tenant, lifetime.as_secs());
                Ok(token)
            }
            Err(e) => {
                warn!("{} token 获取失败，本次运行内停用该租户: {}", tenant, e.message);
                slot.poisoned = Some(e.message.clone());
                slot.access_token = None;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl CredentialProvider for OAuthCredentials {
    async fn get_token(&self, tenant: Tenant) -> Result<String, CredentialError> {
        let mut slot = self.slot(tenant)?.lock().await;

        if let Some(reason) = &slot.poisoned {
            return Err(CredentialError {
                tenant,
                message: reason.clone(),
            });
        }

        if let Some(token) = slot.valid_token() {
            return Ok(token.to_string());
        }

        self.refill(tenant, &mut slot).await
    }

    async fn refresh(&self, tenant: Tenant) -> Result<String, CredentialError> {
        let requested_at = Instant::now();
        let mut slot = self.slot(tenant)?.lock().await;

        if let Some(reason) = &slot.poisoned {
            return Err(CredentialError {
                tenant,
                message: reason.clone(),
            });
        }

        // 等锁期间别的调用方已经刷新过，直接复用
        if let (Some(refreshed_at), Some(token)) = (slot.refreshed_at, &slot.access_token) {
            if refreshed_at > requested_at {
                debug!("{} token 刚被刷新，复用结果", tenant);
                return Ok(token.clone());
            }
        }

        info!("刷新 {} token", tenant);
        self.refill(tenant, &mut slot).await
    }
}

/// 固定 token，用于本地后端（无需鉴权）
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    token: String,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn get_token(&self, _tenant: Tenant) -> Result<String, CredentialError> {
        Ok(self.token.clone())
    }

    async fn refresh(&self, _tenant: Tenant) -> Result<String, CredentialError> {
        Ok(self.token.clone())
    }
}
