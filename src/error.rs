//! 错误类型
//!
//! 适配器层统一返回 [`ApiError`]，核心层据此分类决定是否重试。

use crate::auth::Tenant;
use serde::{Deserialize, Serialize};

/// 错误分类，用于重试决策和审计记录
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 429 限流
    RateLimited,
    /// 5xx、连接失败、超时
    ServerUnavailable,
    /// 401，凭据过期
    ExpiredCredential,
    BadRequest,
    NotFound,
    PermissionDenied,
    /// 凭据已失效且刷新失败，本次运行内不可恢复
    Credential,
    /// 重命名后仍然重名
    NameCollision,
    Unknown,
}

/// 重试层看到的分类结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Retryable,
    Fatal,
    /// 重试一次后按 Fatal 处理
    Unknown,
}

impl ErrorKind {
    pub fn classification(self) -> Classification {
        match self {
            ErrorKind::RateLimited | ErrorKind::ServerUnavailable | ErrorKind::ExpiredCredential => {
                Classification::Retryable
            }
            ErrorKind::Unknown => Classification::Unknown,
            _ => Classification::Fatal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ServerUnavailable => "server_unavailable",
            ErrorKind::ExpiredCredential => "expired_credential",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::NotFound => "not_found",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::Credential => "credential",
            ErrorKind::NameCollision => "name_collision",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 凭据错误（获取或刷新 token 失败）
#[derive(Debug, Clone, thiserror::Error)]
#[error("{tenant} 凭据不可用: {message}")]
pub struct CredentialError {
    pub tenant: Tenant,
    pub message: String,
}

/// 配置错误，在处理任何记录之前终止运行
#[derive(Debug, Clone, thiserror::Error)]
#[error("配置错误: {0}")]
pub struct ConfigError(pub String);

/// 外部调用的原始失败
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{tenant} 返回 HTTP {status}: {message}")]
    Status {
        tenant: Tenant,
        status: u16,
        message: String,
    },

    #[error("请求失败: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("响应解析失败: {0}")]
    Decode(String),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("资源不存在: {0}")]
    NotFound(String),
}

impl ApiError {
    /// 默认分类器
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Status { status, .. } => match *status {
                429 => ErrorKind::RateLimited,
                401 => ErrorKind::ExpiredCredential,
                400 | 422 => ErrorKind::BadRequest,
                403 => ErrorKind::PermissionDenied,
                404 => ErrorKind::NotFound,
                500..=599 => ErrorKind::ServerUnavailable,
                _ => ErrorKind::Unknown,
            },
            ApiError::Transport(e) if e.is_timeout() || e.is_connect() => {
                ErrorKind::ServerUnavailable
            }
            ApiError::Transport(_) => ErrorKind::Unknown,
            ApiError::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::NotFound,
                std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
                std::io::ErrorKind::AlreadyExists => ErrorKind::NameCollision,
                _ => ErrorKind::Unknown,
            },
            ApiError::Decode(_) => ErrorKind::Unknown,
            ApiError::Credential(_) => ErrorKind::Credential,
            ApiError::NotFound(_) => ErrorKind::NotFound,
        }
    }

    /// 出错调用所属租户（用于凭据刷新）
    pub fn tenant(&self) -> Option<Tenant> {
        match self {
            ApiError::Status { tenant, .. } => Some(*tenant),
            ApiError::Credential(e) => Some(e.tenant),
            _ => None,
        }
    }

    pub fn status(tenant: Tenant, status: u16, message: impl Into<String>) -> Self {
        ApiError::Status {
            tenant,
            status,
            message: message.into(),
        }
    }
}
