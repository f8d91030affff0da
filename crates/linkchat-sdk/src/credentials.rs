//! 凭证提供者
//!
//! SDK 只读取 token 与 user_id，从不修改；每次（重新）建立连接前都会重新读取，
//! 以便宿主应用在 token 刷新后无需重建会话。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{LinkchatSDKError, Result};

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user_id: String,
    pub token: String,
}

impl Credentials {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: token.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(LinkchatSDKError::InvalidArgument("user_id 不能为空".to_string()));
        }
        if self.token.is_empty() {
            return Err(LinkchatSDKError::Auth("token 为空".to_string()));
        }
        Ok(())
    }
}

// token 不进日志
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("token", &"***")
            .finish()
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credentials(&self) -> Result<Credentials>;
}

/// 固定凭证
#[derive(Debug, Clone)]
pub struct StaticCredentials(Credentials);

impl StaticCredentials {
    pub fn new(credentials: Credentials) -> Self {
        Self(credentials)
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credentials(&self) -> Result<Credentials> {
        Ok(self.0.clone())
    }
}
