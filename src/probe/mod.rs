// Connectivity prober module
//
// Maps one authenticated GET against `{server_url}/api/health` onto a
// ConnectionState. No retries, no backoff.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::config::ClientConfig;
use crate::error::GuardianClientError;

/// 接続状態（プローブ毎に再計算され、永続化はされない）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        }
    }

    pub fn is_connected(&self) -> bool {
        *self == ConnectionState::Connected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// ヘルスエンドポイントへのHTTPアクセスを抽象化するトレイト
///
/// 成功時はHTTPステータスコードを返す。トランスポート層の失敗は `Connectivity` エラー。
pub trait HealthTransport: Send + Sync {
    fn get_status<'a>(
        &'a self,
        url: &'a str,
        bearer_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<u16, GuardianClientError>> + Send + 'a>>;
}

/// reqwest によるヘルスチェック実装
///
/// リダイレクトは追跡し、最終レスポンスのステータスで判定する。
#[derive(Debug, Clone, Default)]
pub struct HttpHealthTransport {
    client: reqwest::Client,
}

impl HttpHealthTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl HealthTransport for HttpHealthTransport {
    fn get_status<'a>(
        &'a self,
        url: &'a str,
        bearer_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<u16, GuardianClientError>> + Send + 'a>> {
        Box::pin(async move {
            let response = self
                .client
                .get(url)
                .bearer_auth(bearer_token)
                .send()
                .await
                .map_err(|e| GuardianClientError::Connectivity(format!("GET {} failed: {}", url, e)))?;
            Ok(response.status().as_u16())
        })
    }
}

/// `{server_url}/api/health` を組み立てる（末尾の `/` は重複させない）
pub fn health_url(server_url: &str) -> String {
    format!("{}/api/health", server_url.trim_end_matches('/'))
}

/// 接続確認を行うプローバ
#[derive(Clone)]
pub struct Prober {
    transport: Arc<dyn HealthTransport>,
}

impl Prober {
    pub fn new(transport: Arc<dyn HealthTransport>) -> Self {
        Self { transport }
    }

    /// reqwest のデフォルトクライアントを使うプローバ
    pub fn http() -> Self {
        Self::new(Arc::new(HttpHealthTransport::default()))
    }

    /// ヘルスエンドポイントへ1回だけ問い合わせ、失敗理由をエラーとして返す
    pub async fn check(&self, config: &ClientConfig) -> Result<(), GuardianClientError> {
        if !config.has_server_credentials() {
            return Err(GuardianClientError::Connectivity(
                "server_url and access_token must be configured".to_string(),
            ));
        }

        let url = health_url(&config.server_url);
        let status = self.transport.get_status(&url, &config.access_token).await?;
        if (200..300).contains(&status) {
            Ok(())
        } else {
            Err(GuardianClientError::Connectivity(format!(
                "health endpoint returned HTTP {}",
                status
            )))
        }
    }

    /// 接続状態を判定する
    ///
    /// 資格情報が未設定ならネットワークアクセスせずに `Disconnected`。
    pub async fn probe(&self, config: &ClientConfig) -> ConnectionState {
        if !config.has_server_credentials() {
            tracing::debug!("server_url or access_token empty, skipping health probe");
            return ConnectionState::Disconnected;
        }

        match self.check(config).await {
            Ok(()) => {
                tracing::info!(server_url = %config.server_url, "health probe succeeded");
                ConnectionState::Connected
            }
            Err(e) => {
                tracing::warn!(server_url = %config.server_url, error = %e, "health probe failed");
                ConnectionState::Error
            }
        }
    }
}
