// Desktop client facade
//
// Owns the current config and last connection state; ties the config store,
// prober and recorder together the way the desktop panel drives them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::config::{ClientConfig, ConfigStore};
use crate::error::GuardianClientError;
use crate::probe::{ConnectionState, Prober};
use crate::recorder::{MetricsSource, RunPhase, TestRecorder};
use crate::session::Session;
use crate::store::{ConfigRow, RecordStore, VoipTestRecord, DESKTOP_CONFIG_KEY};

/// システム情報
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemInfo {
    pub version: String,
    pub last_check: Option<DateTime<Utc>>,
    pub status: ConnectionState,
}

pub struct DesktopClient {
    config_store: ConfigStore,
    prober: Prober,
    store: Arc<dyn RecordStore>,
    recorder: TestRecorder,
    config: ClientConfig,
    state: ConnectionState,
    last_check: Option<DateTime<Utc>>,
}

impl DesktopClient {
    pub fn new(
        config_store: ConfigStore,
        prober: Prober,
        store: Arc<dyn RecordStore>,
        metrics: Arc<dyn MetricsSource>,
    ) -> Self {
        let recorder = TestRecorder::new(store.clone(), metrics);
        Self {
            config_store,
            prober,
            store,
            recorder,
            config: ClientConfig::default(),
            state: ConnectionState::Disconnected,
            last_check: None,
        }
    }

    /// 起動処理: 設定読み込み → 接続確認 → （認証済みなら）履歴取得
    ///
    /// 履歴取得の失敗はログのみで、起動は継続する。
    pub async fn startup(&mut self, session: &Session) -> ConnectionState {
        self.config = self.config_store.load_or_default();
        let state = self.check_connection().await;

        if session.is_authenticated() {
            if let Err(e) = self.recorder.load_history(session).await {
                tracing::warn!(error = %e, "failed to load VoIP test history at startup");
            }
        }
        state
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// 設定を保存して接続確認を行い、認証済みならリモートにも複製する
    ///
    /// リモート複製の失敗はローカル保存・接続確認の後に `Persistence` として返す。
    pub async fn save_config(
        &mut self,
        config: ClientConfig,
        session: &Session,
    ) -> Result<ConnectionState, GuardianClientError> {
        self.config_store.save(&config)?;
        self.config = config;
        let state = self.check_connection().await;

        if let Some(user) = session.user() {
            let config_value = serde_json::to_string(&self.config).map_err(|e| {
                GuardianClientError::Parse(format!("failed to serialize client config: {}", e))
            })?;
            let row = ConfigRow {
                user_id: user.id.clone(),
                config_key: DESKTOP_CONFIG_KEY.to_string(),
                config_value: Some(config_value),
            };
            if let Err(e) = self.store.upsert_config(user, row).await {
                tracing::warn!(user_id = %user.id, error = %e, "failed to mirror client config");
                return Err(e);
            }
        }
        Ok(state)
    }

    /// 現在の設定で接続確認を行う
    pub async fn check_connection(&mut self) -> ConnectionState {
        let state = self.prober.probe(&self.config).await;
        self.state = state;
        self.last_check = Some(Utc::now());
        state
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub async fn run_test(&self, session: &Session) -> Result<VoipTestRecord, GuardianClientError> {
        self.recorder.run_test(&self.config, session).await
    }

    pub async fn load_history(
        &self,
        session: &Session,
    ) -> Result<Vec<VoipTestRecord>, GuardianClientError> {
        self.recorder.load_history(session).await
    }

    pub fn history(&self) -> Vec<VoipTestRecord> {
        self.recorder.history()
    }

    pub fn test_phase(&self) -> RunPhase {
        self.recorder.phase()
    }

    pub fn system_info(&self) -> SystemInfo {
        SystemInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            last_check: self.last_check,
            status: self.state,
        }
    }
}
