// Remote store module - row models and the RecordStore seam
//
// The hosted database is treated as an opaque row store: insert with a
// generated id, select by owner with order + limit, upsert by composite key.

pub mod rest;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

use crate::error::GuardianClientError;
use crate::session::UserIdentity;

pub use rest::RestStore;

/// テスト記録の status は常にこの値
pub const STATUS_COMPLETED: &str = "completed";

/// system_configs 上のデスクトップクライアント設定キー
pub const DESKTOP_CONFIG_KEY: &str = "desktop_client_config";

/// VoIP品質テストの測定値
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResults {
    pub connectivity: bool,
    pub latency: u32,
    pub jitter: u32,
    pub packet_loss: u32,
    pub quality_score: u32,
}

/// voip_tests への挿入ペイロード
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewVoipTest {
    pub extension: String,
    pub sip_server: String,
    pub status: String,
    pub test_results: TestResults,
    pub created_by: String,
}

/// voip_tests の行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoipTestRecord {
    pub id: String,
    pub extension: String,
    pub sip_server: String,
    pub status: String,
    pub test_results: TestResults,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub ai_analysis: Option<String>,
}

/// system_configs の行（キーは user_id + config_key）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRow {
    pub user_id: String,
    pub config_key: String,
    pub config_value: Option<String>,
}

/// リモートの行ストア
pub trait RecordStore: Send + Sync {
    /// テスト記録を挿入し、id と created_at が採番された行を返す
    fn insert_test<'a>(
        &'a self,
        user: &'a UserIdentity,
        test: NewVoipTest,
    ) -> Pin<Box<dyn Future<Output = Result<VoipTestRecord, GuardianClientError>> + Send + 'a>>;

    /// created_by = user.id の記録を新しい順に最大 limit 件返す
    fn recent_tests<'a>(
        &'a self,
        user: &'a UserIdentity,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<VoipTestRecord>, GuardianClientError>> + Send + 'a>>;

    /// (user_id, config_key) で設定行を upsert する
    fn upsert_config<'a>(
        &'a self,
        user: &'a UserIdentity,
        row: ConfigRow,
    ) -> Pin<Box<dyn Future<Output = Result<(), GuardianClientError>> + Send + 'a>>;
}

/// プロセス内ストア
///
/// created_at が同値の場合は後から挿入した行を新しいものとして扱う。
#[derive(Debug, Default)]
pub struct MemoryStore {
    tests: DashMap<String, Vec<VoipTestRecord>>,
    configs: DashMap<(String, String), ConfigRow>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定ユーザの記録件数
    pub fn test_count(&self, owner: &str) -> usize {
        self.tests.get(owner).map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn config(&self, user_id: &str, config_key: &str) -> Option<ConfigRow> {
        self.configs
            .get(&(user_id.to_string(), config_key.to_string()))
            .map(|row| row.clone())
    }
}

impl RecordStore for MemoryStore {
    fn insert_test<'a>(
        &'a self,
        _user: &'a UserIdentity,
        test: NewVoipTest,
    ) -> Pin<Box<dyn Future<Output = Result<VoipTestRecord, GuardianClientError>> + Send + 'a>> {
        Box::pin(async move {
            let record = VoipTestRecord {
                id: uuid::Uuid::new_v4().to_string(),
                extension: test.extension,
                sip_server: test.sip_server,
                status: test.status,
                test_results: test.test_results,
                created_by: Some(test.created_by.clone()),
                created_at: Utc::now(),
                ai_analysis: None,
            };
            self.tests
                .entry(test.created_by)
                .or_default()
                .push(record.clone());
            Ok(record)
        })
    }

    fn recent_tests<'a>(
        &'a self,
        user: &'a UserIdentity,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<VoipTestRecord>, GuardianClientError>> + Send + 'a>> {
        Box::pin(async move {
            let mut rows: Vec<VoipTestRecord> = match self.tests.get(&user.id) {
                Some(rows) => rows.iter().rev().cloned().collect(),
                None => return Ok(Vec::new()),
            };
            // stable sort keeps later inserts first among equal timestamps
            rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            rows.truncate(limit);
            Ok(rows)
        })
    }

    fn upsert_config<'a>(
        &'a self,
        _user: &'a UserIdentity,
        row: ConfigRow,
    ) -> Pin<Box<dyn Future<Output = Result<(), GuardianClientError>> + Send + 'a>> {
        Box::pin(async move {
            self.configs
                .insert((row.user_id.clone(), row.config_key.clone()), row);
            Ok(())
        })
    }
}
