// VoIP test recorder module
//
// Invariants: one run at a time, validation before any record is created,
// cache holds at most HISTORY_LIMIT records newest first.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::ClientConfig;
use crate::error::GuardianClientError;
use crate::session::Session;
use crate::store::{NewVoipTest, RecordStore, TestResults, VoipTestRecord, STATUS_COMPLETED};

/// キャッシュ・履歴取得の上限件数
pub const HISTORY_LIMIT: usize = 10;

/// 測定値の供給元
///
/// 実際のSIP/RTP計測に差し替えられるよう、呼び出し側はこのトレイトにのみ依存する。
pub trait MetricsSource: Send + Sync {
    fn measure<'a>(
        &'a self,
        sip_server: &'a str,
        extension: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TestResults, GuardianClientError>> + Send + 'a>>;
}

/// 擬似乱数で測定値を埋める実装（実測ではない）
pub struct SyntheticMetrics {
    rng: Mutex<StdRng>,
}

impl std::fmt::Debug for SyntheticMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyntheticMetrics").finish_non_exhaustive()
    }
}

impl Default for SyntheticMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticMetrics {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// 再現可能な系列を生成する
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// connectivity は確率0.8で true、その他は一様分布の整数
    pub fn sample(&self) -> TestResults {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        TestResults {
            connectivity: rng.gen_bool(0.8),
            latency: rng.gen_range(10..110),
            jitter: rng.gen_range(1..11),
            packet_loss: rng.gen_range(0..5),
            quality_score: rng.gen_range(80..100),
        }
    }
}

impl MetricsSource for SyntheticMetrics {
    fn measure<'a>(
        &'a self,
        _sip_server: &'a str,
        _extension: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TestResults, GuardianClientError>> + Send + 'a>> {
        let results = self.sample();
        Box::pin(async move { Ok(results) })
    }
}

/// テスト実行フェーズ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunPhase {
    #[default]
    Idle,
    Validating,
    Running,
}

pub struct TestRecorder {
    store: Arc<dyn RecordStore>,
    metrics: Arc<dyn MetricsSource>,
    cache: Mutex<Vec<VoipTestRecord>>,
    phase: Mutex<RunPhase>,
    in_flight: AtomicBool,
}

/// 実行中フラグを保持し、drop 時に Idle へ戻す
struct RunGuard<'a> {
    recorder: &'a TestRecorder,
}

impl<'a> RunGuard<'a> {
    fn acquire(recorder: &'a TestRecorder) -> Result<Self, GuardianClientError> {
        recorder
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| GuardianClientError::Busy)?;
        Ok(Self { recorder })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.recorder.set_phase(RunPhase::Idle);
        self.recorder.in_flight.store(false, Ordering::Release);
    }
}

impl TestRecorder {
    pub fn new(store: Arc<dyn RecordStore>, metrics: Arc<dyn MetricsSource>) -> Self {
        Self {
            store,
            metrics,
            cache: Mutex::new(Vec::new()),
            phase: Mutex::new(RunPhase::Idle),
            in_flight: AtomicBool::new(false),
        }
    }

    /// 擬似乱数の測定値を使うレコーダ
    pub fn synthetic(store: Arc<dyn RecordStore>) -> Self {
        Self::new(store, Arc::new(SyntheticMetrics::new()))
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_phase(&self, phase: RunPhase) {
        *self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = phase;
    }

    /// キャッシュ済み履歴（新しい順）
    pub fn history(&self) -> Vec<VoipTestRecord> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// VoIPテストを1回実行して記録する
    ///
    /// 実行中の呼び出しは `Busy`、SIPサーバ/内線未設定は `Validation`、
    /// 未認証は `NotAuthenticated`、保存失敗は `Persistence`（キャッシュは変更しない）。
    pub async fn run_test(
        &self,
        config: &ClientConfig,
        session: &Session,
    ) -> Result<VoipTestRecord, GuardianClientError> {
        let _guard = RunGuard::acquire(self)?;

        self.set_phase(RunPhase::Validating);
        let missing = config.missing_sip_fields();
        if !missing.is_empty() {
            return Err(GuardianClientError::Validation(format!(
                "{} must be configured before running a VoIP test",
                missing.join(" and ")
            )));
        }
        let user = session.require_user()?;

        self.set_phase(RunPhase::Running);
        let test_results = self
            .metrics
            .measure(&config.sip_server, &config.extension)
            .await?;

        let new_test = NewVoipTest {
            extension: config.extension.clone(),
            sip_server: config.sip_server.clone(),
            status: STATUS_COMPLETED.to_string(),
            test_results,
            created_by: user.id.clone(),
        };

        let record = match self.store.insert_test(user, new_test).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(user_id = %user.id, error = %e, "failed to persist VoIP test");
                return Err(e);
            }
        };

        tracing::info!(
            record_id = %record.id,
            extension = %record.extension,
            quality_score = record.test_results.quality_score,
            "VoIP test recorded"
        );

        let mut cache = self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.insert(0, record.clone());
        cache.truncate(HISTORY_LIMIT);
        Ok(record)
    }

    /// 直近の履歴をストアから取得し、キャッシュを置き換える
    pub async fn load_history(
        &self,
        session: &Session,
    ) -> Result<Vec<VoipTestRecord>, GuardianClientError> {
        let user = session.require_user()?;
        let rows = self.store.recent_tests(user, HISTORY_LIMIT).await?;
        tracing::debug!(user_id = %user.id, count = rows.len(), "loaded VoIP test history");

        *self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = rows.clone();
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testutil::{signed_in_session, FailingStore, GatedMetrics};

    fn sip_config() -> ClientConfig {
        ClientConfig {
            server_url: "https://h.test".to_string(),
            access_token: "tok".to_string(),
            sip_server: "sip.example.com".to_string(),
            extension: "1001".to_string(),
            password: String::new(),
        }
    }

    fn assert_in_range(results: &TestResults) {
        assert!((10..110).contains(&results.latency), "latency {}", results.latency);
        assert!((1..11).contains(&results.jitter), "jitter {}", results.jitter);
        assert!((0..5).contains(&results.packet_loss), "packet_loss {}", results.packet_loss);
        assert!(
            (80..100).contains(&results.quality_score),
            "quality_score {}",
            results.quality_score
        );
    }

    // === SyntheticMetrics ===

    #[test]
    fn test_synthetic_connectivity_is_roughly_eighty_percent() {
        let metrics = SyntheticMetrics::with_seed(7);
        let connected = (0..10_000).filter(|_| metrics.sample().connectivity).count();
        assert!((7_500..8_500).contains(&connected), "connected {}", connected);
    }

    #[test]
    fn test_synthetic_same_seed_same_sequence() {
        let a = SyntheticMetrics::with_seed(42);
        let b = SyntheticMetrics::with_seed(42);
        for _ in 0..20 {
            assert_eq!(a.sample(), b.sample());
        }
    }

    // === run_test ===

    #[tokio::test]
    async fn test_run_test_records_and_prepends_to_cache() {
        let store = Arc::new(MemoryStore::new());
        let recorder = TestRecorder::synthetic(store.clone());
        let session = signed_in_session("u1");

        let first = recorder.run_test(&sip_config(), &session).await.unwrap();
        let second = recorder.run_test(&sip_config(), &session).await.unwrap();

        assert_eq!(first.status, "completed");
        assert_eq!(first.created_by.as_deref(), Some("u1"));
        assert_in_range(&first.test_results);
        let history = recorder.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, second.id);
        assert_eq!(history[1].id, first.id);
        assert_eq!(store.test_count("u1"), 2);
        assert_eq!(recorder.phase(), RunPhase::Idle);
    }

    #[tokio::test]
    async fn test_run_test_empty_extension_is_validation_error() {
        let store = Arc::new(MemoryStore::new());
        let recorder = TestRecorder::synthetic(store.clone());
        let session = signed_in_session("u1");
        let config = ClientConfig {
            extension: String::new(),
            ..sip_config()
        };

        let result = recorder.run_test(&config, &session).await;

        assert!(matches!(result, Err(GuardianClientError::Validation(ref m)) if m.contains("extension")));
        assert_eq!(store.test_count("u1"), 0);
        assert!(recorder.history().is_empty());
        assert_eq!(recorder.phase(), RunPhase::Idle);
    }

    #[tokio::test]
    async fn test_run_test_empty_sip_server_is_validation_error() {
        let store = Arc::new(MemoryStore::new());
        let recorder = TestRecorder::synthetic(store.clone());
        let config = ClientConfig {
            sip_server: String::new(),
            ..sip_config()
        };

        let result = recorder.run_test(&config, &signed_in_session("u1")).await;

        assert!(matches!(result, Err(GuardianClientError::Validation(ref m)) if m.contains("sip_server")));
        assert_eq!(store.test_count("u1"), 0);
    }

    #[tokio::test]
    async fn test_run_test_unauthenticated_creates_nothing() {
        let store = Arc::new(MemoryStore::new());
        let recorder = TestRecorder::synthetic(store.clone());

        let result = recorder.run_test(&sip_config(), &Session::new()).await;

        assert!(matches!(result, Err(GuardianClientError::NotAuthenticated)));
        assert!(recorder.history().is_empty());
    }

    #[tokio::test]
    async fn test_run_test_persistence_failure_keeps_cache() {
        let store = Arc::new(FailingStore::new());
        let recorder = TestRecorder::synthetic(store.clone());
        let session = signed_in_session("u1");

        recorder.run_test(&sip_config(), &session).await.unwrap();
        let before = recorder.history();

        store.set_should_fail(true);
        let result = recorder.run_test(&sip_config(), &session).await;

        assert!(matches!(result, Err(GuardianClientError::Persistence(_))));
        assert_eq!(recorder.history(), before);
        assert_eq!(recorder.phase(), RunPhase::Idle);
    }

    #[tokio::test]
    async fn test_run_test_cache_is_capped() {
        let recorder = TestRecorder::synthetic(Arc::new(MemoryStore::new()));
        let session = signed_in_session("u1");

        for _ in 0..(HISTORY_LIMIT + 3) {
            recorder.run_test(&sip_config(), &session).await.unwrap();
        }

        assert_eq!(recorder.history().len(), HISTORY_LIMIT);
    }

    #[tokio::test]
    async fn test_overlapping_run_is_rejected_as_busy() {
        let metrics = Arc::new(GatedMetrics::new());
        let store = Arc::new(MemoryStore::new());
        let recorder = TestRecorder::new(store.clone(), metrics.clone());
        let session = signed_in_session("u1");
        let config = sip_config();

        let (first, second, phase_during) = tokio::join!(
            recorder.run_test(&config, &session),
            recorder.run_test(&config, &session),
            async {
                tokio::task::yield_now().await;
                let phase = recorder.phase();
                metrics.release();
                phase
            }
        );

        assert!(first.is_ok());
        assert!(matches!(second, Err(GuardianClientError::Busy)));
        assert_eq!(phase_during, RunPhase::Running);
        assert_eq!(store.test_count("u1"), 1);
        assert_eq!(recorder.phase(), RunPhase::Idle);
    }

    #[tokio::test]
    async fn test_busy_flag_cleared_after_validation_failure() {
        let recorder = TestRecorder::synthetic(Arc::new(MemoryStore::new()));
        let session = signed_in_session("u1");

        let _ = recorder.run_test(&ClientConfig::default(), &session).await;
        let result = recorder.run_test(&sip_config(), &session).await;

        assert!(result.is_ok());
    }

    // === load_history ===

    #[tokio::test]
    async fn test_load_history_newest_first_at_most_ten() {
        let store = Arc::new(MemoryStore::new());
        let writer = TestRecorder::synthetic(store.clone());
        let session = signed_in_session("u1");
        let mut ids = Vec::new();
        for _ in 0..12 {
            ids.push(writer.run_test(&sip_config(), &session).await.unwrap().id);
        }

        let reader = TestRecorder::synthetic(store);
        let history = reader.load_history(&session).await.unwrap();

        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history[0].id, ids[11]);
        assert_eq!(history[9].id, ids[2]);
        assert_eq!(reader.history(), history);
    }

    #[tokio::test]
    async fn test_load_history_empty_is_ok() {
        let recorder = TestRecorder::synthetic(Arc::new(MemoryStore::new()));
        let history = recorder.load_history(&signed_in_session("fresh")).await.unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn test_load_history_requires_session() {
        let recorder = TestRecorder::synthetic(Arc::new(MemoryStore::new()));
        let result = recorder.load_history(&Session::new()).await;
        assert!(matches!(result, Err(GuardianClientError::NotAuthenticated)));
    }

    mod prop_tests {
        use super::super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_synthetic_samples_stay_in_range(seed in any::<u64>()) {
                let metrics = SyntheticMetrics::with_seed(seed);
                for _ in 0..50 {
                    let r = metrics.sample();
                    prop_assert!((10..110).contains(&r.latency));
                    prop_assert!((1..11).contains(&r.jitter));
                    prop_assert!((0..5).contains(&r.packet_loss));
                    prop_assert!((80..100).contains(&r.quality_score));
                }
            }
        }
    }
}
