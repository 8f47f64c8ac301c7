use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::auth::{AuthProvider, Credentials};
use crate::error::GuardianClientError;
use crate::probe::HealthTransport;
use crate::recorder::{MetricsSource, SyntheticMetrics};
use crate::session::{AuthEvent, Session, UserIdentity};
use crate::store::{ConfigRow, MemoryStore, NewVoipTest, RecordStore, TestResults, VoipTestRecord};

/// テスト用のヘルスチェックトランスポート
/// - 固定ステータスを返す
/// - 呼び出しの記録とカウント
/// - オプションの失敗注入
pub struct MockHealthTransport {
    status: u16,
    calls: Mutex<Vec<(String, String)>>,
    call_count: AtomicUsize,
    should_fail: AtomicBool,
}

impl MockHealthTransport {
    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            calls: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
            should_fail: AtomicBool::new(false),
        }
    }

    /// should_fail フラグを設定する
    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::Relaxed);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// (url, bearer_token) の記録
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

impl HealthTransport for MockHealthTransport {
    fn get_status<'a>(
        &'a self,
        url: &'a str,
        bearer_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<u16, GuardianClientError>> + Send + 'a>> {
        Box::pin(async move {
            self.call_count.fetch_add(1, Ordering::Relaxed);
            self.calls
                .lock()
                .unwrap()
                .push((url.to_string(), bearer_token.to_string()));
            if self.should_fail.load(Ordering::Relaxed) {
                return Err(GuardianClientError::Connectivity("mock failure".to_string()));
            }
            Ok(self.status)
        })
    }
}

/// 失敗注入可能な RecordStore（成功時は MemoryStore に委譲）
pub struct FailingStore {
    inner: MemoryStore,
    should_fail: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            should_fail: AtomicBool::new(false),
        }
    }

    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::Relaxed);
    }

    fn check(&self) -> Result<(), GuardianClientError> {
        if self.should_fail.load(Ordering::Relaxed) {
            Err(GuardianClientError::Persistence("mock failure".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for FailingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore for FailingStore {
    fn insert_test<'a>(
        &'a self,
        user: &'a UserIdentity,
        test: NewVoipTest,
    ) -> Pin<Box<dyn Future<Output = Result<VoipTestRecord, GuardianClientError>> + Send + 'a>> {
        Box::pin(async move {
            self.check()?;
            self.inner.insert_test(user, test).await
        })
    }

    fn recent_tests<'a>(
        &'a self,
        user: &'a UserIdentity,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<VoipTestRecord>, GuardianClientError>> + Send + 'a>> {
        Box::pin(async move {
            self.check()?;
            self.inner.recent_tests(user, limit).await
        })
    }

    fn upsert_config<'a>(
        &'a self,
        user: &'a UserIdentity,
        row: ConfigRow,
    ) -> Pin<Box<dyn Future<Output = Result<(), GuardianClientError>> + Send + 'a>> {
        Box::pin(async move {
            self.check()?;
            self.inner.upsert_config(user, row).await
        })
    }
}

/// release() されるまで測定を完了しない MetricsSource
pub struct GatedMetrics {
    gate: Notify,
    inner: SyntheticMetrics,
}

impl GatedMetrics {
    pub fn new() -> Self {
        Self {
            gate: Notify::new(),
            inner: SyntheticMetrics::with_seed(0),
        }
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }
}

impl Default for GatedMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for GatedMetrics {
    fn measure<'a>(
        &'a self,
        _sip_server: &'a str,
        _extension: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TestResults, GuardianClientError>> + Send + 'a>> {
        Box::pin(async move {
            self.gate.notified().await;
            Ok(self.inner.sample())
        })
    }
}

/// 固定結果を返す AuthProvider
pub struct StaticAuthProvider {
    user_id: Option<String>,
    approved: bool,
}

impl StaticAuthProvider {
    pub fn approved(user_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            approved: true,
        }
    }

    pub fn pending(user_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            approved: false,
        }
    }

    pub fn rejecting() -> Self {
        Self {
            user_id: None,
            approved: false,
        }
    }
}

impl AuthProvider for StaticAuthProvider {
    fn sign_in<'a>(
        &'a self,
        credentials: &'a Credentials,
    ) -> Pin<Box<dyn Future<Output = Result<UserIdentity, GuardianClientError>> + Send + 'a>> {
        Box::pin(async move {
            match &self.user_id {
                Some(id) => Ok(test_user(id, &credentials.email)),
                None => Err(GuardianClientError::AuthenticationFailed(
                    "invalid login credentials".to_string(),
                )),
            }
        })
    }

    fn is_approved<'a>(
        &'a self,
        _user: &'a UserIdentity,
    ) -> Pin<Box<dyn Future<Output = Result<bool, GuardianClientError>> + Send + 'a>> {
        Box::pin(async move { Ok(self.approved) })
    }
}

fn test_user(id: &str, email: &str) -> UserIdentity {
    UserIdentity {
        id: id.to_string(),
        email: email.to_string(),
        access_token: format!("jwt-{}", id),
    }
}

/// 承認済みユーザでサインイン済みのセッション
pub fn signed_in_session(user_id: &str) -> Session {
    let mut session = Session::new();
    session.apply(AuthEvent::SignInStarted);
    session.apply(AuthEvent::SignedIn {
        user: test_user(user_id, &format!("{}@example.com", user_id)),
        approved: true,
    });
    session
}

/// 固定レスポンスを返すローカルHTTPサーバ
///
/// レスポンスは順番に返し、尽きたら最後のものを繰り返す。
/// 受信したリクエスト（ヘッダ + ボディ）を記録する。
pub struct HttpStub {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl HttpStub {
    /// 空ボディで固定ステータスを返す
    pub async fn start(status: u16) -> Self {
        Self::with_responses(vec![(status, String::new())]).await
    }

    pub async fn with_responses(responses: Vec<(u16, String)>) -> Self {
        assert!(!responses.is_empty(), "HttpStub needs at least one response");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = requests.clone();

        let handle = tokio::spawn(async move {
            let mut served = 0usize;
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let request = match read_request(&mut socket).await {
                    Some(request) => request,
                    None => continue,
                };
                recorded.lock().unwrap().push(request);

                let (status, body) = &responses[served.min(responses.len() - 1)];
                served += 1;
                let response = format!(
                    "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        Self {
            addr,
            requests,
            handle,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for HttpStub {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn read_request(socket: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    Some(String::from_utf8_lossy(&buf).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_health_transport_records_calls() {
        let transport = MockHealthTransport::with_status(204);
        let status = transport.get_status("https://h.test/api/health", "tok").await.unwrap();
        assert_eq!(status, 204);
        assert_eq!(transport.call_count(), 1);
        assert_eq!(
            transport.calls(),
            vec![("https://h.test/api/health".to_string(), "tok".to_string())]
        );
    }

    #[tokio::test]
    async fn mock_health_transport_failure_injection() {
        let transport = MockHealthTransport::with_status(200);
        transport.set_should_fail(true);
        let result = transport.get_status("https://h.test/api/health", "tok").await;
        assert!(matches!(result, Err(GuardianClientError::Connectivity(_))));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn failing_store_toggles() {
        let store = FailingStore::new();
        let user = test_user("u1", "u1@example.com");
        assert!(store.recent_tests(&user, 10).await.is_ok());
        store.set_should_fail(true);
        assert!(matches!(
            store.recent_tests(&user, 10).await,
            Err(GuardianClientError::Persistence(_))
        ));
    }

    #[test]
    fn signed_in_session_is_approved() {
        let session = signed_in_session("u7");
        assert!(session.is_approved());
        assert_eq!(session.require_user().unwrap().id, "u7");
    }

    #[tokio::test]
    async fn http_stub_serves_responses_in_order() {
        let stub = HttpStub::with_responses(vec![
            (200, "first".to_string()),
            (404, "second".to_string()),
        ])
        .await;
        let client = reqwest::Client::new();

        let a = client.get(format!("{}/a", stub.base_url())).send().await.unwrap();
        assert_eq!(a.status().as_u16(), 200);
        assert_eq!(a.text().await.unwrap(), "first");

        let b = client.get(format!("{}/b", stub.base_url())).send().await.unwrap();
        assert_eq!(b.status().as_u16(), 404);

        let c = client.get(format!("{}/c", stub.base_url())).send().await.unwrap();
        assert_eq!(c.status().as_u16(), 404);

        let requests = stub.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests[0].starts_with("GET /a "));
    }
}
