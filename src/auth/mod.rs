// Authentication module
//
// AuthHandler is the only writer of Session state. Providers perform the
// actual sign-in and approval lookup.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::config::StoreSettings;
use crate::error::GuardianClientError;
use crate::session::{AuthEvent, Session, UserIdentity};
use crate::store::rest::ensure_success;

/// profiles.status の承認済み値
pub const APPROVED_STATUS: &str = "approved";

/// サインイン資格情報
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"***")
            .finish()
    }
}

/// 認証バックエンド
pub trait AuthProvider: Send + Sync {
    fn sign_in<'a>(
        &'a self,
        credentials: &'a Credentials,
    ) -> Pin<Box<dyn Future<Output = Result<UserIdentity, GuardianClientError>> + Send + 'a>>;

    /// 管理者による承認済みかどうか
    fn is_approved<'a>(
        &'a self,
        user: &'a UserIdentity,
    ) -> Pin<Box<dyn Future<Output = Result<bool, GuardianClientError>> + Send + 'a>>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    user: AuthUser,
}

#[derive(Debug, Deserialize)]
struct AuthUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProfileStatus {
    status: String,
}

/// ホスト型サービスの認証API (`/auth/v1`) と profiles テーブルを使うプロバイダ
#[derive(Debug, Clone)]
pub struct RestAuthProvider {
    client: reqwest::Client,
    settings: StoreSettings,
}

impl RestAuthProvider {
    pub fn new(settings: StoreSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
        }
    }
}

impl AuthProvider for RestAuthProvider {
    fn sign_in<'a>(
        &'a self,
        credentials: &'a Credentials,
    ) -> Pin<Box<dyn Future<Output = Result<UserIdentity, GuardianClientError>> + Send + 'a>> {
        Box::pin(async move {
            let url = format!("{}/auth/v1/token", self.settings.url);
            let response = self
                .client
                .post(url)
                .query(&[("grant_type", "password")])
                .header("apikey", &self.settings.api_key)
                .json(credentials)
                .send()
                .await
                .map_err(|e| GuardianClientError::AuthenticationFailed(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(GuardianClientError::AuthenticationFailed(format!(
                    "HTTP {}: {}",
                    status.as_u16(),
                    body
                )));
            }

            let token: TokenResponse = response
                .json()
                .await
                .map_err(|e| GuardianClientError::AuthenticationFailed(e.to_string()))?;
            Ok(UserIdentity {
                id: token.user.id,
                email: token.user.email.unwrap_or_else(|| credentials.email.clone()),
                access_token: token.access_token,
            })
        })
    }

    fn is_approved<'a>(
        &'a self,
        user: &'a UserIdentity,
    ) -> Pin<Box<dyn Future<Output = Result<bool, GuardianClientError>> + Send + 'a>> {
        Box::pin(async move {
            let context = "select from profiles";
            let id_filter = format!("eq.{}", user.id);
            let response = self
                .client
                .get(format!("{}/rest/v1/profiles", self.settings.url))
                .query(&[("select", "status"), ("id", id_filter.as_str())])
                .header("apikey", &self.settings.api_key)
                .bearer_auth(&user.access_token)
                .send()
                .await
                .map_err(|e| GuardianClientError::Persistence(format!("{} failed: {}", context, e)))?;
            let profiles: Vec<ProfileStatus> = ensure_success(response, context)
                .await?
                .json()
                .await
                .map_err(|e| GuardianClientError::Persistence(format!("{} failed: {}", context, e)))?;
            Ok(profiles
                .first()
                .map(|p| p.status == APPROVED_STATUS)
                .unwrap_or(false))
        })
    }
}

/// セッション状態遷移を担うハンドラ
#[derive(Clone)]
pub struct AuthHandler {
    provider: Arc<dyn AuthProvider>,
}

impl AuthHandler {
    pub fn new(provider: Arc<dyn AuthProvider>) -> Self {
        Self { provider }
    }

    /// サインインし、承認状態を取得してセッションを Authenticated にする
    ///
    /// 承認状態の取得に失敗した場合は未承認として扱う。
    pub async fn sign_in(
        &self,
        session: &mut Session,
        credentials: &Credentials,
    ) -> Result<(), GuardianClientError> {
        if session.is_authenticated() {
            session.apply(AuthEvent::SignedOut);
        }
        session.apply(AuthEvent::SignInStarted);

        let user = match self.provider.sign_in(credentials).await {
            Ok(user) => user,
            Err(e) => {
                session.apply(AuthEvent::SignInFailed);
                tracing::warn!(email = %credentials.email, error = %e, "sign-in failed");
                return Err(e);
            }
        };

        let approved = match self.provider.is_approved(&user).await {
            Ok(approved) => approved,
            Err(e) => {
                tracing::warn!(user_id = %user.id, error = %e, "approval lookup failed, treating as unapproved");
                false
            }
        };

        tracing::info!(user_id = %user.id, approved, "signed in");
        session.apply(AuthEvent::SignedIn { user, approved });
        Ok(())
    }

    /// 承認状態を再取得する
    pub async fn refresh_approval(&self, session: &mut Session) -> Result<bool, GuardianClientError> {
        let user = session.require_user()?.clone();
        let approved = self.provider.is_approved(&user).await?;
        session.apply(AuthEvent::ApprovalChanged(approved));
        Ok(approved)
    }

    pub fn sign_out(&self, session: &mut Session) {
        session.apply(AuthEvent::SignedOut);
    }
}
