// PostgREST-style RecordStore over reqwest
use std::future::Future;
use std::pin::Pin;

use super::{ConfigRow, NewVoipTest, RecordStore, VoipTestRecord};
use crate::config::StoreSettings;
use crate::error::GuardianClientError;
use crate::session::UserIdentity;

const VOIP_TESTS_TABLE: &str = "voip_tests";
const SYSTEM_CONFIGS_TABLE: &str = "system_configs";

/// ホスト型DBの REST API (`{url}/rest/v1/{table}`) を使うストア
#[derive(Debug, Clone)]
pub struct RestStore {
    client: reqwest::Client,
    settings: StoreSettings,
}

impl RestStore {
    pub fn new(settings: StoreSettings) -> Self {
        Self::with_client(reqwest::Client::new(), settings)
    }

    pub fn with_client(client: reqwest::Client, settings: StoreSettings) -> Self {
        Self { client, settings }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.settings.url, table)
    }

    fn request(
        &self,
        method: reqwest::Method,
        table: &str,
        user: &UserIdentity,
    ) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.table_url(table))
            .header("apikey", &self.settings.api_key)
            .bearer_auth(&user.access_token)
    }
}

/// 2xx 以外を `Persistence` エラーに変換する
pub(crate) async fn ensure_success(
    response: reqwest::Response,
    context: &str,
) -> Result<reqwest::Response, GuardianClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(GuardianClientError::Persistence(format!(
        "{} failed: HTTP {}: {}",
        context,
        status.as_u16(),
        body
    )))
}

fn transport_error(context: &str, e: reqwest::Error) -> GuardianClientError {
    GuardianClientError::Persistence(format!("{} failed: {}", context, e))
}

impl RecordStore for RestStore {
    fn insert_test<'a>(
        &'a self,
        user: &'a UserIdentity,
        test: NewVoipTest,
    ) -> Pin<Box<dyn Future<Output = Result<VoipTestRecord, GuardianClientError>> + Send + 'a>> {
        Box::pin(async move {
            let context = "insert into voip_tests";
            let response = self
                .request(reqwest::Method::POST, VOIP_TESTS_TABLE, user)
                .header("Prefer", "return=representation")
                .json(&test)
                .send()
                .await
                .map_err(|e| transport_error(context, e))?;
            let rows: Vec<VoipTestRecord> = ensure_success(response, context)
                .await?
                .json()
                .await
                .map_err(|e| transport_error(context, e))?;
            rows.into_iter().next().ok_or_else(|| {
                GuardianClientError::Persistence(format!("{} returned no rows", context))
            })
        })
    }

    fn recent_tests<'a>(
        &'a self,
        user: &'a UserIdentity,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<VoipTestRecord>, GuardianClientError>> + Send + 'a>> {
        Box::pin(async move {
            let context = "select from voip_tests";
            let owner_filter = format!("eq.{}", user.id);
            let limit = limit.to_string();
            let response = self
                .request(reqwest::Method::GET, VOIP_TESTS_TABLE, user)
                .query(&[
                    ("select", "*"),
                    ("created_by", owner_filter.as_str()),
                    ("order", "created_at.desc"),
                    ("limit", limit.as_str()),
                ])
                .send()
                .await
                .map_err(|e| transport_error(context, e))?;
            ensure_success(response, context)
                .await?
                .json()
                .await
                .map_err(|e| transport_error(context, e))
        })
    }

    fn upsert_config<'a>(
        &'a self,
        user: &'a UserIdentity,
        row: ConfigRow,
    ) -> Pin<Box<dyn Future<Output = Result<(), GuardianClientError>> + Send + 'a>> {
        Box::pin(async move {
            let context = "upsert into system_configs";
            let response = self
                .request(reqwest::Method::POST, SYSTEM_CONFIGS_TABLE, user)
                .query(&[("on_conflict", "user_id,config_key")])
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(&row)
                .send()
                .await
                .map_err(|e| transport_error(context, e))?;
            ensure_success(response, context).await?;
            Ok(())
        })
    }
}
