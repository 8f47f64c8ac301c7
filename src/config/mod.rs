// Configuration module - local client config store and remote store settings
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::GuardianClientError;

/// 永続化キー（ファイル名の stem としても使う）
pub const CONFIG_KEY: &str = "nexus_desktop_config";

/// デスクトップクライアント設定
///
/// 保存時は常に全体を上書きする。フィールド間の制約は持たない。
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    pub access_token: String,
    pub sip_server: String,
    pub extension: String,
    pub password: String,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server_url", &self.server_url)
            .field("access_token", &redact(&self.access_token))
            .field("sip_server", &self.sip_server)
            .field("extension", &self.extension)
            .field("password", &redact(&self.password))
            .finish()
    }
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() {
        ""
    } else {
        "***"
    }
}

impl ClientConfig {
    /// ヘルスチェックに必要な server_url と access_token が揃っているか
    pub fn has_server_credentials(&self) -> bool {
        !self.server_url.is_empty() && !self.access_token.is_empty()
    }

    /// VoIPテストに必要なフィールドのうち未設定のものを返す
    pub fn missing_sip_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.sip_server.is_empty() {
            missing.push("sip_server");
        }
        if self.extension.is_empty() {
            missing.push("extension");
        }
        missing
    }

    /// 秘密情報を伏せた表示用の複製
    pub fn redacted(&self) -> ClientConfig {
        ClientConfig {
            access_token: redact(&self.access_token).to_string(),
            password: redact(&self.password).to_string(),
            ..self.clone()
        }
    }
}

/// JSON文字列から設定を読み込む
pub fn load_from_str(json: &str) -> Result<ClientConfig, GuardianClientError> {
    serde_json::from_str(json)
        .map_err(|e| GuardianClientError::Parse(format!("invalid client config JSON: {}", e)))
}

/// ローカル設定ストア
///
/// 単一のJSONドキュメントとして `ClientConfig` を保持する。
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `{dir}/nexus_desktop_config.json` を保存先とするストア
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(format!("{}.json", CONFIG_KEY)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 保存済み設定を読み込む
    ///
    /// ドキュメントが無ければデフォルト値を返す。壊れていれば `Parse` エラー。
    pub fn load(&self) -> Result<ClientConfig, GuardianClientError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ClientConfig::default());
            }
            Err(e) => return Err(GuardianClientError::Io(e)),
        };
        load_from_str(&content)
    }

    /// 起動時用: 読み込みに失敗してもデフォルト値で継続する
    pub fn load_or_default(&self) -> ClientConfig {
        match self.load() {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "falling back to default client config");
                ClientConfig::default()
            }
        }
    }

    /// 設定全体を上書き保存する
    pub fn save(&self, config: &ClientConfig) -> Result<(), GuardianClientError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(config).map_err(|e| {
            GuardianClientError::Parse(format!("failed to serialize client config: {}", e))
        })?;
        std::fs::write(&self.path, json)?;
        tracing::debug!(path = %self.path.display(), "client config saved");
        Ok(())
    }
}

/// リモートストア（認証 + REST テーブル）への接続設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSettings {
    pub url: String,
    pub api_key: String,
}

impl StoreSettings {
    /// 設定値のバリデーション
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.url.is_empty() {
            errors.push("store url must not be empty".to_string());
        } else if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            errors.push("store url must start with http:// or https://".to_string());
        }
        if self.api_key.is_empty() {
            errors.push("store api_key must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// CLI/環境変数の値から構築し、バリデーションを実行する
    pub fn from_parts(
        url: Option<String>,
        api_key: Option<String>,
    ) -> Result<Self, GuardianClientError> {
        let settings = Self {
            url: url.unwrap_or_default().trim_end_matches('/').to_string(),
            api_key: api_key.unwrap_or_default(),
        };
        settings.validate().map_err(|errors| {
            GuardianClientError::Config(format!("Validation errors: {}", errors.join("; ")))
        })?;
        Ok(settings)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_config() -> ClientConfig {
        ClientConfig {
            server_url: "https://h.test".to_string(),
            access_token: "tok".to_string(),
            sip_server: "sip.example.com".to_string(),
            extension: "1001".to_string(),
            password: "secret".to_string(),
        }
    }

    // === ClientConfig ===

    #[test]
    fn test_default_config_is_all_empty() {
        let config = ClientConfig::default();
        assert!(config.server_url.is_empty());
        assert!(config.access_token.is_empty());
        assert!(config.sip_server.is_empty());
        assert!(config.extension.is_empty());
        assert!(config.password.is_empty());
    }

    #[test]
    fn test_has_server_credentials() {
        assert!(sample_config().has_server_credentials());

        let mut config = sample_config();
        config.access_token.clear();
        assert!(!config.has_server_credentials());

        let mut config = sample_config();
        config.server_url.clear();
        assert!(!config.has_server_credentials());
    }

    #[test]
    fn test_missing_sip_fields() {
        assert!(sample_config().missing_sip_fields().is_empty());
        assert_eq!(
            ClientConfig::default().missing_sip_fields(),
            vec!["sip_server", "extension"]
        );
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let debug = format!("{:?}", sample_config());
        assert!(!debug.contains("tok\""));
        assert!(!debug.contains("secret"));
        assert!(debug.contains("https://h.test"));
    }

    #[test]
    fn test_redacted_keeps_public_fields() {
        let redacted = sample_config().redacted();
        assert_eq!(redacted.access_token, "***");
        assert_eq!(redacted.password, "***");
        assert_eq!(redacted.extension, "1001");
        assert_eq!(ClientConfig::default().redacted(), ClientConfig::default());
    }

    // === load_from_str ===

    #[test]
    fn test_load_from_str_partial_document_uses_defaults() {
        let config = load_from_str(r#"{"server_url":"https://h.test"}"#).unwrap();
        assert_eq!(config.server_url, "https://h.test");
        assert!(config.extension.is_empty());
    }

    #[test]
    fn test_load_from_str_malformed_returns_parse_error() {
        let result = load_from_str("{not json");
        assert!(matches!(result, Err(GuardianClientError::Parse(_))));
    }

    #[test]
    fn test_load_from_str_wrong_type_returns_parse_error() {
        let result = load_from_str(r#"{"extension": 1001}"#);
        assert!(matches!(result, Err(GuardianClientError::Parse(_))));
    }

    // === ConfigStore ===

    #[test]
    fn test_load_missing_file_returns_default() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::in_dir(dir.path());
        assert_eq!(store.load().unwrap(), ClientConfig::default());
    }

    #[test]
    fn test_in_dir_uses_config_key_file_name() {
        let store = ConfigStore::in_dir(Path::new("/tmp/guardian"));
        assert_eq!(store.path(), Path::new("/tmp/guardian/nexus_desktop_config.json"));
    }

    #[test]
    fn test_save_then_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::in_dir(dir.path());
        store.save(&sample_config()).unwrap();
        assert_eq!(store.load().unwrap(), sample_config());
    }

    #[test]
    fn test_save_creates_missing_parent_directories() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::in_dir(&dir.path().join("nested").join("deeper"));
        store.save(&sample_config()).unwrap();
        assert!(store.path().exists());
    }

    #[test]
    fn test_save_overwrites_without_merge() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::in_dir(dir.path());
        store.save(&sample_config()).unwrap();

        let replacement = ClientConfig {
            extension: "2002".to_string(),
            ..Default::default()
        };
        store.save(&replacement).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, replacement);
        assert!(loaded.server_url.is_empty());
    }

    #[test]
    fn test_load_malformed_file_returns_parse_error() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::in_dir(dir.path());
        std::fs::write(store.path(), "garbage").unwrap();
        assert!(matches!(store.load(), Err(GuardianClientError::Parse(_))));
    }

    #[test]
    fn test_load_or_default_swallows_malformed_file() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::in_dir(dir.path());
        std::fs::write(store.path(), "[1, 2").unwrap();
        assert_eq!(store.load_or_default(), ClientConfig::default());
    }

    // === StoreSettings ===

    #[test]
    fn test_store_settings_from_parts_valid() {
        let settings = StoreSettings::from_parts(
            Some("https://project.supabase.test/".to_string()),
            Some("anon-key".to_string()),
        )
        .unwrap();
        assert_eq!(settings.url, "https://project.supabase.test");
        assert_eq!(settings.api_key, "anon-key");
    }

    #[test]
    fn test_store_settings_missing_values_is_config_error() {
        let result = StoreSettings::from_parts(None, None);
        match result {
            Err(GuardianClientError::Config(msg)) => {
                assert!(msg.contains("store url must not be empty"));
                assert!(msg.contains("store api_key must not be empty"));
            }
            other => panic!("expected Config error, got {:?}", other),
        }
    }

    #[test]
    fn test_store_settings_rejects_non_http_scheme() {
        let settings = StoreSettings {
            url: "ftp://files.test".to_string(),
            api_key: "k".to_string(),
        };
        let errors = settings.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("http://"));
    }

    mod prop_tests {
        use super::super::generators::arb_client_config;
        use super::super::*;
        use proptest::prelude::*;
        use tempfile::TempDir;

        proptest! {
            #[test]
            fn prop_save_then_load_is_identity(config in arb_client_config()) {
                let dir = TempDir::new().unwrap();
                let store = ConfigStore::in_dir(dir.path());
                store.save(&config).unwrap();
                prop_assert_eq!(store.load().unwrap(), config);
            }
        }
    }
}
