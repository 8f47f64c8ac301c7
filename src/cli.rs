// CLI definitions using clap derive macros
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::auth::{AuthHandler, Credentials, RestAuthProvider};
use crate::client::DesktopClient;
use crate::config::{ClientConfig, ConfigStore, StoreSettings};
use crate::error::GuardianClientError;
use crate::probe::Prober;
use crate::recorder::SyntheticMetrics;
use crate::reporter::{format_history_line, format_system_info, summarize, write_json_history};
use crate::session::Session;
use crate::store::{MemoryStore, RecordStore, RestStore};

/// Guardian VoIP デスクトップクライアント
#[derive(Parser, Debug, PartialEq)]
#[command(name = "guardian-client", version)]
pub struct Cli {
    /// ローカル設定の保存ディレクトリ
    #[arg(long, env = "GUARDIAN_CONFIG_DIR", default_value = ".guardian", global = true)]
    pub config_dir: PathBuf,
    /// リモートストアのベースURL
    #[arg(long, env = "GUARDIAN_STORE_URL", global = true)]
    pub store_url: Option<String>,
    /// リモートストアのAPIキー
    #[arg(long, env = "GUARDIAN_STORE_KEY", hide_env_values = true, global = true)]
    pub store_key: Option<String>,
    /// サインイン用メールアドレス
    #[arg(long, env = "GUARDIAN_EMAIL", global = true)]
    pub email: Option<String>,
    /// サインイン用パスワード
    #[arg(long, env = "GUARDIAN_PASSWORD", hide_env_values = true, global = true)]
    pub password: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// ローカル設定を表示・編集する
    #[command(subcommand)]
    Config(ConfigCommand),
    /// サーバへの接続を確認する
    Check,
    /// VoIPテストを1回実行して記録する
    Test,
    /// 直近のテスト履歴を表示する
    History {
        /// JSONエクスポート先
        #[arg(long)]
        json: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum ConfigCommand {
    /// 現在の設定を表示する（秘密情報は伏せる）
    Show,
    /// 設定を編集して保存し、接続を確認する
    Set(ConfigEdit),
}

/// 指定されたフィールドのみを上書きする編集内容
#[derive(Args, Debug, PartialEq, Default)]
pub struct ConfigEdit {
    #[arg(long)]
    pub server_url: Option<String>,
    #[arg(long)]
    pub access_token: Option<String>,
    #[arg(long)]
    pub sip_server: Option<String>,
    #[arg(long)]
    pub extension: Option<String>,
    /// SIPアカウントのパスワード
    #[arg(long)]
    pub sip_password: Option<String>,
}

impl ConfigEdit {
    pub fn apply(&self, config: &mut ClientConfig) {
        let fields = [
            (&self.server_url, &mut config.server_url),
            (&self.access_token, &mut config.access_token),
            (&self.sip_server, &mut config.sip_server),
            (&self.extension, &mut config.extension),
            (&self.sip_password, &mut config.password),
        ];
        for (edit, field) in fields {
            if let Some(value) = edit {
                *field = value.clone();
            }
        }
    }
}

/// サブコマンド共通の実行コンテキスト
pub struct Context {
    config_dir: PathBuf,
    store: Option<StoreSettings>,
    credentials: Option<Credentials>,
}

impl Context {
    /// ストア設定は URL かキーのどちらかが指定された場合のみ検証する
    pub fn from_cli(cli: &Cli) -> Result<Self, GuardianClientError> {
        let store = if cli.store_url.is_some() || cli.store_key.is_some() {
            Some(StoreSettings::from_parts(
                cli.store_url.clone(),
                cli.store_key.clone(),
            )?)
        } else {
            None
        };
        let credentials = match (&cli.email, &cli.password) {
            (Some(email), Some(password)) => Some(Credentials {
                email: email.clone(),
                password: password.clone(),
            }),
            _ => None,
        };
        Ok(Self {
            config_dir: cli.config_dir.clone(),
            store,
            credentials,
        })
    }

    pub fn config_store(&self) -> ConfigStore {
        ConfigStore::in_dir(&self.config_dir)
    }

    /// ストア未設定時はプロセス内ストアで動作する
    pub fn build_client(&self) -> DesktopClient {
        let store: Arc<dyn RecordStore> = match &self.store {
            Some(settings) => Arc::new(RestStore::new(settings.clone())),
            None => Arc::new(MemoryStore::new()),
        };
        DesktopClient::new(
            self.config_store(),
            Prober::http(),
            store,
            Arc::new(SyntheticMetrics::new()),
        )
    }

    /// 資格情報とストア設定があればサインインする。どちらか欠ければ未認証セッション。
    pub async fn optional_session(&self) -> Result<Session, GuardianClientError> {
        match (&self.store, &self.credentials) {
            (Some(_), Some(_)) => self.session().await,
            _ => Ok(Session::new()),
        }
    }

    /// サインイン済みセッションを返す
    pub async fn session(&self) -> Result<Session, GuardianClientError> {
        let (settings, credentials) = match (&self.store, &self.credentials) {
            (Some(settings), Some(credentials)) => (settings, credentials),
            _ => {
                return Err(GuardianClientError::Config(
                    "this command requires --store-url, --store-key, --email and --password"
                        .to_string(),
                ))
            }
        };
        let handler = AuthHandler::new(Arc::new(RestAuthProvider::new(settings.clone())));
        let mut session = Session::new();
        handler.sign_in(&mut session, credentials).await?;
        if !session.is_approved() {
            tracing::warn!("signed-in account is pending approval");
        }
        Ok(session)
    }
}

/// CLI のエントリポイント
pub async fn run(cli: Cli) -> Result<(), GuardianClientError> {
    let ctx = Context::from_cli(&cli)?;
    match cli.command {
        Command::Config(ConfigCommand::Show) => run_config_show(&ctx.config_store()),
        Command::Config(ConfigCommand::Set(edit)) => run_config_set(&ctx, &edit).await,
        Command::Check => run_check(&ctx).await,
        Command::Test => run_test(&ctx).await,
        Command::History { json } => run_history(&ctx, json.as_deref()).await,
    }
}

/// config show の実行
///
/// 壊れた設定ファイルは `Parse` エラーとして報告する。
pub fn run_config_show(store: &ConfigStore) -> Result<(), GuardianClientError> {
    let config = store.load()?;
    let json = serde_json::to_string_pretty(&config.redacted()).map_err(|e| {
        GuardianClientError::Parse(format!("failed to serialize client config: {}", e))
    })?;
    println!("{}", json);
    Ok(())
}

/// config set の実行
///
/// 壊れた設定ファイルは上書きせず `Parse` エラーを返す。
pub async fn run_config_set(ctx: &Context, edit: &ConfigEdit) -> Result<(), GuardianClientError> {
    let mut client = ctx.build_client();
    let mut config = ctx.config_store().load()?;
    edit.apply(&mut config);

    let session = ctx.optional_session().await?;
    let state = client.save_config(config, &session).await?;
    println!("saved {}", ctx.config_store().path().display());
    println!("status={}", state);
    Ok(())
}

/// check の実行
pub async fn run_check(ctx: &Context) -> Result<(), GuardianClientError> {
    let mut client = ctx.build_client();
    client.startup(&Session::new()).await;
    println!("{}", format_system_info(&client.system_info()));
    Ok(())
}

/// test の実行
pub async fn run_test(ctx: &Context) -> Result<(), GuardianClientError> {
    let session = ctx.session().await?;
    let mut client = ctx.build_client();
    client.startup(&session).await;

    let record = client.run_test(&session).await?;
    println!("{}", format_history_line(&record));
    Ok(())
}

/// history の実行
pub async fn run_history(ctx: &Context, json: Option<&Path>) -> Result<(), GuardianClientError> {
    let session = ctx.session().await?;
    let client = ctx.build_client();

    let records = client.load_history(&session).await?;
    if records.is_empty() {
        println!("no VoIP tests recorded");
    }
    for record in &records {
        println!("{}", format_history_line(record));
    }
    let summary = summarize(&records);
    println!(
        "count={} avg_latency={:.1}ms avg_jitter={:.1}ms avg_quality={:.1} connectivity={:.0}%",
        summary.count,
        summary.avg_latency_ms,
        summary.avg_jitter_ms,
        summary.avg_quality_score,
        summary.connectivity_ratio * 100.0
    );

    if let Some(path) = json {
        write_json_history(&records, path).map_err(|e| {
            GuardianClientError::Persistence(format!(
                "Failed to write history file '{}': {}",
                path.display(),
                e
            ))
        })?;
    }
    Ok(())
}
