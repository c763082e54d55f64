//! 設定管理モジュール
//!
//! XDGディレクトリ（または明示的なパス）の TOML ファイルにエンジン設定と
//! ログ設定を永続化します。

use crate::engine::backoff::BackoffConfig;
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// エンジン設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// ポーリング間隔の下限（ミリ秒）
    pub poll_interval_ms: u64,
    /// resolve / fetch 1回あたりのタイムアウト（ミリ秒）
    pub fetch_timeout_ms: u64,
    /// 購読者がいなくなってからセッションを止めるまでの猶予（秒）
    pub idle_grace_secs: u64,
    /// 重複排除ウィンドウのサイズ
    pub dedup_capacity: usize,
    /// 購読者ごとのキュー上限
    pub subscriber_queue_capacity: usize,
    pub backoff: BackoffConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            fetch_timeout_ms: 15_000,
            idle_grace_secs: 30,
            dedup_capacity: 2000,
            subscriber_queue_capacity: 256,
            backoff: BackoffConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn idle_grace(&self) -> Duration {
        Duration::from_secs(self.idle_grace_secs)
    }
}

/// ログ設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// ログレベル (trace/debug/info/warn/error)。RUST_LOG が優先される
    pub log_level: String,
    /// ファイル出力先（None の場合は stderr のみ）
    pub log_dir: Option<PathBuf>,
    /// ログファイル名の接頭辞
    pub file_prefix: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            file_prefix: "livechat-relay".to_string(),
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub log: LogConfig,
}

/// 設定管理マネージャー
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// XDGディレクトリの設定ファイルを使う
    pub fn new() -> Result<Self> {
        Ok(Self {
            config_path: Self::default_config_path()?,
        })
    }

    /// 任意のパスの設定ファイルを使う
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: path.into(),
        }
    }

    /// XDGディレクトリに基づく設定ファイルパスを取得
    pub fn default_config_path() -> Result<PathBuf> {
        let project_dirs = ProjectDirs::from("dev", "sifyfy", "livechat-relay")
            .context("Failed to get project directories")?;

        let config_file = project_dirs.config_dir().join("config.toml");
        debug!("Config file path: {}", config_file.display());

        Ok(config_file)
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// 設定を読み込み（ファイルがなければデフォルト）
    pub fn load_config(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            info!(
                "Config file not found, using default settings: {}",
                self.config_path.display()
            );
            return Ok(AppConfig::default());
        }

        let config_content = fs::read_to_string(&self.config_path).with_context(|| {
            format!("Failed to read config file: {}", self.config_path.display())
        })?;

        let config: AppConfig = toml::from_str(&config_content).with_context(|| {
            format!(
                "Failed to parse config file: {}",
                self.config_path.display()
            )
        })?;

        info!(
            "✅ Configuration loaded from: {}",
            self.config_path.display()
        );

        Ok(config)
    }

    /// 設定を保存
    pub fn save_config(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let config_content =
            toml::to_string_pretty(config).context("Failed to serialize config")?;

        fs::write(&self.config_path, config_content).with_context(|| {
            format!(
                "Failed to write config file: {}",
                self.config_path.display()
            )
        })?;

        info!("💾 Configuration saved to: {}", self.config_path.display());
        Ok(())
    }
}
