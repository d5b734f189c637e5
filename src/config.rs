//! Client configuration.
//!
//! A [`Config`] is built once by the caller and handed to [`crate::api::HttpApi`]
//! and [`crate::large_file::LargeFileSession`]. Values are layered: defaults,
//! then an optional TOML settings file, then environment variables. The binary
//! applies its command line flags on top.

use serde::Deserialize;
use std::{
    env, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

pub const DEFAULT_API_URL: &str = "https://api.backblazeb2.com";
/// 100 MiB, the smallest part size the remote accepts for every part except the last.
pub const DEFAULT_PART_SIZE: u64 = 100 * (1 << 20);
pub const DEFAULT_LARGE_FILE_THRESHOLD: u64 = 100 * (1 << 20);
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 5;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 600;

pub const ENV_ACCOUNT_ID: &str = "B2_ACCOUNT_ID";
pub const ENV_APPLICATION_KEY: &str = "B2_APPLICATION_KEY";
pub const ENV_API_URL: &str = "B2_API_URL";

#[derive(Error, Debug)]
pub enum Error {
    #[error("Cannot read settings file {0:?}: {1}")]
    ReadSettings(PathBuf, #[source] io::Error),
    #[error("Cannot parse settings file {0:?}: {1}")]
    ParseSettings(PathBuf, #[source] toml::de::Error),
    #[error("Account ID is not set. Use the settings file, B2_ACCOUNT_ID or --account-id")]
    MissingAccountId,
    #[error("Application key is not set. Use the settings file, B2_APPLICATION_KEY or --application-key")]
    MissingApplicationKey,
    #[error("Upload concurrency must be at least 1")]
    ZeroConcurrency,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub account_id: String,
    pub application_key: String,
    pub api_url: String,
    pub part_size: u64,
    pub large_file_threshold: u64,
    pub upload_concurrency: usize,
    pub temp_dir: PathBuf,
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            account_id: String::new(),
            application_key: String::new(),
            api_url: DEFAULT_API_URL.to_owned(),
            part_size: DEFAULT_PART_SIZE,
            large_file_threshold: DEFAULT_LARGE_FILE_THRESHOLD,
            upload_concurrency: DEFAULT_UPLOAD_CONCURRENCY,
            temp_dir: env::temp_dir(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Settings {
    account: AccountSettings,
    upload: UploadSettings,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct AccountSettings {
    account_id: Option<String>,
    application_key: Option<String>,
    api_url: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct UploadSettings {
    part_size: Option<u64>,
    large_file_threshold: Option<u64>,
    concurrency: Option<usize>,
    temp_dir: Option<PathBuf>,
    request_timeout_secs: Option<u64>,
}

impl Config {
    /// Loads defaults, overlays `settings_path` when given, then the environment.
    pub fn load(settings_path: Option<&Path>) -> Result<Self, Error> {
        let mut config = Config::default();
        if let Some(path) = settings_path {
            let text =
                fs::read_to_string(path).map_err(|e| Error::ReadSettings(path.to_owned(), e))?;
            config.apply_toml(&text, path)?;
        }
        config.apply_env();
        Ok(config)
    }

    fn apply_toml(&mut self, text: &str, path: &Path) -> Result<(), Error> {
        let settings: Settings =
            toml::from_str(text).map_err(|e| Error::ParseSettings(path.to_owned(), e))?;

        let Settings { account, upload } = settings;
        if let Some(v) = account.account_id {
            self.account_id = v;
        }
        if let Some(v) = account.application_key {
            self.application_key = v;
        }
        if let Some(v) = account.api_url {
            self.api_url = v;
        }
        if let Some(v) = upload.part_size {
            self.part_size = v;
        }
        if let Some(v) = upload.large_file_threshold {
            self.large_file_threshold = v;
        }
        if let Some(v) = upload.concurrency {
            self.upload_concurrency = v;
        }
        if let Some(v) = upload.temp_dir {
            self.temp_dir = v;
        }
        if let Some(v) = upload.request_timeout_secs {
            self.request_timeout = Duration::from_secs(v);
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        let read = |key: &str| env::var(key).ok().filter(|v: &String| !v.is_empty());
        if let Some(v) = read(ENV_ACCOUNT_ID) {
            self.account_id = v;
        }
        if let Some(v) = read(ENV_APPLICATION_KEY) {
            self.application_key = v;
        }
        if let Some(v) = read(ENV_API_URL) {
            self.api_url = v;
        }
    }

    /// Checks that credentials are present before any request goes out.
    pub fn validate(&self) -> Result<(), Error> {
        if self.account_id.is_empty() {
            return Err(Error::MissingAccountId);
        }
        if self.application_key.is_empty() {
            return Err(Error::MissingApplicationKey);
        }
        if self.upload_concurrency == 0 {
            return Err(Error::ZeroConcurrency);
        }
        Ok(())
    }
}
