//! 命令行参数与环境变量配置。

use clap::Parser;
use clap::builder::NonEmptyStringValueParser;
use shadow_rs::formatcp;
use std::time::Duration;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_TEMP_DIR: &str = "/tmp/nextcloud-public-uploader/";
pub const DEFAULT_CHUNK_MAX_SIZE: u64 = 10 * 1024 * 1024;
pub const DEFAULT_NOTE_NAME: &str = "descripcion.txt";
pub const DEFAULT_FOLDER_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_UPLOAD_TIMEOUT_SECS: u64 = 60 * 60;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_SCRATCH_TTL_SECS: u64 = 24 * 60 * 60;
pub const SESSION_PRUNE_INTERVAL_SECS: u64 = 300;
pub const SCRATCH_CLEAN_INTERVAL_SECS: u64 = 900;
/// multipart 表单除分片内容外的额外开销。
pub const MULTIPART_OVERHEAD: u64 = 64 * 1024;

/// CLI arguments and environment configuration for the uploader.
#[derive(Parser, Debug, Clone)]
#[command(name = "chunk-relay", version = VERSION_INFO, about = "Chunked upload relay to WebDAV")]
pub struct Args {
    #[arg(
        long,
        env = "NC_URL",
        value_parser = NonEmptyStringValueParser::new(),
        help = "Base URL of the WebDAV server"
    )]
    pub nc_url: String,
    #[arg(
        long,
        env = "NC_USER",
        value_parser = NonEmptyStringValueParser::new(),
        help = "Remote username"
    )]
    pub nc_user: String,
    #[arg(
        long,
        env = "NC_APP_PASSWORD",
        hide_env_values = true,
        value_parser = NonEmptyStringValueParser::new(),
        help = "Remote app password"
    )]
    pub nc_app_password: String,
    #[arg(
        long,
        env = "NC_FOLDER",
        default_value = "",
        help = "Upload root below the user's home"
    )]
    pub nc_folder: String,
    #[arg(
        short = 't',
        long,
        env = "UPLOAD_TEMP_DIR",
        default_value = DEFAULT_TEMP_DIR,
        help = "Directory for temporary chunk storage"
    )]
    pub temp_dir: String,
    #[arg(
        short = 'b',
        long,
        env = "UPLOADER_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(short = 'p', long, env = "PORT", default_value_t = 8080, help = "HTTP port")]
    pub port: u16,
    #[arg(
        long,
        env = "UPLOADER_CORS_ORIGINS",
        help = "Comma separated CORS origins"
    )]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "UPLOADER_CHUNK_MAX_SIZE",
        default_value_t = DEFAULT_CHUNK_MAX_SIZE,
        help = "Max size of one chunk in bytes"
    )]
    pub chunk_max_size: u64,
    #[arg(
        long,
        env = "UPLOADER_NOTE_NAME",
        default_value = DEFAULT_NOTE_NAME,
        help = "File name of the metadata note"
    )]
    pub note_name: String,
    #[arg(
        long,
        env = "UPLOADER_FOLDER_TIMEOUT_SECS",
        default_value_t = DEFAULT_FOLDER_TIMEOUT_SECS,
        help = "Timeout for folder creation in seconds"
    )]
    pub folder_timeout_secs: u64,
    #[arg(
        long,
        env = "UPLOADER_PROBE_TIMEOUT_SECS",
        default_value_t = DEFAULT_PROBE_TIMEOUT_SECS,
        help = "Timeout for existence checks in seconds"
    )]
    pub probe_timeout_secs: u64,
    #[arg(
        long,
        env = "UPLOADER_UPLOAD_TIMEOUT_SECS",
        default_value_t = DEFAULT_UPLOAD_TIMEOUT_SECS,
        help = "Timeout for file uploads in seconds"
    )]
    pub upload_timeout_secs: u64,
    #[arg(
        long,
        env = "UPLOADER_SESSION_TTL_SECS",
        default_value_t = DEFAULT_SESSION_TTL_SECS,
        help = "Drop unfinished sessions after this many seconds (0 to disable)"
    )]
    pub session_ttl_secs: u64,
    #[arg(
        long,
        env = "UPLOADER_SCRATCH_TTL_SECS",
        default_value_t = DEFAULT_SCRATCH_TTL_SECS,
        help = "Remove abandoned chunk directories after this many seconds (0 to disable)"
    )]
    pub scratch_ttl_secs: u64,
}

/// WebDAV 客户端所需的连接参数。
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub upload_dir: String,
    pub folder_timeout: Duration,
    pub probe_timeout: Duration,
    pub upload_timeout: Duration,
}

impl Args {
    pub fn remote_config(&self) -> RemoteConfig {
        RemoteConfig {
            base_url: self.nc_url.trim_end_matches('/').to_string(),
            username: self.nc_user.clone(),
            password: self.nc_app_password.clone(),
            upload_dir: self.nc_folder.clone(),
            folder_timeout: Duration::from_secs(self.folder_timeout_secs),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            upload_timeout: Duration::from_secs(self.upload_timeout_secs),
        }
    }
}
