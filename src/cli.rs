use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::level_filters::LevelFilter;

pub const DEFAULT_CONFIG_FILE: &str = "config.json";
pub const DEFAULT_SCHEDULE_URL: &str = "https://api.nhk.or.jp";
pub const DEFAULT_ASSETS_URL: &str = "https://www3.nhk.or.jp";
pub const DEFAULT_SAFETY_BUFFER_MS: u64 = 40_000;
pub const DEFAULT_MINIMUM_DURATION_MS: u64 = 240_000;

/// Record scheduled NHK World programmes and tidy up the captures.
#[derive(Parser, Debug)]
#[command(name = "nhk-record", version, about = "Record scheduled broadcasts from a live stream")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Extra milliseconds to record before and after the scheduled airtime
    #[arg(short = 'b', long)]
    pub safety_buffer: Option<u64>,

    /// JSON config file (default: ./config.json when present)
    #[arg(short = 'c', long, value_hint = ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// Directory in which to save recorded programmes
    #[arg(short = 'd', long, value_hint = ValueHint::DirPath)]
    pub save_dir: Option<PathBuf>,

    /// URL of the live stream to record
    #[arg(short = 'i', long)]
    pub stream_url: Option<String>,

    /// Logging level for the console
    #[arg(short = 'k', long, value_enum)]
    pub log_level_console: Option<LogLevel>,

    /// Logging level for the log file
    #[arg(short = 'l', long, value_enum)]
    pub log_level_file: Option<LogLevel>,

    /// Log file path (no file logging when unset)
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub log_file: Option<PathBuf>,

    /// Glob pattern of desired programme titles (repeatable)
    #[arg(short = 'm', long)]
    pub match_pattern: Vec<String>,

    /// Minimum scheduled run time to record, in milliseconds
    #[arg(short = 't', long)]
    pub minimum_duration: Option<u64>,

    /// Base URL of the schedule API
    #[arg(long)]
    pub schedule_url: Option<String>,

    /// Base URL for thumbnails and site assets
    #[arg(long)]
    pub assets_url: Option<String>,

    /// Schedule API key (scraped from the assets site when unset)
    #[arg(long)]
    pub api_key: Option<String>,

    /// Directory holding the reference stills used for detection
    #[arg(long, value_hint = ValueHint::DirPath)]
    pub data_dir: Option<PathBuf>,

    /// Trim lead-in and lead-out interstitials
    #[arg(long, action = ArgAction::SetTrue)]
    pub trim: bool,

    /// Crop out news banners
    #[arg(long, action = ArgAction::SetTrue)]
    pub crop: bool,

    /// Keep the unprocessed capture alongside the processed one
    #[arg(long, action = ArgAction::SetTrue)]
    pub keep_original: bool,

    /// x264 CRF (used only when cropping re-encodes video)
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=51))]
    pub crf: Option<u8>,

    /// x264 preset (used only when cropping re-encodes video)
    #[arg(long)]
    pub preset: Option<String>,

    /// Threads to allow ffmpeg (0 = auto/max)
    #[arg(long)]
    pub threads: Option<u16>,

    /// Path to ffmpeg binary (overrides PATH lookup)
    #[arg(long, value_hint = ValueHint::ExecutablePath)]
    pub ffmpeg: Option<PathBuf>,

    /// Path to ffprobe binary (overrides PATH lookup)
    #[arg(long, value_hint = ValueHint::ExecutablePath)]
    pub ffprobe: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Trim and crop an existing capture in one pass
    Process {
        #[arg(value_hint = ValueHint::FilePath)]
        input: PathBuf,
        #[arg(value_hint = ValueHint::FilePath)]
        output: PathBuf,
    },
}

#[derive(ValueEnum, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Error,
    None,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::None => LevelFilter::OFF,
        }
    }
}

/// Detection tuning. Every duration is in milliseconds.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DetectionConfig {
    pub start_search_buffer: u64,
    pub start_search_duration: u64,
    pub end_search_duration: u64,
    pub end_search_buffer: u64,
    pub interstitial_block: u64,
    pub interstitial_tolerance: u64,
    pub minimum_programme_duration: u64,
    pub banner_tolerance: u64,
    pub crop_probe_lead: u64,
    pub crop_probe_duration: u64,
    pub constant_crop_width: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            start_search_buffer: 15_000,
            start_search_duration: 90_000,
            end_search_duration: 60_000,
            end_search_buffer: 15_000,
            interstitial_block: 30_000,
            interstitial_tolerance: 1_000,
            minimum_programme_duration: 60_000,
            banner_tolerance: 5_000,
            crop_probe_lead: 750,
            crop_probe_duration: 1_500,
            constant_crop_width: 1736,
        }
    }
}

/// The JSON config file. Keys mirror the long option names in camelCase.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct FileConfig {
    pub safety_buffer: Option<u64>,
    pub save_dir: Option<PathBuf>,
    pub stream_url: Option<String>,
    pub log_level_console: Option<LogLevel>,
    pub log_level_file: Option<LogLevel>,
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub match_pattern: Vec<String>,
    pub minimum_duration: Option<u64>,
    pub schedule_url: Option<String>,
    pub assets_url: Option<String>,
    pub api_key: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub trim: Option<bool>,
    pub crop: Option<bool>,
    pub keep_original: Option<bool>,
    pub crf: Option<u8>,
    pub preset: Option<String>,
    pub threads: Option<u16>,
    pub ffmpeg: Option<PathBuf>,
    pub ffprobe: Option<PathBuf>,
    #[serde(default)]
    pub detection: DetectionConfig,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub console: LogLevel,
    pub file_level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PostProcessConfig {
    pub trim: bool,
    pub crop: bool,
    pub keep_original: bool,
}

impl PostProcessConfig {
    pub fn enabled(&self) -> bool {
        self.trim || self.crop
    }
}

#[derive(Debug, Clone)]
pub struct EncodeSettings {
    pub crf: u8,
    pub preset: String,
    pub threads: u16,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            crf: 17,
            preset: "slow".into(),
            threads: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub stream_url: Option<String>,
    pub schedule_url: String,
    pub assets_url: String,
    pub api_key: Option<String>,
    pub save_dir: PathBuf,
    pub data_dir: PathBuf,
    pub match_pattern: Vec<String>,
    pub minimum_duration_ms: u64,
    pub safety_buffer_ms: u64,
    pub log: LogConfig,
    pub post_process: PostProcessConfig,
    pub encode: EncodeSettings,
    pub detection: DetectionConfig,
    pub ffmpeg: Option<PathBuf>,
    pub ffprobe: Option<PathBuf>,
}

impl Cli {
    pub fn into_config(self) -> Result<AppConfig> {
        let file = match &self.config {
            Some(path) => load_file_config(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                load_file_config(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => FileConfig::default(),
        };
        self.merge(file)
    }

    /// Command line wins over the config file, which wins over defaults.
    pub fn merge(self, file: FileConfig) -> Result<AppConfig> {
        let encode_defaults = EncodeSettings::default();
        let stream_url = self.stream_url.or(file.stream_url);
        if self.command.is_none() && stream_url.is_none() {
            anyhow::bail!(
                "a stream URL is required (--stream-url or `streamUrl` in the config file)"
            );
        }
        let match_pattern = if !self.match_pattern.is_empty() {
            self.match_pattern
        } else if !file.match_pattern.is_empty() {
            file.match_pattern
        } else {
            vec!["*".into()]
        };

        Ok(AppConfig {
            stream_url,
            schedule_url: self
                .schedule_url
                .or(file.schedule_url)
                .unwrap_or_else(|| DEFAULT_SCHEDULE_URL.into()),
            assets_url: self
                .assets_url
                .or(file.assets_url)
                .unwrap_or_else(|| DEFAULT_ASSETS_URL.into()),
            api_key: self.api_key.or(file.api_key),
            save_dir: self
                .save_dir
                .or(file.save_dir)
                .unwrap_or_else(|| PathBuf::from("recordings")),
            data_dir: self
                .data_dir
                .or(file.data_dir)
                .unwrap_or_else(|| PathBuf::from("data")),
            match_pattern,
            minimum_duration_ms: self
                .minimum_duration
                .or(file.minimum_duration)
                .unwrap_or(DEFAULT_MINIMUM_DURATION_MS),
            safety_buffer_ms: self
                .safety_buffer
                .or(file.safety_buffer)
                .unwrap_or(DEFAULT_SAFETY_BUFFER_MS),
            log: LogConfig {
                console: self
                    .log_level_console
                    .or(file.log_level_console)
                    .unwrap_or(LogLevel::Info),
                file_level: self
                    .log_level_file
                    .or(file.log_level_file)
                    .unwrap_or(LogLevel::Debug),
                file: self.log_file.or(file.log_file),
            },
            post_process: PostProcessConfig {
                trim: self.trim || file.trim.unwrap_or(false),
                crop: self.crop || file.crop.unwrap_or(false),
                keep_original: self.keep_original || file.keep_original.unwrap_or(false),
            },
            encode: EncodeSettings {
                crf: self.crf.or(file.crf).unwrap_or(encode_defaults.crf),
                preset: self.preset.or(file.preset).unwrap_or(encode_defaults.preset),
                threads: self.threads.or(file.threads).unwrap_or(encode_defaults.threads),
            },
            detection: file.detection,
            ffmpeg: self.ffmpeg.or(file.ffmpeg),
            ffprobe: self.ffprobe.or(file.ffprobe),
        })
    }
}

pub fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("invalid config file {}", path.display()))
}
