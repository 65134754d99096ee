use crate::sfu::{SfuHub, SfuSettings};
use crate::signaling::{SignalingHub, SignalingSettings};
use crate::transport::MediaTransport;
use fanout_media::RecordingOptions;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_address: String,
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
    pub sfu: SfuConfig,
    pub signaling: SignalingConfig,
    pub recording: RecordingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    pub keyframe_interval_ms: u64,
    /// 0 waits forever
    pub track_wait_timeout_ms: u64,
    /// Extra time a join gives the audio track once video is ready
    pub audio_wait_ms: u64,
    pub stream_label: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub pong_wait_secs: u64,
    pub write_wait_secs: u64,
    pub max_message_size: usize,
    pub send_queue_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub enabled: bool,
    pub directory: PathBuf,
    pub queue_capacity: usize,
    pub width: u16,
    pub height: u16,
    pub frame_rate: u32,
    pub time_scale: u32,
    pub opus_sample_rate: u32,
    pub opus_channels: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: vec![],
            sfu: SfuConfig::default(),
            signaling: SignalingConfig::default(),
            recording: RecordingConfig::default(),
        }
    }
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            keyframe_interval_ms: 3000,
            track_wait_timeout_ms: 10_000,
            audio_wait_ms: 500,
            stream_label: "fanout".to_string(),
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            pong_wait_secs: 60,
            write_wait_secs: 10,
            max_message_size: 65535,
            send_queue_capacity: 256,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        let options = RecordingOptions::default();
        Self {
            enabled: false,
            directory: options.directory,
            queue_capacity: options.queue_capacity,
            width: options.width,
            height: options.height,
            frame_rate: options.frame_rate,
            time_scale: options.time_scale,
            opus_sample_rate: options.opus_sample_rate,
            opus_channels: options.opus_channels,
        }
    }
}

impl Config {
    /// Defaults, then `fanout.toml` if present, then `FANOUT_*` environment
    /// variables (`FANOUT_SFU__KEYFRAME_INTERVAL_MS=1000`)
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("fanout").required(false))
            .add_source(
                config::Environment::with_prefix("FANOUT")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("stun_servers"),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Parse a TOML document on top of the defaults
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn sfu_settings(&self) -> SfuSettings {
        let recording = self.recording.enabled.then(|| RecordingOptions {
            directory: self.recording.directory.clone(),
            queue_capacity: self.recording.queue_capacity,
            width: self.recording.width,
            height: self.recording.height,
            frame_rate: self.recording.frame_rate,
            time_scale: self.recording.time_scale,
            opus_sample_rate: self.recording.opus_sample_rate,
            opus_channels: self.recording.opus_channels,
        });

        SfuSettings {
            keyframe_interval: Duration::from_millis(self.sfu.keyframe_interval_ms),
            track_wait_timeout: match self.sfu.track_wait_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            audio_wait: Duration::from_millis(self.sfu.audio_wait_ms),
            stream_label: self.sfu.stream_label.clone(),
            recording,
        }
    }

    pub fn signaling_settings(&self) -> SignalingSettings {
        SignalingSettings {
            pong_wait: Duration::from_secs(self.signaling.pong_wait_secs),
            write_wait: Duration::from_secs(self.signaling.write_wait_secs),
            max_message_size: self.signaling.max_message_size,
            send_queue_capacity: self.signaling.send_queue_capacity,
        }
    }
}

pub struct AppState<T: MediaTransport> {
    pub config: Arc<Config>,
    pub sfu: SfuHub<T>,
    pub signaling: Arc<SignalingHub>,
    pub signaling_settings: SignalingSettings,
}

impl<T: MediaTransport> Clone for AppState<T> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            sfu: self.sfu.clone(),
            signaling: self.signaling.clone(),
            signaling_settings: self.signaling_settings.clone(),
        }
    }
}

impl<T: MediaTransport> AppState<T> {
    /// Build the registries. Spawns the SFU hub task, so this needs a
    /// running tokio runtime.
    pub fn new(config: Config, transport: Arc<T>) -> Self {
        let signaling_settings = config.signaling_settings();
        let sfu = SfuHub::spawn(transport, config.sfu_settings());
        let signaling = Arc::new(SignalingHub::new(signaling_settings.write_wait));

        Self {
            config: Arc::new(config),
            sfu,
            signaling,
            signaling_settings,
        }
    }
}
