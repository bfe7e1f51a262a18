use std::time::Duration;

/// Fallback variable consulted when the configured API-key variable is unset.
const FALLBACK_API_KEY_ENV: &str = "API_KEY";

#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: &'static str,
    pub app_version: &'static str,

    // 音频设备配置
    pub capture_device: &'static str,
    pub playback_device: &'static str,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub playback_channels: u32,
    pub frame_size: usize,
    pub playback_period_frames: usize,

    // 网络配置
    pub ws_url: &'static str,
    pub api_key_env: &'static str,
    pub connect_timeout: Duration,
    pub outbound_queue_capacity: usize,

    // 会话配置
    pub model: &'static str,
    pub voice: &'static str,
    pub assistant_name: &'static str,
    pub system_instruction: &'static str,
    pub speaker_timeout: Duration,
    pub teardown_timeout: Duration,

    /// Credential for the live service. `None` selects simulation mode.
    pub api_key: Option<String>,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取，只有 API key 在运行时读取
    pub fn new() -> Result<Self, &'static str> {
        let api_key_env = env!("API_KEY_ENV");
        Ok(Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),

            capture_device: env!("CAPTURE_DEVICE"),
            playback_device: env!("PLAYBACK_DEVICE"),
            input_sample_rate: env!("INPUT_SAMPLE_RATE")
                .parse()
                .map_err(|_| "Failed to parse INPUT_SAMPLE_RATE")?,
            output_sample_rate: env!("OUTPUT_SAMPLE_RATE")
                .parse()
                .map_err(|_| "Failed to parse OUTPUT_SAMPLE_RATE")?,
            playback_channels: env!("PLAYBACK_CHANNELS")
                .parse()
                .map_err(|_| "Failed to parse PLAYBACK_CHANNELS")?,
            frame_size: env!("FRAME_SIZE")
                .parse()
                .map_err(|_| "Failed to parse FRAME_SIZE")?,
            playback_period_frames: env!("PLAYBACK_PERIOD_FRAMES")
                .parse()
                .map_err(|_| "Failed to parse PLAYBACK_PERIOD_FRAMES")?,

            ws_url: env!("WS_URL"),
            api_key_env,
            connect_timeout: Duration::from_millis(
                env!("CONNECT_TIMEOUT_MS")
                    .parse()
                    .map_err(|_| "Failed to parse CONNECT_TIMEOUT_MS")?,
            ),
            outbound_queue_capacity: env!("OUTBOUND_QUEUE_CAPACITY")
                .parse()
                .map_err(|_| "Failed to parse OUTBOUND_QUEUE_CAPACITY")?,

            model: env!("SESSION_MODEL"),
            voice: env!("SESSION_VOICE"),
            assistant_name: env!("ASSISTANT_NAME"),
            system_instruction: env!("SYSTEM_INSTRUCTION"),
            speaker_timeout: Duration::from_millis(
                env!("SPEAKER_TIMEOUT_MS")
                    .parse()
                    .map_err(|_| "Failed to parse SPEAKER_TIMEOUT_MS")?,
            ),
            teardown_timeout: Duration::from_millis(
                env!("TEARDOWN_TIMEOUT_MS")
                    .parse()
                    .map_err(|_| "Failed to parse TEARDOWN_TIMEOUT_MS")?,
            ),

            api_key: resolve_api_key(api_key_env, |name| std::env::var(name).ok()),
        })
    }

    /// The system instruction with the channel name filled in.
    pub fn instruction_for(&self, channel_name: &str) -> String {
        self.system_instruction.replace("{channel}", channel_name)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new().expect("Failed to create default Config from build-time environment variables")
    }
}

/// Looks the key up under `primary`, then under `API_KEY`. Blank values count as missing.
pub fn resolve_api_key<F>(primary: &str, lookup: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    [primary, FALLBACK_API_KEY_ENV]
        .into_iter()
        .filter_map(|name| lookup(name))
        .map(|key| key.trim().to_string())
        .find(|key| !key.is_empty())
}
