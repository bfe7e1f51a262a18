use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Deserialize)]
struct Config {
    application: Application,
    audio: Audio,
    network: Network,
    session: Session,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
    input_sample_rate: u32,
    output_sample_rate: u32,
    playback_channels: u32,
    frame_size: usize,
    playback_period_frames: usize,
}

#[derive(Deserialize)]
struct Network {
    ws_url: String,
    api_key_env: String,
    connect_timeout_ms: u64,
    outbound_queue_capacity: usize,
}

#[derive(Deserialize)]
struct Session {
    model: String,
    voice: String,
    assistant_name: String,
    system_instruction: String,
    speaker_timeout_ms: u64,
    teardown_timeout_ms: u64,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 音频配置
    println!("cargo:rustc-env=CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=INPUT_SAMPLE_RATE={}", config.audio.input_sample_rate);
    println!("cargo:rustc-env=OUTPUT_SAMPLE_RATE={}", config.audio.output_sample_rate);
    println!("cargo:rustc-env=PLAYBACK_CHANNELS={}", config.audio.playback_channels);
    println!("cargo:rustc-env=FRAME_SIZE={}", config.audio.frame_size);
    println!("cargo:rustc-env=PLAYBACK_PERIOD_FRAMES={}", config.audio.playback_period_frames);

    // 网络配置
    println!("cargo:rustc-env=WS_URL={}", config.network.ws_url);
    println!("cargo:rustc-env=API_KEY_ENV={}", config.network.api_key_env);
    println!("cargo:rustc-env=CONNECT_TIMEOUT_MS={}", config.network.connect_timeout_ms);
    println!("cargo:rustc-env=OUTBOUND_QUEUE_CAPACITY={}", config.network.outbound_queue_capacity);

    // 会话配置
    println!("cargo:rustc-env=SESSION_MODEL={}", config.session.model);
    println!("cargo:rustc-env=SESSION_VOICE={}", config.session.voice);
    println!("cargo:rustc-env=ASSISTANT_NAME={}", config.session.assistant_name);
    println!("cargo:rustc-env=SYSTEM_INSTRUCTION={}", config.session.system_instruction);
    println!("cargo:rustc-env=SPEAKER_TIMEOUT_MS={}", config.session.speaker_timeout_ms);
    println!("cargo:rustc-env=TEARDOWN_TIMEOUT_MS={}", config.session.teardown_timeout_ms);
}
