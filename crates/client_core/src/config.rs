use std::{collections::HashMap, fs, time::Duration};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub ws_base_url: String,
    pub request_timeout: Duration,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8001".into(),
            ws_base_url: "ws://localhost:9000".into(),
            request_timeout: Duration::from_secs(30),
            reconnect_base_delay: Duration::from_secs(1),
            max_reconnect_attempts: 5,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

pub fn load_config() -> ClientConfig {
    let mut config = ClientConfig::default();

    if let Ok(raw) = fs::read_to_string("client.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("api_base_url") {
                config.api_base_url = v.clone();
            }
            if let Some(v) = file_cfg.get("ws_base_url") {
                config.ws_base_url = v.clone();
            }
        }
    }

    if let Ok(v) = std::env::var("CHAT_API_BASE_URL") {
        config.api_base_url = v;
    }
    if let Ok(v) = std::env::var("CHAT_WS_BASE_URL") {
        config.ws_base_url = v;
    }
    if let Ok(v) = std::env::var("CHAT_REQUEST_TIMEOUT_SECONDS") {
        if let Ok(parsed) = v.parse::<u64>() {
            config.request_timeout = Duration::from_secs(parsed);
        }
    }
    if let Ok(v) = std::env::var("CHAT_HEARTBEAT_SECONDS") {
        if let Ok(parsed) = v.parse::<u64>() {
            config.heartbeat_interval = Duration::from_secs(parsed);
        }
    }

    config
}
