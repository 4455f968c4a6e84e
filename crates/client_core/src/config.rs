use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;
use url::Url;

const SETTINGS_FILE: &str = "picsta.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub api_base_url: String,
    pub socket_url: Option<String>,
    pub session_cookie: Option<String>,
    pub request_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub poll_interval: Duration,
    pub history_page_size: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:5000".into(),
            socket_url: None,
            session_cookie: None,
            request_timeout: Duration::from_secs(10),
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(25),
            heartbeat_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(30),
            history_page_size: 30,
        }
    }
}

impl ClientSettings {
    /// Socket endpoint. Falls back to the API origin with a websocket scheme.
    pub fn resolved_socket_url(&self) -> anyhow::Result<String> {
        if let Some(url) = &self.socket_url {
            return Ok(url.clone());
        }
        derive_socket_url(&self.api_base_url)
    }

    pub fn page_size(&self) -> u32 {
        self.history_page_size.clamp(1, 100)
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    api_base_url: Option<String>,
    socket_url: Option<String>,
    session_cookie: Option<String>,
    request_timeout_ms: Option<u64>,
    backoff_initial_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    heartbeat_timeout_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    history_page_size: Option<u32>,
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file_settings(&mut settings, file_cfg),
            Err(err) => warn!(path = %path.display(), "config: ignoring unreadable settings file: {err}"),
        }
    }

    let lookup = |primary: &str, alias: &str| env(alias).or_else(|| env(primary));

    if let Some(v) = lookup("PICSTA_API_URL", "APP__API_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = lookup("PICSTA_SOCKET_URL", "APP__SOCKET_URL") {
        settings.socket_url = Some(v);
    }
    if let Some(v) = lookup("PICSTA_SESSION_COOKIE", "APP__SESSION_COOKIE") {
        settings.session_cookie = Some(v);
    }

    let durations: [(&str, &str, &mut Duration); 6] = [
        (
            "PICSTA_REQUEST_TIMEOUT_MS",
            "APP__REQUEST_TIMEOUT_MS",
            &mut settings.request_timeout,
        ),
        (
            "PICSTA_BACKOFF_INITIAL_MS",
            "APP__BACKOFF_INITIAL_MS",
            &mut settings.backoff_initial,
        ),
        (
            "PICSTA_BACKOFF_MAX_MS",
            "APP__BACKOFF_MAX_MS",
            &mut settings.backoff_max,
        ),
        (
            "PICSTA_HEARTBEAT_INTERVAL_MS",
            "APP__HEARTBEAT_INTERVAL_MS",
            &mut settings.heartbeat_interval,
        ),
        (
            "PICSTA_HEARTBEAT_TIMEOUT_MS",
            "APP__HEARTBEAT_TIMEOUT_MS",
            &mut settings.heartbeat_timeout,
        ),
        (
            "PICSTA_POLL_INTERVAL_MS",
            "APP__POLL_INTERVAL_MS",
            &mut settings.poll_interval,
        ),
    ];
    for (primary, alias, target) in durations {
        if let Some(raw) = lookup(primary, alias) {
            match raw.parse::<u64>() {
                Ok(ms) => *target = Duration::from_millis(ms),
                Err(_) => warn!(key = primary, value = %raw, "config: ignoring invalid duration"),
            }
        }
    }

    if let Some(raw) = lookup("PICSTA_HISTORY_PAGE_SIZE", "APP__HISTORY_PAGE_SIZE") {
        match raw.parse::<u32>() {
            Ok(size) => settings.history_page_size = size,
            Err(_) => warn!(value = %raw, "config: ignoring invalid history page size"),
        }
    }

    settings
}

fn apply_file_settings(settings: &mut ClientSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.api_base_url {
        settings.api_base_url = v;
    }
    if file_cfg.socket_url.is_some() {
        settings.socket_url = file_cfg.socket_url;
    }
    if file_cfg.session_cookie.is_some() {
        settings.session_cookie = file_cfg.session_cookie;
    }
    if let Some(ms) = file_cfg.request_timeout_ms {
        settings.request_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = file_cfg.backoff_initial_ms {
        settings.backoff_initial = Duration::from_millis(ms);
    }
    if let Some(ms) = file_cfg.backoff_max_ms {
        settings.backoff_max = Duration::from_millis(ms);
    }
    if let Some(ms) = file_cfg.heartbeat_interval_ms {
        settings.heartbeat_interval = Duration::from_millis(ms);
    }
    if let Some(ms) = file_cfg.heartbeat_timeout_ms {
        settings.heartbeat_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = file_cfg.poll_interval_ms {
        settings.poll_interval = Duration::from_millis(ms);
    }
    if let Some(size) = file_cfg.history_page_size {
        settings.history_page_size = size;
    }
}

fn derive_socket_url(api_base_url: &str) -> anyhow::Result<String> {
    let mut url = Url::parse(api_base_url)?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => anyhow::bail!("api_base_url must use http or https, got {other}"),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("cannot switch {api_base_url} to a websocket scheme"))?;
    url.set_path("/socket");
    url.set_query(None);
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        env,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn derives_websocket_url_from_api_origin() {
        let settings = ClientSettings {
            api_base_url: "https://picsta.example/api".into(),
            ..ClientSettings::default()
        };
        assert_eq!(
            settings.resolved_socket_url().expect("socket url"),
            "wss://picsta.example/socket"
        );
    }

    #[test]
    fn explicit_socket_url_wins() {
        let settings = ClientSettings {
            socket_url: Some("ws://localhost:9000/rt".into()),
            ..ClientSettings::default()
        };
        assert_eq!(
            settings.resolved_socket_url().expect("socket url"),
            "ws://localhost:9000/rt"
        );
    }

    #[test]
    fn env_overrides_file_and_ignores_garbage() {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = env::temp_dir().join(format!("picsta_settings_{suffix}.toml"));
        fs::write(
            &path,
            "api_base_url = \"http://file.example\"\npoll_interval_ms = 1000\nhistory_page_size = 50\n",
        )
        .expect("write settings");

        let vars: HashMap<&str, &str> = HashMap::from([
            ("PICSTA_API_URL", "http://env.example"),
            ("APP__BACKOFF_MAX_MS", "2000"),
            ("PICSTA_HEARTBEAT_TIMEOUT_MS", "soon"),
        ]);
        let settings = load_settings_from(&path, |key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(settings.api_base_url, "http://env.example");
        assert_eq!(settings.poll_interval, Duration::from_millis(1000));
        assert_eq!(settings.backoff_max, Duration::from_millis(2000));
        assert_eq!(
            settings.heartbeat_timeout,
            ClientSettings::default().heartbeat_timeout
        );
        assert_eq!(settings.history_page_size, 50);

        fs::remove_file(path).expect("cleanup");
    }

    #[test]
    fn missing_file_keeps_defaults() {
        let settings = load_settings_from(Path::new("/nonexistent/picsta.toml"), no_env);
        assert_eq!(settings, ClientSettings::default());
    }

    #[test]
    fn page_size_is_clamped() {
        let settings = ClientSettings {
            history_page_size: 500,
            ..ClientSettings::default()
        };
        assert_eq!(settings.page_size(), 100);
    }
}
