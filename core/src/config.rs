use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use crate::segment::{plan, RangePlan};

pub const LOG_FILE_NAME: &str = "log.txt";

/// Process-wide settings owned by the host application. This crate only
/// ever reads them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub proxy: String,
    pub referer_url: String,
    pub use_cookies: bool,
    pub cookie_file_path: PathBuf,
    pub username: String,
    pub password: String,
    pub log_level: u8,
    pub headers: HashMap<String, String>,
    pub segment_size: u64,
    pub max_connections: u32,
    pub settings_folder: PathBuf,
    pub ca_bundle: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        let home = env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        let settings_folder = PathBuf::from(home).join(".segfetch");
        Self {
            proxy: String::new(),
            referer_url: String::new(),
            use_cookies: false,
            cookie_file_path: settings_folder.join("cookies.txt"),
            username: String::new(),
            password: String::new(),
            log_level: 2,
            headers: default_headers(),
            segment_size: 1024 * 1024,
            max_connections: 10,
            settings_folder,
            ca_bundle: None,
        }
    }
}

impl Settings {
    /// Defaults overlaid with any `SEGFETCH_*` environment variables.
    pub fn from_env() -> Self {
        let mut settings = Settings::default();
        if let Ok(dir) = env::var("SEGFETCH_HOME") {
            settings.cookie_file_path = PathBuf::from(&dir).join("cookies.txt");
            settings.settings_folder = PathBuf::from(dir);
        }
        if let Ok(proxy) = env::var("SEGFETCH_PROXY") {
            settings.proxy = proxy;
        }
        if let Ok(referer) = env::var("SEGFETCH_REFERER") {
            settings.referer_url = referer;
        }
        if let Ok(path) = env::var("SEGFETCH_COOKIE_FILE") {
            settings.use_cookies = true;
            settings.cookie_file_path = PathBuf::from(path);
        }
        if let Ok(user) = env::var("SEGFETCH_USERNAME") {
            settings.username = user;
        }
        if let Ok(pass) = env::var("SEGFETCH_PASSWORD") {
            settings.password = pass;
        }
        if let Some(level) = env_parse::<u8>("SEGFETCH_LOG_LEVEL") {
            settings.log_level = level;
        }
        if let Some(size) = env_parse::<u64>("SEGFETCH_SEGMENT_SIZE") {
            settings.segment_size = size;
        }
        if let Some(count) = env_parse::<u32>("SEGFETCH_MAX_CONNECTIONS") {
            settings.max_connections = count;
        }
        if let Ok(path) = env::var("SEGFETCH_CA_BUNDLE") {
            settings.ca_bundle = Some(PathBuf::from(path));
        }
        settings
    }

    pub fn log_file(&self) -> PathBuf {
        self.settings_folder.join(LOG_FILE_NAME)
    }

    pub fn plan(&self, file_size: u64) -> RangePlan {
        plan(file_size, self.segment_size, self.max_connections)
    }

    /// Snapshot of everything a single outbound request needs.
    pub fn request_options(&self) -> RequestOptions {
        RequestOptions {
            proxy: self.proxy.clone(),
            referer_url: self.referer_url.clone(),
            cookie_file: if self.use_cookies {
                Some(self.cookie_file_path.clone())
            } else {
                None
            },
            username: self.username.clone(),
            password: self.password.clone(),
            log_level: self.log_level,
            headers: self.headers.clone(),
            ca_bundle: self.ca_bundle.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub proxy: String,
    pub referer_url: String,
    pub cookie_file: Option<PathBuf>,
    pub username: String,
    pub password: String,
    pub log_level: u8,
    pub headers: HashMap<String, String>,
    pub ca_bundle: Option<PathBuf>,
}

pub fn default_headers() -> HashMap<String, String> {
    let mut headers = HashMap::new();
    headers.insert(
        "User-Agent".to_string(),
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:120.0) Gecko/20100101 Firefox/120.0"
            .to_string(),
    );
    headers.insert(
        "Accept".to_string(),
        "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
    );
    headers.insert("Accept-Language".to_string(), "en-us,en;q=0.5".to_string());
    headers.insert("Accept-Encoding".to_string(), "identity".to_string());
    headers
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_file_only_when_enabled() {
        let mut settings = Settings::default();
        assert_eq!(settings.request_options().cookie_file, None);
        settings.use_cookies = true;
        assert_eq!(
            settings.request_options().cookie_file,
            Some(settings.cookie_file_path.clone())
        );
    }

    #[test]
    fn log_file_lives_in_settings_folder() {
        let mut settings = Settings::default();
        settings.settings_folder = PathBuf::from("/var/lib/segfetch");
        assert_eq!(settings.log_file(), PathBuf::from("/var/lib/segfetch/log.txt"));
    }

    #[test]
    fn plan_uses_configured_limits() {
        let mut settings = Settings::default();
        settings.segment_size = 100;
        settings.max_connections = 3;
        assert_eq!(settings.plan(1_000).len(), 3);
        assert_eq!(settings.plan(0), vec![None]);
    }
}
