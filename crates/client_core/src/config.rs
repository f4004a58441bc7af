use std::{fs, path::Path, time::Duration};

use toml::{Table, Value};

use crate::media::PipelineOptions;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(2000);
pub const SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub server_url: String,
    pub locale: String,
    pub role: String,
    pub features: Vec<String>,
    pub model_id: String,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_image_dimension: u32,
    pub jpeg_quality: u8,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            locale: "en".into(),
            role: "parent".into(),
            features: vec!["home_tips".into(), "conversation_guide".into()],
            model_id: "drawing-insight-v1".into(),
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: 2000,
            max_image_dimension: 1024,
            jpeg_quality: 80,
        }
    }
}

impl ClientSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            max_dimension: self.max_image_dimension.max(1),
            jpeg_quality: self.jpeg_quality.clamp(1, 100),
        }
    }
}

/// Bounded linear backoff for automatic resubmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Delay before automatic retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.checked_mul(retry).unwrap_or(Duration::MAX)
    }

    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    file: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(file) {
        match raw.parse::<Table>() {
            Ok(file_cfg) => apply_overrides(&mut settings, |key| {
                file_cfg.get(key).and_then(|value| setting_text(key, value))
            }),
            Err(err) => tracing::warn!(
                path = %file.display(),
                error = %err,
                "ignoring unreadable client settings file"
            ),
        }
    }

    if let Some(v) = env("INSIGHT_SERVER_URL") {
        settings.server_url = v;
    }
    apply_overrides(&mut settings, |key| {
        env(&format!("APP__{}", key.to_ascii_uppercase()))
    });

    settings
}

/// Scalars and string arrays read the same way as their env-var spelling.
fn setting_text(key: &str, value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Integer(number) => Some(number.to_string()),
        Value::Float(number) => Some(number.to_string()),
        Value::Boolean(flag) => Some(flag.to_string()),
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .map(|items| items.join(",")),
        Value::Datetime(_) | Value::Table(_) => {
            tracing::warn!(key, "ignoring client setting with unsupported type");
            None
        }
    }
}

fn apply_overrides(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("server_url") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("locale") {
        settings.locale = v;
    }
    if let Some(v) = lookup("role") {
        settings.role = v;
    }
    if let Some(v) = lookup("features") {
        settings.features = v
            .split(',')
            .map(str::trim)
            .filter(|feature| !feature.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(v) = lookup("model_id") {
        settings.model_id = v;
    }
    if let Some(parsed) = parsed_setting(&lookup, "max_retries") {
        settings.max_retries = parsed;
    }
    if let Some(parsed) = parsed_setting(&lookup, "base_delay_ms") {
        settings.base_delay_ms = parsed;
    }
    if let Some(parsed) = parsed_setting(&lookup, "max_image_dimension") {
        settings.max_image_dimension = parsed;
    }
    if let Some(parsed) = parsed_setting(&lookup, "jpeg_quality") {
        settings.jpeg_quality = parsed;
    }
}

fn parsed_setting<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable client setting");
            None
        }
    }
}
