use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

use crate::geo::Coordinate;

const DEFAULT_DIAGNOSTICS_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_DIAGNOSTICS_MAX_FILES: usize = 5;
const DEFAULT_CENTER: Coordinate = Coordinate {
    lat: 55.7558,
    lon: 37.6173,
};

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub city_name: String,
    pub region_hint: String,
    pub max_distance_km: f64,
    pub ttl_hours: u64,
    pub sweep_interval_secs: u64,
    pub default_center: Coordinate,
    pub geocoder_base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub geocoder_rate_limit_qps: u32,
    pub model_api_key: Option<SecretString>,
    pub model_name: String,
    pub model_base_url: String,
    pub data_dir: PathBuf,
    pub database_file_name: String,
    pub db_busy_timeout_ms: u64,
    pub commit_retries: u32,
    pub commit_base_delay_ms: u64,
    pub lexicon_path: Option<PathBuf>,
    pub diagnostics_enabled: bool,
    pub diagnostics_batch_size: usize,
    pub diagnostics_max_bytes: u64,
    pub diagnostics_max_files: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub city_name: String,
    pub region_hint: String,
    pub max_distance_km: f64,
    pub ttl_hours: u64,
    pub sweep_interval_secs: u64,
    pub model_name: String,
    pub has_model_key: bool,
    pub database_file_name: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            city_name: "Долгопрудный".into(),
            region_hint: "Московская область".into(),
            max_distance_km: 25.0,
            ttl_hours: 12,
            sweep_interval_secs: 600,
            default_center: DEFAULT_CENTER,
            geocoder_base_url: "https://nominatim.openstreetmap.org".into(),
            user_agent: concat!("chatmap/", env!("CARGO_PKG_VERSION")).into(),
            http_timeout_secs: 20,
            geocoder_rate_limit_qps: 1,
            model_api_key: None,
            model_name: "gpt-4o-mini".into(),
            model_base_url: "https://api.openai.com/v1".into(),
            data_dir: PathBuf::from("./data"),
            database_file_name: "chatmap.db".into(),
            db_busy_timeout_ms: 30_000,
            commit_retries: 8,
            commit_base_delay_ms: 200,
            lexicon_path: None,
            diagnostics_enabled: true,
            diagnostics_batch_size: 10,
            diagnostics_max_bytes: DEFAULT_DIAGNOSTICS_MAX_BYTES,
            diagnostics_max_files: DEFAULT_DIAGNOSTICS_MAX_FILES,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let d = Self::default();
        Self {
            city_name: parse_string("CITY_NAME", &d.city_name),
            region_hint: parse_string("GEO_REGION_HINT", &d.region_hint),
            max_distance_km: parse_f64("MAX_DISTANCE_KM", d.max_distance_km).max(0.0),
            ttl_hours: parse_u64("TTL_HOURS", d.ttl_hours),
            sweep_interval_secs: parse_u64("SWEEP_INTERVAL_SECS", d.sweep_interval_secs).max(1),
            default_center: Coordinate {
                lat: parse_f64("DEFAULT_CENTER_LAT", d.default_center.lat),
                lon: parse_f64("DEFAULT_CENTER_LON", d.default_center.lon),
            },
            geocoder_base_url: parse_string("NOMINATIM_BASE_URL", &d.geocoder_base_url),
            user_agent: parse_string("GEOCODER_USER_AGENT", &d.user_agent),
            http_timeout_secs: parse_u64("HTTP_TIMEOUT_SECS", d.http_timeout_secs).max(1),
            geocoder_rate_limit_qps: parse_u32(
                "GEOCODER_RATE_LIMIT_QPS",
                d.geocoder_rate_limit_qps,
            )
            .max(1),
            model_api_key: env::var("OPENAI_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            model_name: parse_string("OPENAI_MODEL", &d.model_name),
            model_base_url: parse_string("OPENAI_BASE_URL", &d.model_base_url),
            data_dir: env::var("DATA_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(d.data_dir),
            database_file_name: parse_string("DATABASE_FILE_NAME", &d.database_file_name),
            db_busy_timeout_ms: parse_u64("DB_BUSY_TIMEOUT_MS", d.db_busy_timeout_ms),
            commit_retries: parse_u32("COMMIT_RETRIES", d.commit_retries).max(1),
            commit_base_delay_ms: parse_u64("COMMIT_BASE_DELAY_MS", d.commit_base_delay_ms),
            lexicon_path: env::var("LEXICON_PATH")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            diagnostics_enabled: parse_bool("DIAGNOSTICS_ENABLED", d.diagnostics_enabled),
            diagnostics_batch_size: parse_usize(
                "DIAGNOSTICS_BATCH_SIZE",
                d.diagnostics_batch_size,
            )
            .max(1),
            diagnostics_max_bytes: parse_u64("DIAGNOSTICS_MAX_BYTES", d.diagnostics_max_bytes),
            diagnostics_max_files: parse_usize(
                "DIAGNOSTICS_MAX_FILES",
                d.diagnostics_max_files,
            )
            .max(1),
        }
    }

    pub fn db_busy_timeout(&self) -> Duration {
        Duration::from_millis(self.db_busy_timeout_ms)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            city_name: self.city_name.clone(),
            region_hint: self.region_hint.clone(),
            max_distance_km: self.max_distance_km,
            ttl_hours: self.ttl_hours,
            sweep_interval_secs: self.sweep_interval_secs,
            model_name: self.model_name.clone(),
            has_model_key: self.model_api_key.is_some(),
            database_file_name: self.database_file_name.clone(),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.ttl_hours as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn commit_base_delay(&self) -> Duration {
        Duration::from_millis(self.commit_base_delay_ms)
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
pub(crate) fn test_config(data_dir: &std::path::Path) -> AppConfig {
    AppConfig {
        geocoder_base_url: "http://127.0.0.1:9".into(),
        user_agent: "chatmap-test".into(),
        http_timeout_secs: 2,
        geocoder_rate_limit_qps: 20,
        model_base_url: "http://127.0.0.1:9".into(),
        data_dir: data_dir.to_path_buf(),
        database_file_name: "test.db".into(),
        db_busy_timeout_ms: 1_000,
        commit_base_delay_ms: 1,
        diagnostics_batch_size: 1,
        diagnostics_max_bytes: 1024,
        diagnostics_max_files: 3,
        ..AppConfig::default()
    }
}
