use std::env;

use crate::error::AppError;
use crate::models::item::GeoPoint;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub item_queue_size: usize,
    pub event_buffer_size: usize,
    pub optimizer_timeout_secs: u64,
    pub stop_service_minutes: u32,
    pub max_stops_per_optimizer_call: usize,
    pub home_base: GeoPoint,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            item_queue_size: parse_or_default("ITEM_QUEUE_SIZE", 1024)?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            optimizer_timeout_secs: parse_or_default("OPTIMIZER_TIMEOUT_SECS", 20)?,
            stop_service_minutes: parse_or_default("STOP_SERVICE_MINUTES", 5)?,
            max_stops_per_optimizer_call: parse_or_default("MAX_STOPS_PER_OPTIMIZER_CALL", 25)?,
            home_base: GeoPoint {
                lat: parse_or_default("HOME_BASE_LAT", 53.5511)?,
                lng: parse_or_default("HOME_BASE_LNG", 9.9937)?,
            },
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
