use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WeatherError;

/// One normalized weather snapshot for a city at fetch time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReading {
    pub city: String,
    pub temperature_c: i32,
    pub description: String,
    pub humidity_pct: u8,
    pub wind_speed_mps: f64,
}

/// Transient state of a [`crate::WeatherClient`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientState {
    /// City of the last successful lookup, as the caller typed it.
    pub last_city: Option<String>,
    pub reading: Option<WeatherReading>,
    pub error: Option<WeatherError>,
    /// Number of completed successful requests.
    pub request_count: u64,
    pub in_flight: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ClientState {
    pub fn error_message(&self) -> Option<String> {
        self.error.map(|e| e.to_string())
    }
}
