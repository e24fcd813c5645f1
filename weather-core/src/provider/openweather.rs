use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::{
    config::{DEFAULT_BASE_URL, DEFAULT_LANG},
    error::WeatherError,
    model::WeatherReading,
};

use super::WeatherProvider;

const CURRENT_WEATHER_PATH: &str = "/data/2.5/weather";

#[derive(Debug, Clone)]
pub struct OpenWeatherProvider {
    api_key: Option<String>,
    base_url: String,
    lang: String,
    http: Client,
}

impl OpenWeatherProvider {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            lang: DEFAULT_LANG.to_string(),
            http: Client::new(),
        }
    }

    /// Point the provider at another host, e.g. a mock server in tests.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_lang(mut self, lang: &str) -> Self {
        self.lang = lang.to_string();
        self
    }

    async fn fetch_current(&self, api_key: &str, city: &str) -> Result<OwCurrentResponse> {
        let url = format!("{}{}", self.base_url, CURRENT_WEATHER_PATH);

        let res = self
            .http
            .get(&url)
            .query(&[
                ("q", city),
                ("appid", api_key),
                ("units", "metric"),
                ("lang", self.lang.as_str()),
            ])
            .send()
            .await
            .context("Failed to send request to OpenWeather (current weather)")?;

        let status = res.status();
        let body = res
            .text()
            .await
            .context("Failed to read OpenWeather current response body")?;

        if !status.is_success() {
            let message = serde_json::from_str::<OwErrorResponse>(&body)
                .ok()
                .and_then(|e| e.message)
                .unwrap_or_else(|| truncate_body(&body));
            return Err(anyhow!(
                "OpenWeather current request failed with status {}: {}",
                status,
                message,
            ));
        }

        serde_json::from_str(&body).context("Failed to parse OpenWeather current JSON")
    }
}

#[async_trait]
impl WeatherProvider for OpenWeatherProvider {
    async fn current(&self, city: &str) -> Result<WeatherReading, WeatherError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(WeatherError::Config);
        };

        match self.fetch_current(api_key, city).await {
            Ok(parsed) => Ok(parsed.normalize(city)),
            Err(cause) => {
                tracing::debug!(%city, cause = ?cause, "current weather lookup failed");
                Err(WeatherError::NotFound)
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OwMain {
    temp: Option<f64>,
    humidity: Option<u8>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OwWeather {
    description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OwWind {
    speed: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OwCurrentResponse {
    name: Option<String>,
    main: OwMain,
    weather: Vec<OwWeather>,
    wind: OwWind,
}

#[derive(Debug, Deserialize)]
struct OwErrorResponse {
    message: Option<String>,
}

impl OwCurrentResponse {
    /// Missing numeric fields become zero and a missing description becomes
    /// empty. A blank provider name falls back to the requested city.
    fn normalize(self, requested_city: &str) -> WeatherReading {
        let city = self
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| requested_city.to_string());

        let description = self
            .weather
            .into_iter()
            .next()
            .and_then(|w| w.description)
            .unwrap_or_default();

        WeatherReading {
            city,
            temperature_c: round_half_up(self.main.temp.unwrap_or(0.0)),
            description,
            humidity_pct: self.main.humidity.unwrap_or(0),
            wind_speed_mps: self.wind.speed.unwrap_or(0.0),
        }
    }
}

/// Rounds halves toward positive infinity, so `-2.5` becomes `-2`.
fn round_half_up(value: f64) -> i32 {
    (value + 0.5).floor() as i32
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
