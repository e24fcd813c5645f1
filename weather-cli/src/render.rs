use std::{fmt::Write, time::Duration};

use chrono::Local;
use weather_core::{ClientState, WeatherReading};

pub const PLACEHOLDER: &str = "No data yet. Enter a city to look up the weather.";
pub const EMPTY_HISTORY: &str = "history is empty";

pub fn reading(r: &WeatherReading) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", r.city);
    let _ = writeln!(out, "  {}°C", r.temperature_c);
    if !r.description.is_empty() {
        let _ = writeln!(out, "  {}", r.description);
    }
    let _ = writeln!(out, "  Humidity: {}%", r.humidity_pct);
    let _ = write!(out, "  Wind: {} m/s", r.wind_speed_mps);
    out
}

/// Result panel (or placeholder), error line and request counter.
pub fn state(s: &ClientState) -> String {
    let mut out = match &s.reading {
        Some(r) => reading(r),
        None => PLACEHOLDER.to_string(),
    };

    if let Some(at) = s.updated_at.filter(|_| s.reading.is_some()) {
        let _ = write!(out, "\n  Updated: {}", at.with_timezone(&Local).format("%H:%M:%S"));
    }
    if let Some(msg) = s.error_message() {
        let _ = write!(out, "\nError: {msg}");
    }
    let _ = write!(out, "\nCompleted API requests: {}", s.request_count);
    out
}

pub fn history(entries: &[String]) -> String {
    if entries.is_empty() {
        return EMPTY_HISTORY.to_string();
    }
    entries
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{}. {c}", i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Notice shown by `watch` while the refresh task is armed.
pub fn refresh_notice(refreshing_city: Option<&str>, every: Duration) -> Option<String> {
    refreshing_city.map(|city| {
        format!("Refreshing {city} every {}s. Press Ctrl-C to stop.", every.as_secs())
    })
}
