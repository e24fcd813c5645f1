//! Core library for the `weather` CLI.
//!
//! This crate defines:
//! - Configuration & credentials handling
//! - The OpenWeather provider and its normalized readings
//! - A small key-value storage abstraction and the search history kept in it
//! - [`WeatherClient`], which ties lookups, history and periodic refresh together
//!
//! It is used by `weather-cli`, but can also be reused by other binaries or services.

pub mod client;
pub mod config;
pub mod error;
pub mod history;
pub mod model;
pub mod provider;
pub mod storage;

pub use client::WeatherClient;
pub use config::Config;
pub use error::WeatherError;
pub use history::{HISTORY_KEY, HISTORY_LIMIT, History};
pub use model::{ClientState, WeatherReading};
pub use provider::{WeatherProvider, openweather::OpenWeatherProvider, provider_from_config};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
