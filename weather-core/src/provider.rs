use crate::{
    Config, WeatherReading, error::WeatherError, provider::openweather::OpenWeatherProvider,
};
use async_trait::async_trait;
use std::fmt::Debug;

pub mod openweather;

/// Source of current weather readings.
///
/// Implementations must return [`WeatherError::Config`] without doing any
/// I/O when they lack credentials, and fold every other failure into
/// [`WeatherError::NotFound`].
#[async_trait]
pub trait WeatherProvider: Send + Sync + Debug {
    async fn current(&self, city: &str) -> Result<WeatherReading, WeatherError>;
}

/// Construct the OpenWeather provider from config.
///
/// A missing API key is not an error here; the provider reports it on every
/// fetch attempt instead.
pub fn provider_from_config(config: &Config) -> Box<dyn WeatherProvider> {
    let provider = OpenWeatherProvider::new(config.api_key().map(str::to_owned))
        .with_base_url(&config.base_url)
        .with_lang(&config.lang);

    Box::new(provider)
}
