use thiserror::Error;

/// Failures surfaced to the user by a weather lookup.
///
/// Every transport, status and decoding problem collapses into
/// [`WeatherError::NotFound`]; the underlying cause is only logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WeatherError {
    /// No API key is configured. Raised before any network I/O.
    #[error("no API key")]
    Config,

    #[error("city not found")]
    NotFound,
}
