use std::{fmt, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use inquire::{InquireError, Password, Select, Text};
use weather_core::{Config, FileStore, WeatherClient};

use crate::render;

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "weather", version, about = "Weather CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Configure the OpenWeather API key and response language.
    Configure,

    /// Show current weather for a city.
    Show {
        /// City name.
        city: String,
    },

    /// Show weather for a city and keep refreshing it until Ctrl-C.
    Watch {
        /// City name.
        city: String,
    },

    /// List recently searched cities.
    History {
        /// Remove all entries instead of listing them.
        #[arg(long)]
        clear: bool,
    },

    /// Prompt for cities and pick from history in a loop.
    Interactive,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Configure => configure().await,
            Command::Show { city } => {
                let client = open_client(&Config::load()?)?;
                show(&client, &city).await
            }
            Command::Watch { city } => {
                let config = Config::load()?;
                let client = open_client(&config)?;
                watch(&client, &city, config.refresh_interval()).await
            }
            Command::History { clear } => {
                let client = open_client(&Config::load()?)?;
                if clear {
                    client.clear_history()?;
                    println!("History cleared.");
                } else {
                    println!("{}", render::history(&client.history()));
                }
                Ok(())
            }
            Command::Interactive => {
                let client = open_client(&Config::load()?)?;
                interactive(&client).await
            }
        }
    }
}

fn open_client(config: &Config) -> Result<WeatherClient> {
    let path = Config::storage_file_path()?;
    tracing::debug!(path = %path.display(), "opening history storage");
    Ok(WeatherClient::from_config(config, Arc::new(FileStore::new(path))))
}

async fn configure() -> Result<()> {
    let mut cfg = Config::load()?;
    let current_lang = cfg.lang.clone();

    let (api_key, lang) = prompt(move || {
        let api_key = Password::new("OpenWeather API key:")
            .without_confirmation()
            .with_help_message("Leave empty to keep the current key")
            .prompt()?;
        let lang = Text::new("Response language:")
            .with_default(&current_lang)
            .prompt()?;
        Ok((api_key, lang))
    })
    .await?
    .ok_or_else(|| anyhow!("configuration cancelled"))?;

    if !api_key.trim().is_empty() {
        cfg.set_api_key(api_key);
    }
    if !lang.trim().is_empty() {
        cfg.lang = lang.trim().to_string();
    }
    cfg.save()?;

    println!("Saved configuration to {}", Config::config_file_path()?.display());
    Ok(())
}

async fn show(client: &WeatherClient, city: &str) -> Result<()> {
    client.fetch_weather(city).await?;
    println!("{}", render::state(&client.state()));
    Ok(())
}

async fn watch(client: &WeatherClient, city: &str, every: Duration) -> Result<()> {
    let mut rx = client.subscribe();
    // Refresh is only armed by a successful lookup; nothing to watch otherwise.
    client.fetch_weather(city).await?;
    println!("{}", render::state(&rx.borrow_and_update()));
    match render::refresh_notice(client.refreshing_city().as_deref(), every) {
        Some(notice) => println!("{notice}"),
        None => return Ok(()),
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                res.context("Failed to listen for Ctrl-C")?;
                break;
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = rx.borrow_and_update().clone();
                if !state.in_flight {
                    println!("\n{}", render::state(&state));
                }
            }
        }
    }

    client.stop_refresh();
    Ok(())
}

enum MenuItem {
    Search,
    FromHistory(String),
    ClearHistory,
    Quit,
}

impl fmt::Display for MenuItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MenuItem::Search => f.write_str("Search a city"),
            MenuItem::FromHistory(city) => write!(f, "Search {city}"),
            MenuItem::ClearHistory => f.write_str("Clear history"),
            MenuItem::Quit => f.write_str("Quit"),
        }
    }
}

async fn interactive(client: &WeatherClient) -> Result<()> {
    // Input text is owned here, not by the client.
    let mut input = String::new();

    loop {
        let history = client.history();
        if history.is_empty() {
            println!("{}", render::EMPTY_HISTORY);
        }

        let mut items = vec![MenuItem::Search];
        items.extend(history.into_iter().map(MenuItem::FromHistory));
        if items.len() > 1 {
            items.push(MenuItem::ClearHistory);
        }
        items.push(MenuItem::Quit);

        let Some(choice) = prompt(move || Select::new("What next?", items).prompt()).await? else {
            break;
        };

        match choice {
            MenuItem::Search => {
                let initial = input.clone();
                let Some(entered) = prompt(move || {
                    Text::new("City:").with_initial_value(&initial).prompt()
                })
                .await?
                else {
                    continue;
                };
                input = entered;

                let city = input.trim();
                if city.is_empty() {
                    continue;
                }
                let _ = client.fetch_weather(city).await;
            }
            MenuItem::FromHistory(city) => {
                input = city.clone();
                let _ = client.use_from_history(&city).await;
            }
            MenuItem::ClearHistory => {
                client.clear_history()?;
                continue;
            }
            MenuItem::Quit => break,
        }

        println!("{}\n", render::state(&client.state()));
    }

    Ok(())
}

/// Run a blocking inquire prompt off the async workers. `Ok(None)` means the
/// user cancelled with Esc or Ctrl-C.
async fn prompt<T, F>(f: F) -> Result<Option<T>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, InquireError> + Send + 'static,
{
    let res = tokio::task::spawn_blocking(f)
        .await
        .context("Prompt task panicked")?;

    match res {
        Ok(v) => Ok(Some(v)),
        Err(InquireError::OperationCanceled | InquireError::OperationInterrupted) => Ok(None),
        Err(e) => Err(e.into()),
    }
}
