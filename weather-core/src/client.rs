//! Fetch, normalize and record flow plus the periodic refresh task.

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::{
    sync::watch,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    Config,
    config::{MAX_REFRESH_INTERVAL, MIN_REFRESH_INTERVAL},
    error::WeatherError,
    history::History,
    model::{ClientState, WeatherReading},
    provider::WeatherProvider,
    storage::KeyValueStore,
};

/// Looks up current weather, keeps the search history and re-queries the
/// last successful city on a fixed interval.
///
/// Must be used from within a tokio runtime: a successful fetch spawns the
/// refresh task. Dropping the client cancels that task.
pub struct WeatherClient {
    inner: Arc<Inner>,
}

struct Inner {
    provider: Arc<dyn WeatherProvider>,
    store: Arc<dyn KeyValueStore>,
    history: Mutex<History>,
    state: watch::Sender<ClientState>,
    in_flight: AtomicUsize,
    refresh_interval: Duration,
    refresh: Mutex<Option<RefreshTask>>,
}

struct RefreshTask {
    city: String,
    token: CancellationToken,
}

impl WeatherClient {
    /// Create a client, loading the history from `store` once.
    ///
    /// `refresh_interval` is clamped to
    /// [`MIN_REFRESH_INTERVAL`]..=[`MAX_REFRESH_INTERVAL`].
    pub fn new(
        provider: Arc<dyn WeatherProvider>,
        store: Arc<dyn KeyValueStore>,
        refresh_interval: Duration,
    ) -> Self {
        let history = History::load(store.as_ref());
        let (state, _) = watch::channel(ClientState::default());

        Self {
            inner: Arc::new(Inner {
                provider,
                store,
                history: Mutex::new(history),
                state,
                in_flight: AtomicUsize::new(0),
                refresh_interval: refresh_interval
                    .clamp(MIN_REFRESH_INTERVAL, MAX_REFRESH_INTERVAL),
                refresh: Mutex::new(None),
            }),
        }
    }

    pub fn from_config(config: &Config, store: Arc<dyn KeyValueStore>) -> Self {
        let provider: Arc<dyn WeatherProvider> =
            crate::provider::provider_from_config(config).into();
        Self::new(provider, store, config.refresh_interval())
    }

    /// Fetch current weather for `city`.
    ///
    /// On success the reading becomes current, the request counter grows by
    /// one, the city moves to the front of the history and the refresh task
    /// is (re)armed for it. On failure the current reading is cleared and the
    /// error recorded; history and counter stay untouched.
    pub async fn fetch_weather(&self, city: &str) -> Result<WeatherReading, WeatherError> {
        self.inner.fetch(city, None).await
    }

    /// Re-run a lookup picked from the history list.
    pub async fn use_from_history(&self, city: &str) -> Result<WeatherReading, WeatherError> {
        self.inner.fetch(city, None).await
    }

    /// Empty the history and remove it from storage.
    pub fn clear_history(&self) -> anyhow::Result<()> {
        self.inner.history.lock().clear();
        self.inner.store.remove(crate::history::HISTORY_KEY)
    }

    pub fn history(&self) -> Vec<String> {
        self.inner.history.lock().entries().to_vec()
    }

    pub fn state(&self) -> ClientState {
        self.inner.state.borrow().clone()
    }

    /// Receiver that observes every state transition, including those caused
    /// by background refreshes.
    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    /// City the refresh task is currently armed for, if any.
    pub fn refreshing_city(&self) -> Option<String> {
        self.inner.refresh.lock().as_ref().map(|t| t.city.clone())
    }

    /// Forget the last queried city and disarm the refresh task.
    pub fn stop_refresh(&self) {
        self.inner.disarm();
        self.inner.state.send_modify(|s| s.last_city = None);
    }
}

impl Drop for WeatherClient {
    fn drop(&mut self) {
        self.inner.disarm();
    }
}

impl std::fmt::Debug for WeatherClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeatherClient")
            .field("provider", &self.inner.provider)
            .field("refresh_interval", &self.inner.refresh_interval)
            .field("refreshing_city", &self.refreshing_city())
            .finish()
    }
}

impl Inner {
    /// `refresh` is the token of the refresh task issuing this fetch. Once it
    /// is cancelled the result no longer moves the last city or re-arms.
    async fn fetch(
        self: &Arc<Self>,
        city: &str,
        refresh: Option<&CancellationToken>,
    ) -> Result<WeatherReading, WeatherError> {
        let city = city.trim();
        let _in_flight = InFlight::enter(self);

        let result = if city.is_empty() {
            Err(WeatherError::NotFound)
        } else {
            self.provider.current(city).await
        };

        match result {
            Ok(reading) => {
                let track = refresh.is_none_or(|token| !token.is_cancelled());
                self.on_success(city, &reading, track);
                Ok(reading)
            }
            Err(err) => {
                tracing::debug!(%city, error = %err, "weather lookup failed");
                self.state.send_modify(|s| {
                    s.reading = None;
                    s.error = Some(err);
                });
                Err(err)
            }
        }
    }

    fn on_success(self: &Arc<Self>, city: &str, reading: &WeatherReading, track: bool) {
        self.state.send_modify(|s| {
            s.reading = Some(reading.clone());
            s.error = None;
            if track {
                s.last_city = Some(city.to_string());
            }
            s.request_count += 1;
            s.updated_at = Some(Utc::now());
        });

        let name = if reading.city.trim().is_empty() { city } else { reading.city.as_str() };
        // Storage is synchronous. The lock is held across the write so
        // concurrent completions persist in the order they mutate.
        {
            let mut history = self.history.lock();
            if history.record(name) {
                if let Err(err) = history.persist(self.store.as_ref()) {
                    tracing::warn!(error = %err, "failed to persist search history");
                }
            }
        }

        if track {
            self.arm(city);
        }
    }

    /// Arm the refresh task for `city`, replacing a task armed for another
    /// city. Re-arming for the same city keeps the running task.
    fn arm(self: &Arc<Self>, city: &str) {
        let mut slot = self.refresh.lock();
        if let Some(task) = slot.as_ref() {
            if task.city == city && !task.token.is_cancelled() {
                return;
            }
            task.token.cancel();
        }

        let Some(first_tick) = Instant::now().checked_add(self.refresh_interval) else {
            tracing::warn!(interval = ?self.refresh_interval, "refresh interval out of range");
            *slot = None;
            return;
        };

        let token = CancellationToken::new();
        tracing::info!(%city, interval = ?self.refresh_interval, "arming weather refresh");
        tokio::spawn(refresh_loop(
            Arc::downgrade(self),
            city.to_string(),
            first_tick,
            self.refresh_interval,
            token.clone(),
        ));
        *slot = Some(RefreshTask {
            city: city.to_string(),
            token,
        });
    }

    fn disarm(&self) {
        if let Some(task) = self.refresh.lock().take() {
            tracing::debug!(city = %task.city, "disarming weather refresh");
            task.token.cancel();
        }
    }
}

async fn refresh_loop(
    inner: Weak<Inner>,
    city: String,
    first_tick: Instant,
    period: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(first_tick, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                tracing::debug!(%city, "refreshing weather");
                // Outcome is already recorded in the client state.
                let _ = inner.fetch(&city, Some(&token)).await;
            }
        }
    }
}

/// Marks a fetch as in flight until dropped.
struct InFlight<'a> {
    inner: &'a Inner,
}

impl<'a> InFlight<'a> {
    fn enter(inner: &'a Inner) -> Self {
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        inner.state.send_modify(|s| {
            s.in_flight = true;
            s.error = None;
        });
        Self { inner }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let remaining = self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        self.inner.state.send_modify(|s| s.in_flight = remaining > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{history::HISTORY_KEY, storage::MemoryStore};
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Provider answering from a fixed table and counting calls.
    #[derive(Debug, Default)]
    struct FakeProvider {
        readings: HashMap<String, WeatherReading>,
        delays: HashMap<String, Duration>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeProvider {
        fn with(cities: &[&str]) -> Self {
            let readings = cities
                .iter()
                .map(|c| {
                    (
                        c.to_lowercase(),
                        WeatherReading {
                            city: c.to_string(),
                            temperature_c: 10,
                            description: "clear sky".into(),
                            humidity_pct: 50,
                            wind_speed_mps: 1.5,
                        },
                    )
                })
                .collect();
            Self {
                readings,
                delays: HashMap::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        /// Make lookups of `city` take `delay` before answering.
        fn slow(mut self, city: &str, delay: Duration) -> Self {
            self.delays.insert(city.to_lowercase(), delay);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl WeatherProvider for FakeProvider {
        async fn current(&self, city: &str) -> Result<WeatherReading, WeatherError> {
            self.calls.lock().push(city.to_string());
            if let Some(delay) = self.delays.get(&city.to_lowercase()) {
                tokio::time::sleep(*delay).await;
            }
            self.readings
                .get(&city.to_lowercase())
                .cloned()
                .ok_or(WeatherError::NotFound)
        }
    }

    const MINUTE: Duration = Duration::from_secs(60);

    fn client_with(provider: Arc<FakeProvider>, store: Arc<MemoryStore>) -> WeatherClient {
        WeatherClient::new(provider, store, MINUTE)
    }

    #[tokio::test]
    async fn success_updates_state_counter_and_history() {
        let provider = Arc::new(FakeProvider::with(&["London"]));
        let store = Arc::new(MemoryStore::new());
        let client = client_with(provider, store.clone());

        let reading = client.fetch_weather("London").await.unwrap();

        let state = client.state();
        assert_eq!(state.reading.as_ref(), Some(&reading));
        assert_eq!(state.last_city.as_deref(), Some("London"));
        assert_eq!(state.request_count, 1);
        assert_eq!(state.error, None);
        assert!(!state.in_flight);
        assert!(state.updated_at.is_some());
        assert_eq!(client.history(), ["London"]);
        assert_eq!(store.get(HISTORY_KEY).unwrap().as_deref(), Some(r#"["London"]"#));
    }

    #[tokio::test]
    async fn failure_clears_reading_and_keeps_history_and_counter() {
        let provider = Arc::new(FakeProvider::with(&["London"]));
        let client = client_with(provider, Arc::new(MemoryStore::new()));

        client.fetch_weather("London").await.unwrap();
        let err = client.fetch_weather("Nowhereville").await.unwrap_err();

        assert_eq!(err, WeatherError::NotFound);
        let state = client.state();
        assert_eq!(state.reading, None);
        assert_eq!(state.error, Some(WeatherError::NotFound));
        assert_eq!(state.error_message().as_deref(), Some("city not found"));
        assert_eq!(state.request_count, 1);
        assert_eq!(state.last_city.as_deref(), Some("London"));
        assert!(!state.in_flight);
        assert_eq!(client.history(), ["London"]);
    }

    #[tokio::test]
    async fn next_success_clears_previous_error() {
        let provider = Arc::new(FakeProvider::with(&["Rome"]));
        let client = client_with(provider, Arc::new(MemoryStore::new()));

        let _ = client.fetch_weather("Atlantis").await;
        client.fetch_weather("Rome").await.unwrap();

        assert_eq!(client.state().error, None);
    }

    #[tokio::test]
    async fn blank_city_is_rejected_without_provider_call() {
        let provider = Arc::new(FakeProvider::with(&["Rome"]));
        let client = client_with(provider.clone(), Arc::new(MemoryStore::new()));

        let err = client.fetch_weather("   ").await.unwrap_err();

        assert_eq!(err, WeatherError::NotFound);
        assert!(provider.calls().is_empty());
        assert!(!client.state().in_flight);
    }

    #[tokio::test]
    async fn input_is_trimmed_before_lookup() {
        let provider = Arc::new(FakeProvider::with(&["Rome"]));
        let client = client_with(provider.clone(), Arc::new(MemoryStore::new()));

        client.fetch_weather("  Rome  ").await.unwrap();

        assert_eq!(provider.calls(), ["Rome"]);
        assert_eq!(client.state().last_city.as_deref(), Some("Rome"));
    }

    #[tokio::test]
    async fn refetch_in_any_case_moves_to_front_without_growing() {
        let provider = Arc::new(FakeProvider::with(&["Paris", "Rome", "Berlin", "Madrid", "Oslo"]));
        let store = Arc::new(MemoryStore::with_entry(
            HISTORY_KEY,
            r#"["Paris","Rome","Berlin","Madrid","Oslo"]"#,
        ));
        let client = client_with(provider, store);

        client.fetch_weather("paris").await.unwrap();
        assert_eq!(client.history(), ["Paris", "Rome", "Berlin", "Madrid", "Oslo"]);

        client.fetch_weather("madrid").await.unwrap();
        assert_eq!(client.history(), ["Madrid", "Paris", "Rome", "Berlin", "Oslo"]);
    }

    #[tokio::test]
    async fn history_never_exceeds_limit() {
        let cities = ["A", "B", "C", "D", "E", "F", "G"];
        let provider = Arc::new(FakeProvider::with(&cities));
        let client = client_with(provider, Arc::new(MemoryStore::new()));

        for city in cities {
            client.fetch_weather(city).await.unwrap();
            assert!(client.history().len() <= crate::history::HISTORY_LIMIT);
        }

        assert_eq!(client.history(), ["G", "F", "E", "D", "C"]);
        assert_eq!(client.state().request_count, 7);
    }

    #[tokio::test]
    async fn clear_history_empties_list_and_storage() {
        let provider = Arc::new(FakeProvider::with(&["Oslo"]));
        let store = Arc::new(MemoryStore::new());
        let client = client_with(provider, store.clone());
        client.fetch_weather("Oslo").await.unwrap();

        client.clear_history().unwrap();

        assert!(client.history().is_empty());
        assert_eq!(store.get(HISTORY_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn malformed_stored_history_loads_empty() {
        let store = Arc::new(MemoryStore::with_entry(HISTORY_KEY, "oops"));
        let client = client_with(Arc::new(FakeProvider::default()), store);

        assert!(client.history().is_empty());
    }

    #[tokio::test]
    async fn use_from_history_fetches_that_city() {
        let provider = Arc::new(FakeProvider::with(&["Rome", "Oslo"]));
        let client = client_with(provider.clone(), Arc::new(MemoryStore::new()));
        client.fetch_weather("Rome").await.unwrap();
        client.fetch_weather("Oslo").await.unwrap();

        client.use_from_history("Rome").await.unwrap();

        assert_eq!(provider.calls(), ["Rome", "Oslo", "Rome"]);
        assert_eq!(client.history(), ["Rome", "Oslo"]);
    }

    #[tokio::test]
    async fn subscribers_see_completed_fetch() {
        let provider = Arc::new(FakeProvider::with(&["Rome"]));
        let client = client_with(provider, Arc::new(MemoryStore::new()));
        let mut rx = client.subscribe();

        client.fetch_weather("Rome").await.unwrap();

        assert!(rx.has_changed().unwrap());
        let seen = rx.borrow_and_update().clone();
        assert_eq!(seen.request_count, 1);
        assert!(!seen.in_flight);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_refetches_last_city_every_interval() {
        let provider = Arc::new(FakeProvider::with(&["Rome"]));
        let client = client_with(provider.clone(), Arc::new(MemoryStore::new()));

        client.fetch_weather("Rome").await.unwrap();
        assert_eq!(client.refreshing_city().as_deref(), Some("Rome"));

        tokio::time::sleep(MINUTE / 2).await;
        assert_eq!(provider.calls().len(), 1);

        tokio::time::sleep(MINUTE).await;
        tokio::task::yield_now().await;
        assert_eq!(provider.calls(), ["Rome", "Rome"]);

        tokio::time::sleep(MINUTE).await;
        tokio::task::yield_now().await;
        assert_eq!(provider.calls().len(), 3);
        assert_eq!(client.state().request_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_is_rearmed_when_city_changes() {
        let provider = Arc::new(FakeProvider::with(&["Rome", "Oslo"]));
        let client = client_with(provider.clone(), Arc::new(MemoryStore::new()));

        client.fetch_weather("Rome").await.unwrap();
        tokio::time::sleep(MINUTE / 2).await;
        client.fetch_weather("Oslo").await.unwrap();
        assert_eq!(client.refreshing_city().as_deref(), Some("Oslo"));

        tokio::time::sleep(MINUTE + MINUTE / 4).await;
        tokio::task::yield_now().await;

        assert_eq!(provider.calls(), ["Rome", "Oslo", "Oslo"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_keeps_refresh_for_last_city() {
        let provider = Arc::new(FakeProvider::with(&["Rome"]));
        let client = client_with(provider.clone(), Arc::new(MemoryStore::new()));

        client.fetch_weather("Rome").await.unwrap();
        let _ = client.fetch_weather("Atlantis").await;
        assert_eq!(client.refreshing_city().as_deref(), Some("Rome"));

        tokio::time::sleep(MINUTE + MINUTE / 4).await;
        tokio::task::yield_now().await;

        assert_eq!(provider.calls(), ["Rome", "Atlantis", "Rome"]);
        assert!(client.state().reading.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_refresh_disarms_timer() {
        let provider = Arc::new(FakeProvider::with(&["Rome"]));
        let client = client_with(provider.clone(), Arc::new(MemoryStore::new()));
        client.fetch_weather("Rome").await.unwrap();

        client.stop_refresh();

        assert_eq!(client.refreshing_city(), None);
        assert_eq!(client.state().last_city, None);
        tokio::time::sleep(MINUTE * 3).await;
        tokio::task::yield_now().await;
        assert_eq!(provider.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_client_stops_refresh() {
        let provider = Arc::new(FakeProvider::with(&["Rome"]));
        let client = client_with(provider.clone(), Arc::new(MemoryStore::new()));
        client.fetch_weather("Rome").await.unwrap();

        drop(client);

        tokio::time::sleep(MINUTE * 3).await;
        tokio::task::yield_now().await;
        assert_eq!(provider.calls().len(), 1);
    }

    #[tokio::test]
    async fn no_refresh_armed_before_first_success() {
        let provider = Arc::new(FakeProvider::default());
        let client = client_with(provider, Arc::new(MemoryStore::new()));

        let _ = client.fetch_weather("Atlantis").await;

        assert_eq!(client.refreshing_city(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_refresh_fetch_stays_stopped() {
        let slow = Duration::from_secs(5);
        let provider = Arc::new(FakeProvider::with(&["Rome"]).slow("Rome", slow));
        let client = client_with(provider.clone(), Arc::new(MemoryStore::new()));
        client.fetch_weather("Rome").await.unwrap();

        // First refresh starts one minute after the initial fetch completed.
        tokio::time::sleep(MINUTE + Duration::from_secs(2)).await;
        assert_eq!(provider.calls().len(), 2);
        assert!(client.state().in_flight);

        client.stop_refresh();
        tokio::time::sleep(slow * 2).await;

        assert_eq!(client.refreshing_city(), None);
        assert_eq!(client.state().last_city, None);

        tokio::time::sleep(MINUTE * 3).await;
        tokio::task::yield_now().await;
        assert_eq!(provider.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn switching_city_during_refresh_fetch_keeps_new_city() {
        let slow = Duration::from_secs(5);
        let provider = Arc::new(FakeProvider::with(&["Rome", "Oslo"]).slow("Rome", slow));
        let client = client_with(provider.clone(), Arc::new(MemoryStore::new()));
        client.fetch_weather("Rome").await.unwrap();

        tokio::time::sleep(MINUTE + Duration::from_secs(2)).await;
        client.fetch_weather("Oslo").await.unwrap();
        tokio::time::sleep(slow * 2).await;

        assert_eq!(client.refreshing_city().as_deref(), Some("Oslo"));
        assert_eq!(client.state().last_city.as_deref(), Some("Oslo"));
    }

    #[tokio::test(start_paused = true)]
    async fn huge_refresh_interval_does_not_panic() {
        let provider = Arc::new(FakeProvider::with(&["Rome"]));
        let client =
            WeatherClient::new(provider.clone(), Arc::new(MemoryStore::new()), Duration::MAX);

        client.fetch_weather("Rome").await.unwrap();

        assert_eq!(client.refreshing_city().as_deref(), Some("Rome"));
        tokio::time::sleep(MINUTE * 10).await;
        assert_eq!(provider.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_fetch_clears_in_flight() {
        let provider = Arc::new(FakeProvider::with(&["Rome"]).slow("Rome", Duration::from_secs(5)));
        let client = client_with(provider, Arc::new(MemoryStore::new()));

        let res = tokio::time::timeout(Duration::from_secs(1), client.fetch_weather("Rome")).await;

        assert!(res.is_err());
        let state = client.state();
        assert!(!state.in_flight);
        assert_eq!(state.request_count, 0);
        assert_eq!(client.refreshing_city(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_stays_set_until_last_overlapping_fetch() {
        let provider = Arc::new(
            FakeProvider::with(&["Rome", "Oslo"])
                .slow("Rome", Duration::from_secs(1))
                .slow("Oslo", Duration::from_secs(5)),
        );
        let client = client_with(provider, Arc::new(MemoryStore::new()));

        let fast = async {
            client.fetch_weather("Rome").await.unwrap();
            client.state().in_flight
        };
        let (slow_result, in_flight_after_fast) = tokio::join!(client.fetch_weather("Oslo"), fast);

        assert!(slow_result.is_ok());
        assert!(in_flight_after_fast);
        assert!(!client.state().in_flight);
        assert_eq!(client.state().request_count, 2);
    }

    #[tokio::test]
    async fn corrupt_storage_file_is_recovered_by_next_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        std::fs::write(&path, "garbage").unwrap();
        let store = Arc::new(crate::storage::FileStore::new(&path));
        let client = WeatherClient::new(
            Arc::new(FakeProvider::with(&["Rome"])),
            store.clone(),
            MINUTE,
        );
        assert!(client.history().is_empty());

        client.fetch_weather("Rome").await.unwrap();
        assert_eq!(store.get(HISTORY_KEY).unwrap().as_deref(), Some(r#"["Rome"]"#));

        client.clear_history().unwrap();
        assert_eq!(store.get(HISTORY_KEY).unwrap(), None);
    }
}
