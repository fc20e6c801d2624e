// Country provider
//
// Resolves the coarse country code attached to outbound reports. The raw
// code from the config endpoint is only ever shared when it appears in
// the allow list; everything else degrades to "--" so small populations
// cannot be singled out.

use crate::clock::Clock;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::selfcheck::{Check, ErrorRate, SelfCheck};
use crate::storage::KvStorage;
use crate::util::uniform_ms;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

const STORAGE_KEY: &str = "ctry|state";

/// Fallback code for everything not on the allow list.
pub const UNKNOWN_COUNTRY: &str = "--";

const SUCCESS_RETRY_MIN_MS: u64 = 22 * 60 * 60 * 1000;
const SUCCESS_RETRY_MAX_MS: u64 = 26 * 60 * 60 * 1000;
const FAILURE_BACKOFF_STEP_MS: f64 = 30_000.0;
const FAILURE_BACKOFF_MIN_MS: f64 = 3_000.0;
const FAILURE_BACKOFF_MAX_MS: f64 = 3.0 * 24.0 * 60.0 * 60.0 * 1000.0;

const MAX_CODE_LEN: usize = 4;
const MAX_FUTURE_SKEW_MS: i64 = 5 * 60 * 1000;
const MAX_SKIP_WINDOW_MS: i64 = 90 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CountryInfo {
    pub db_version: Option<String>,
    pub unsafe_ctry_from_api: Option<String>,
    pub safe_ctry: String,
    pub last_success_at: i64,
    pub last_attempt_at: i64,
    pub skip_attempts_until: i64,
    pub failed_attempts_in_a_row: u32,
}

impl Default for CountryInfo {
    fn default() -> Self {
        Self {
            db_version: None,
            unsafe_ctry_from_api: None,
            safe_ctry: UNKNOWN_COUNTRY.to_string(),
            last_success_at: 0,
            last_attempt_at: 0,
            skip_attempts_until: 0,
            failed_attempts_in_a_row: 0,
        }
    }
}

impl CountryInfo {
    /// Refuse snapshots with impossible codes or timestamps.
    fn validate(&self, now: i64) -> Result<()> {
        if let Some(code) = &self.unsafe_ctry_from_api {
            if code.len() > MAX_CODE_LEN {
                return Err(Error::Corruption("country code too long".into()));
            }
        }
        if self.safe_ctry.len() > MAX_CODE_LEN {
            return Err(Error::Corruption("safe country code too long".into()));
        }
        let future_limit = now + MAX_FUTURE_SKEW_MS;
        if self.last_success_at > future_limit || self.last_attempt_at > future_limit {
            return Err(Error::Corruption("country timestamps in the future".into()));
        }
        if (self.skip_attempts_until - now).abs() > MAX_SKIP_WINDOW_MS {
            return Err(Error::Corruption("skip_attempts_until out of range".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct LocationResponse {
    location: String,
}

pub struct CountryProvider {
    storage: Arc<dyn KvStorage>,
    clock: Arc<dyn Clock>,
    client: reqwest::Client,
    config_url: String,
    allow_list: HashSet<String>,
    state: Mutex<CountryInfo>,
    errors: ErrorRate,
}

impl CountryProvider {
    pub fn new(
        options: &Options,
        storage: Arc<dyn KvStorage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            clock,
            client: reqwest::Client::new(),
            config_url: options.country_config_url.clone(),
            allow_list: options.allowed_countries.iter().cloned().collect(),
            state: Mutex::new(CountryInfo::default()),
            errors: ErrorRate::default(),
        }
    }

    /// Restore persisted state; a corrupted snapshot starts fresh.
    pub async fn load(&self) {
        let stored = match self.storage.get(STORAGE_KEY).await {
            Ok(Some(value)) => value,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!("failed to read country state: {err:#}");
                return;
            }
        };
        match serde_json::from_value::<CountryInfo>(stored)
            .map_err(Error::corruption)
            .and_then(|info| {
                info.validate(self.clock.now_ms())?;
                Ok(info)
            }) {
            Ok(info) => *self.state.lock().await = info,
            Err(err) => {
                tracing::warn!("dropping corrupted country state: {err}");
                let _ = self.storage.remove(STORAGE_KEY).await;
            }
        }
    }

    /// The code attached to outbound reports. Never anything outside the
    /// allow list.
    pub async fn safe_country_code(&self) -> String {
        self.state.lock().await.safe_ctry.clone()
    }

    /// Refresh if the backoff window has elapsed. Returns whether an
    /// attempt was made.
    pub async fn update_if_due(&self) -> Result<bool> {
        let now = self.clock.now_ms();
        {
            let state = self.state.lock().await;
            if now < state.skip_attempts_until {
                return Ok(false);
            }
        }
        self.update(now).await?;
        Ok(true)
    }

    async fn update(&self, now: i64) -> Result<()> {
        let outcome = self.fetch_location().await;

        let mut state = self.state.lock().await;
        state.last_attempt_at = now;
        match outcome {
            Ok(location) => {
                self.errors.record_success();
                state.safe_ctry = if self.allow_list.contains(&location) {
                    location.clone()
                } else {
                    UNKNOWN_COUNTRY.to_string()
                };
                state.unsafe_ctry_from_api = Some(location);
                state.last_success_at = now;
                state.failed_attempts_in_a_row = 0;
                state.skip_attempts_until =
                    now + uniform_ms(SUCCESS_RETRY_MIN_MS, SUCCESS_RETRY_MAX_MS) as i64;
            }
            Err(err) => {
                self.errors.record_failure();
                state.failed_attempts_in_a_row += 1;
                let avg = FAILURE_BACKOFF_STEP_MS * f64::from(state.failed_attempts_in_a_row);
                let jitter: f64 = rand::rng().random_range(0.5..1.5);
                let backoff = (avg * jitter).clamp(FAILURE_BACKOFF_MIN_MS, FAILURE_BACKOFF_MAX_MS);
                state.skip_attempts_until = now + backoff as i64;
                tracing::debug!(
                    failures = state.failed_attempts_in_a_row,
                    backoff_ms = backoff as i64,
                    "country lookup failed: {err}"
                );
            }
        }

        let snapshot = serde_json::to_value(&*state).map_err(Error::transient)?;
        drop(state);
        self.storage
            .set(STORAGE_KEY, snapshot)
            .await
            .map_err(Error::transient)?;
        Ok(())
    }

    async fn fetch_location(&self) -> Result<String> {
        let response = self
            .client
            .get(&self.config_url)
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .header(reqwest::header::PRAGMA, "no-cache")
            .send()
            .await
            .map_err(Error::transient)?
            .error_for_status()
            .map_err(Error::transient)?;
        let body: LocationResponse = response.json().await.map_err(Error::transient)?;
        let location = body.location.trim().to_ascii_lowercase();
        if location.is_empty() || location.len() > MAX_CODE_LEN {
            return Err(Error::Corruption("implausible country code".into()));
        }
        Ok(location)
    }
}

impl SelfCheck for CountryProvider {
    fn self_check(&self) -> Vec<Check> {
        vec![self.errors.check("country-errors", 0.2)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn provider(url: String, now: i64) -> (CountryProvider, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let options = Options {
            country_config_url: url,
            ..Options::default()
        };
        let provider = CountryProvider::new(
            &options,
            storage.clone(),
            Arc::new(ManualClock::new(now)),
        );
        (provider, storage)
    }

    #[tokio::test]
    async fn allow_listed_country_is_reported() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/location")
            .with_body(r#"{"location": "de"}"#)
            .create_async()
            .await;

        let (provider, _) = provider(format!("{}/location", server.url()), 1_000_000);
        assert!(provider.update_if_due().await.unwrap());
        assert_eq!(provider.safe_country_code().await, "de");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unknown_country_degrades_to_dashes() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/location")
            .with_body(r#"{"location": "li"}"#)
            .create_async()
            .await;

        let (provider, _) = provider(format!("{}/location", server.url()), 1_000_000);
        provider.update_if_due().await.unwrap();
        assert_eq!(provider.safe_country_code().await, UNKNOWN_COUNTRY);
    }

    #[tokio::test]
    async fn success_schedules_next_attempt_around_a_day() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/location")
            .with_body(r#"{"location": "fr"}"#)
            .create_async()
            .await;

        let (provider, _) = provider(format!("{}/location", server.url()), 0);
        provider.update_if_due().await.unwrap();
        let state = provider.state.lock().await.clone();
        assert!(state.skip_attempts_until >= SUCCESS_RETRY_MIN_MS as i64);
        assert!(state.skip_attempts_until <= SUCCESS_RETRY_MAX_MS as i64);

        // Still in cooldown: no second attempt.
        assert!(!provider.update_if_due().await.unwrap());
    }

    #[tokio::test]
    async fn failures_back_off() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/location")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let (provider, _) = provider(format!("{}/location", server.url()), 0);
        provider.update_if_due().await.unwrap();
        let state = provider.state.lock().await.clone();
        assert_eq!(state.failed_attempts_in_a_row, 1);
        assert!(state.skip_attempts_until >= FAILURE_BACKOFF_MIN_MS as i64);
        assert_eq!(state.safe_ctry, UNKNOWN_COUNTRY);
    }

    #[tokio::test]
    async fn corrupted_snapshot_is_dropped() {
        let (provider, storage) = provider("http://unused.invalid/".into(), 1_000_000);
        storage
            .set(
                STORAGE_KEY,
                json!({
                    "db_version": null,
                    "unsafe_ctry_from_api": "germany",
                    "safe_ctry": "de",
                    "last_success_at": 0,
                    "last_attempt_at": 0,
                    "skip_attempts_until": 0,
                    "failed_attempts_in_a_row": 0,
                }),
            )
            .await
            .unwrap();
        provider.load().await;
        assert_eq!(provider.safe_country_code().await, UNKNOWN_COUNTRY);
        assert_eq!(storage.get(STORAGE_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn future_timestamps_are_rejected() {
        let (provider, storage) = provider("http://unused.invalid/".into(), 1_000_000);
        let mut info = CountryInfo {
            safe_ctry: "de".into(),
            ..CountryInfo::default()
        };
        info.last_success_at = 1_000_000 + MAX_FUTURE_SKEW_MS + 1;
        storage
            .set(STORAGE_KEY, serde_json::to_value(&info).unwrap())
            .await
            .unwrap();
        provider.load().await;
        assert_eq!(provider.safe_country_code().await, UNKNOWN_COUNTRY);
    }
}
