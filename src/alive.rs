// Alive check - the hourly health heartbeat
//
// Callable from high-frequency paths; everything past the cooldown test
// is best-effort. The message deliberately bypasses the scheduler and
// the dedup store so that a broken pipeline still produces a signal.

use crate::clock::Clock;
use crate::config::Options;
use crate::country::CountryProvider;
use crate::transport::{OutboundMessage, Transport};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const ALIVE_ACTION: &str = "wtm.alive";

pub struct AliveCheck {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    country: Arc<CountryProvider>,
    options: Options,
    last_sent_hour: Mutex<Option<String>>,
}

impl AliveCheck {
    pub fn new(
        options: Options,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        country: Arc<CountryProvider>,
    ) -> Self {
        Self {
            transport,
            clock,
            country,
            options,
            last_sent_hour: Mutex::new(None),
        }
    }

    /// Emit at most one heartbeat per hour of activity. Errors never
    /// reach the caller.
    pub async fn ping(&self) {
        let hour = self.clock.hour();
        {
            let mut last = self.last_sent_hour.lock().await;
            if last.as_deref() == Some(hour.as_str()) {
                return;
            }
            *last = Some(hour.clone());
        }

        let ctry = self.country.safe_country_code().await;
        let message = OutboundMessage {
            action: ALIVE_ACTION.into(),
            payload: json!({
                "t": hour,
                "ctry": ctry,
                "platform": self.options.platform.as_deref().unwrap_or("other"),
            }),
            ver: self.options.message_version,
            deduplicate_by: None,
        };
        let body = message.envelope(&self.options, &self.clock.day());
        if let Err(err) = self.transport.send(body).await {
            tracing::debug!("alive signal not delivered: {err:#}");
        }
    }
}
