use reqwest::Client;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Online,
    Offline,
}

/// Polls a lightweight URL on a fixed interval.
///
/// The host page can also report its own offline state through
/// [`ConnectivityProbe::online_hint`]; while that says offline no request is
/// made at all.
pub struct ConnectivityProbe {
    client: Client,
    url: String,
    interval: Duration,
    online_hint: Arc<AtomicBool>,
}

impl ConnectivityProbe {
    pub fn new(client: Client, url: impl Into<String>, interval: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            interval,
            online_hint: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn online_hint(&self) -> Arc<AtomicBool> {
        self.online_hint.clone()
    }

    /// Any HTTP response counts as online; only transport failures do not.
    pub async fn check(&self) -> Connectivity {
        if !self.online_hint.load(Ordering::Relaxed) {
            return Connectivity::Offline;
        }
        match self.client.get(&self.url).send().await {
            Ok(resp) => {
                debug!("Connectivity probe: {} -> {}", self.url, resp.status());
                Connectivity::Online
            }
            Err(e) => {
                debug!("Connectivity probe failed: {}", e);
                Connectivity::Offline
            }
        }
    }

    /// Runs forever, publishing the state after every check. Subscribers
    /// only wake on transitions because `send_if_modified` skips repeats.
    pub async fn run(self, state: watch::Sender<Connectivity>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = self.check().await;
            state.send_if_modified(|current| {
                if *current == now {
                    return false;
                }
                match now {
                    Connectivity::Online => info!("Back online"),
                    Connectivity::Offline => warn!("Network unreachable, switching to downloads"),
                }
                *current = now;
                true
            });
            if state.is_closed() {
                debug!("No connectivity subscribers left, stopping probe");
                return;
            }
        }
    }
}
