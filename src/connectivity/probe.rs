//! Connectivity signal for hosts without one: periodically probe the remote.

use reqwest::Client;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

use super::ConnectivityMonitor;

/// Probe `url` every `interval` and feed the result into `monitor`.
///
/// Any HTTP response counts as online; only transport failures count as offline.
/// Abort the returned handle to stop probing.
pub fn spawn_probe(
  monitor: ConnectivityMonitor,
  client: Client,
  url: Url,
  interval: Duration,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
      ticker.tick().await;
      let online = match client.head(url.clone()).timeout(interval).send().await {
        Ok(response) => {
          debug!(status = %response.status(), "Probe answered");
          true
        }
        Err(e) => {
          debug!(error = %e, "Probe failed");
          false
        }
      };
      monitor.set_online(online);
    }
  })
}
