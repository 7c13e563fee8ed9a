use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use url::Url;

use super::types::UpcomingEvent;
use crate::http::{Network, Request};

/// Where upcoming appointments come from.
#[async_trait]
pub trait EventSource: Send + Sync {
  async fn upcoming(&self) -> Result<Vec<UpcomingEvent>>;
}

/// Reads upcoming events as a JSON array from the API.
pub struct HttpEventSource {
  network: Arc<dyn Network>,
  url: Url,
}

impl HttpEventSource {
  pub fn new(network: Arc<dyn Network>, url: Url) -> Self {
    Self { network, url }
  }
}

#[async_trait]
impl EventSource for HttpEventSource {
  async fn upcoming(&self) -> Result<Vec<UpcomingEvent>> {
    let request = Request::get(self.url.clone()).with_header("accept", "application/json");
    let response = self
      .network
      .fetch(&request)
      .await
      .map_err(|e| eyre!("Failed to fetch upcoming events: {}", e))?;

    if !response.is_success() {
      return Err(eyre!(
        "Upcoming events endpoint returned status {}",
        response.status
      ));
    }

    serde_json::from_slice(&response.body)
      .map_err(|e| eyre!("Failed to parse upcoming events: {}", e))
  }
}
