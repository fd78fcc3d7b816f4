//! SpamCheck (C9): POSTs the raw message to the configured scoring API and
//! records the result as an `X-Spam-Score` header.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Handler, HandlerError};
use crate::state::SessionState;

const DEFAULT_API_URL: &str = "https://spamcheck.postmarkapp.com/filter";

#[derive(Serialize)]
struct SpamCheckRequest<'a> {
    email: &'a str,
    options: &'a str,
}

#[derive(Deserialize)]
struct SpamCheckResponse {
    score: String,
}

pub struct SpamCheck {
    client: reqwest::Client,
    api_url: String,
}

impl SpamCheck {
    pub fn new(client: reqwest::Client) -> Self {
        SpamCheck { client, api_url: DEFAULT_API_URL.to_string() }
    }

    pub fn with_api_url(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        SpamCheck { client, api_url: api_url.into() }
    }

    async fn fetch_score(&self, message: &str) -> Result<String, reqwest::Error> {
        let request = SpamCheckRequest { email: message, options: "long" };
        let response: SpamCheckResponse = self
            .client
            .post(&self.api_url)
            .json(&request)
            .send()
            .await?
            .json()
            .await?;
        Ok(response.score)
    }
}

#[async_trait]
impl Handler for SpamCheck {
    fn name(&self) -> &str {
        "spamcheck"
    }

    async fn handle(&self, state: &mut SessionState) -> Result<(), HandlerError> {
        let message = String::from_utf8_lossy(&state.envelope.data).into_owned();

        let mut score = match self.fetch_score(&message).await {
            Ok(score) => score,
            Err(e) => {
                log::warn!("spamcheck: api error: {}", e);
                return Ok(());
            }
        };

        if score.trim().is_empty() {
            score = match self.fetch_score(&message).await {
                Ok(score) => score,
                Err(e) => {
                    log::warn!("spamcheck: retry failed: {}", e);
                    return Ok(());
                }
            };
        }

        if score.trim().is_empty() {
            return Ok(());
        }

        state.envelope.headers.push(("X-Spam-Score".to_string(), score));
        Ok(())
    }
}
