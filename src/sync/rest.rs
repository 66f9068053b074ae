//! HTTP connector for platforms exposing the common activities REST API.
//!
//! Both supported platforms speak the same shape: `POST /v1/activities`
//! creates and returns an id, `PUT /v1/activities/{id}` overwrites, and
//! `GET /v1/daily-totals?date=` aggregates a day. Attempt timeouts are
//! enforced by the sync manager, not here.

use futures::future::BoxFuture;
use serde::Deserialize;

use super::platform::{ActivityPayload, HealthPlatform, PlatformError};
use super::types::{DailyTotals, PlatformId};

/// REST client for one platform endpoint.
#[derive(Clone)]
pub struct RestPlatform {
    http: reqwest::Client,
    id: PlatformId,
    base_url: String,
    access_token: String,
}

/// Body of a successful activity creation.
#[derive(Debug, Deserialize)]
struct CreatedActivity {
    id: String,
}

impl RestPlatform {
    pub fn new(
        id: PlatformId,
        base_url: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            id,
            base_url: base_url.into(),
            access_token: access_token.into(),
        }
    }

    fn transport_error(error: reqwest::Error) -> PlatformError {
        if error.is_timeout() {
            PlatformError::Timeout
        } else {
            PlatformError::Network(error.to_string())
        }
    }

    /// Map a non-success status onto the connector error buckets.
    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, PlatformError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        match status.as_u16() {
            401 | 403 => Err(PlatformError::Unauthorized),
            429 => {
                tracing::warn!(platform = %self.id, "platform rate limit hit");
                Err(PlatformError::RateLimited)
            }
            400 | 422 => Err(PlatformError::InvalidPayload(message)),
            code => Err(PlatformError::Http {
                status: code,
                message,
            }),
        }
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, PlatformError> {
        let response = self.check(response).await?;
        response
            .json()
            .await
            .map_err(|e| PlatformError::Network(format!("malformed response body: {}", e)))
    }
}

impl HealthPlatform for RestPlatform {
    fn platform_id(&self) -> &PlatformId {
        &self.id
    }

    fn upload_activity(
        &self,
        payload: ActivityPayload,
    ) -> BoxFuture<'_, Result<String, PlatformError>> {
        Box::pin(async move {
            let url = format!("{}/v1/activities", self.base_url);
            let response = self
                .http
                .post(&url)
                .bearer_auth(&self.access_token)
                .json(&payload)
                .send()
                .await
                .map_err(Self::transport_error)?;

            let created: CreatedActivity = self.read_json(response).await?;
            Ok(created.id)
        })
    }

    fn update_activity(
        &self,
        external_id: String,
        payload: ActivityPayload,
    ) -> BoxFuture<'_, Result<(), PlatformError>> {
        Box::pin(async move {
            let url = format!("{}/v1/activities/{}", self.base_url, external_id);
            let response = self
                .http
                .put(&url)
                .bearer_auth(&self.access_token)
                .json(&payload)
                .send()
                .await
                .map_err(Self::transport_error)?;

            self.check(response).await?;
            Ok(())
        })
    }

    fn daily_totals(
        &self,
        date: chrono::NaiveDate,
    ) -> BoxFuture<'_, Result<DailyTotals, PlatformError>> {
        Box::pin(async move {
            let url = format!("{}/v1/daily-totals", self.base_url);
            let response = self
                .http
                .get(&url)
                .bearer_auth(&self.access_token)
                .query(&[("date", date.to_string())])
                .send()
                .await
                .map_err(Self::transport_error)?;

            self.read_json(response).await
        })
    }
}
