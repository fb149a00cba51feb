/*
 *  Copyright 2025-2026 Sluice Contributors
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! HTTP purge submission.
//!
//! Posts URL batches to a fast-purge style endpoint as
//! `{"objects": [...]}`. One call is one submission; retries live in the
//! [`Flusher`](super::Flusher).

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::error::FlushError;
use crate::flush::PurgeClient;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct PurgeRequest<'a> {
    objects: &'a [String],
}

/// Purge client submitting to a single HTTP endpoint.
pub struct HttpPurgeClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpPurgeClient {
    /// Creates a client for `endpoint`. The endpoint must be a valid
    /// absolute URL.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, FlushError> {
        let endpoint = endpoint.into();
        Url::parse(&endpoint)
            .map_err(|e| FlushError::InvalidUrl(endpoint.clone(), e.to_string()))?;

        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl PurgeClient for HttpPurgeClient {
    async fn purge(&self, urls: &[String]) -> Result<(), FlushError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&PurgeRequest { objects: urls })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FlushError::Status(status.as_u16()));
        }

        debug!(urls = urls.len(), status = status.as_u16(), "Purge accepted");
        Ok(())
    }
}
