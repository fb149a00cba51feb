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

//! Cache Flush Trigger
//!
//! After a successful commit, edge caches still hold the previous content
//! for affected paths. The flusher turns those paths into purge URLs using
//! each environment's flush rules and submits them to the purge provider.
//!
//! Flushing is best-effort from the commit's point of view: the store
//! entries are already live and the edge converges on its own within
//! `cdn_max_expire_days`, so a commit never fails over a purge. A standalone
//! flush task has nothing else to show for itself, so there the error is
//! surfaced and the task fails.
//!
//! Two template forms are supported per rule. A plain base URL has the path
//! appended. A template containing `{path}` is an ARL-style form rendered by
//! substitution, with `{ttl}` filled from the path's cache class (this logic
//! has to match the behavior configured at the CDN edge).

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::{Environment, FlushRuleConfig, Settings};
use crate::error::{ConfigError, FlushError};
use crate::writer::backoff_delay;

pub mod client;

pub use client::HttpPurgeClient;

static OSTREE_REF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r".*/ostree/repo/refs/heads/.*/(base|standard)$").expect("static pattern")
});

/// Submits one batch of purge URLs to the provider.
///
/// Implementations perform a single submission; the [`Flusher`] owns the
/// retry policy around it.
#[async_trait]
pub trait PurgeClient: Send + Sync {
    async fn purge(&self, urls: &[String]) -> Result<(), FlushError>;
}

/// One flush rule with its path filters compiled.
struct FlushRule {
    name: String,
    templates: Vec<String>,
    includes: Vec<Regex>,
    excludes: Vec<Regex>,
}

impl FlushRule {
    fn compile(config: &FlushRuleConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            name: config.name.clone(),
            templates: config.templates.clone(),
            includes: compile_all(&config.includes)?,
            excludes: compile_all(&config.excludes)?,
        })
    }

    /// A path qualifies when no exclude matches and, if any includes are
    /// configured, at least one of them matches.
    fn wants(&self, path: &str) -> bool {
        if self.excludes.iter().any(|re| re.is_match(path)) {
            return false;
        }
        self.includes.is_empty() || self.includes.iter().any(|re| re.is_match(path))
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>, ConfigError> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })
        })
        .collect()
}

/// Renders and submits purge URLs for one environment's flush rules.
pub struct Flusher {
    env_name: String,
    rules: Vec<FlushRule>,
    settings: Arc<Settings>,
    client: Arc<dyn PurgeClient>,
}

impl Flusher {
    /// Compiles `env`'s flush rules. Fails if any rule pattern is invalid.
    pub fn new(
        env: &Environment,
        settings: Arc<Settings>,
        client: Arc<dyn PurgeClient>,
    ) -> Result<Self, ConfigError> {
        let rules = env
            .flush_rules()
            .iter()
            .map(FlushRule::compile)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            env_name: env.name().to_string(),
            rules,
            settings,
            client,
        })
    }

    /// Whether any rule would purge `path`.
    pub fn matches(&self, path: &str) -> bool {
        self.rules.iter().any(|rule| rule.wants(path))
    }

    /// Purge URLs for a single path across all qualifying rules.
    pub fn urls_for(&self, path: &str) -> Vec<String> {
        let mut out = Vec::new();
        // Rendered forms carry no leading slash; bases and ARL templates
        // both expect the bare path.
        let bare = path.strip_prefix('/').unwrap_or(path);
        let ttl = arl_ttl(bare);

        for rule in &self.rules {
            if !rule.wants(path) {
                continue;
            }
            for template in &rule.templates {
                if template.contains("{path}") {
                    out.push(template.replace("{path}", bare).replace("{ttl}", ttl));
                } else {
                    out.push(format!("{}/{}", template.trim_end_matches('/'), bare));
                }
            }
        }

        out
    }

    /// Renders URLs for `paths` and submits them, retrying retryable
    /// failures up to `flush_max_tries`. Returns the number of URLs
    /// submitted, or the final error once the retry budget is spent.
    pub async fn flush(&self, paths: &[String]) -> Result<usize, FlushError> {
        let urls: Vec<String> = paths.iter().flat_map(|p| self.urls_for(p)).collect();
        if urls.is_empty() {
            debug!(env = %self.env_name, "No cache flush URLs for this run");
            return Ok(0);
        }

        for url in &urls {
            debug!(env = %self.env_name, %url, "Flushing");
        }

        let max_tries = self.settings.flush_max_tries().max(1);
        let max_backoff = self.settings.actor_max_backoff();
        let mut tries = 0u32;

        loop {
            tries += 1;
            match self.client.purge(&urls).await {
                Ok(()) => {
                    info!(
                        env = %self.env_name,
                        urls = urls.len(),
                        "Completed cache flush"
                    );
                    return Ok(urls.len());
                }
                Err(error) if error.is_retryable() && tries < max_tries => {
                    let delay = backoff_delay(tries, max_backoff);
                    warn!(
                        env = %self.env_name,
                        %error,
                        tries,
                        delay_ms = delay.as_millis() as u64,
                        "Purge submission failed, will retry"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    warn!(
                        env = %self.env_name,
                        %error,
                        urls = urls.len(),
                        "Cache flush abandoned; edge caches will expire on their own"
                    );
                    return Err(error);
                }
            }
        }
    }
}

/// Cache TTL class for a path, as configured at the CDN edge.
///
/// Mutable entry points (repository indexes, directory requests) carry short
/// lifetimes and need matching purge ARLs; plain content is effectively
/// immutable and keeps the long default.
fn arl_ttl(path: &str) -> &'static str {
    if path.ends_with("/repodata/repomd.xml") || path.ends_with('/') {
        "4h"
    } else if path.ends_with("/PULP_MANIFEST")
        || path.ends_with("/listing")
        || path.contains("/repodata/")
        || OSTREE_REF_RE.is_match(path)
    {
        "10m"
    } else {
        "30d"
    }
}
