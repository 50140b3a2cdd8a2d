use std::time::Duration;

use url::Url;

use crate::{AgencyError, AgencyResult};

/// Configuration for talking to the agency over HTTP.
#[derive(Debug, Clone)]
pub struct AgencyConfig {
    /// Agency endpoints in preference order.
    pub endpoints: Vec<Url>,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Top-level key all paths live under (e.g. `arango`); empty for none.
    pub root: String,
    /// How many times the full endpoint list is walked before giving up.
    pub failover_rounds: usize,
}

impl Default for AgencyConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            request_timeout: Duration::from_secs(10),
            root: "arango".into(),
            failover_rounds: 2,
        }
    }
}

impl AgencyConfig {
    /// Parse a comma-separated endpoint list (`http://a:8531,http://b:8531`).
    pub fn parse_endpoints(list: &str) -> AgencyResult<Vec<Url>> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|raw| {
                let normalized = raw
                    .replacen("tcp://", "http://", 1)
                    .replacen("ssl://", "https://", 1);
                Url::parse(&normalized).map_err(|e| AgencyError::InvalidEndpoint {
                    value: raw.to_string(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    pub fn with_endpoints(mut self, endpoints: Vec<Url>) -> Self {
        self.endpoints = endpoints;
        self
    }
}
