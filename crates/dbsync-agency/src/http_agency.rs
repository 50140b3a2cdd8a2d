use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use reqwest::header::LOCATION;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use url::Url;

use crate::config::AgencyConfig;
use crate::ops::{TransactionOutcome, WriteTransaction, prefixed};
use crate::{AgencyError, AgencyResult, AgencyStore, ReadResult, tree};

const READ_API: &str = "/_api/agency/read";
const WRITE_API: &str = "/_api/agency/write";
/// Response header carrying the commit index a read was served at.
pub const INDEX_HEADER: &str = "x-agency-index";

/// Agency client speaking the HTTP/JSON agency API.
///
/// Requests go to the currently active endpoint. A 307 redirect makes the
/// `Location` host (the current leader) the active endpoint. The whole list
/// is walked at most `failover_rounds` times per request.
///
/// Reads rotate to the next endpoint on any transport error, timeout or 5xx.
/// Writes only move on when the endpoint never received the request (a
/// connect failure) or redirected it. A write that timed out or drew a 5xx
/// may already be committed, so it is never resent; the caller gets
/// [`AgencyError::Ambiguous`] instead.
pub struct HttpAgency {
    client: Client,
    config: AgencyConfig,
    endpoints: RwLock<Vec<Url>>,
    active: AtomicUsize,
}

impl HttpAgency {
    pub fn new(config: AgencyConfig) -> AgencyResult<Self> {
        if config.endpoints.is_empty() {
            return Err(AgencyError::NoEndpoints);
        }
        let client = Client::builder()
            .timeout(config.request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AgencyError::Transport(format!("build http client: {e}")))?;
        Ok(Self {
            client,
            endpoints: RwLock::new(config.endpoints.clone()),
            config,
            active: AtomicUsize::new(0),
        })
    }

    /// Endpoint the next request will be sent to.
    pub fn active_endpoint(&self) -> Url {
        let endpoints = self.endpoints.read().unwrap();
        let idx = self.active.load(Ordering::Acquire) % endpoints.len();
        endpoints[idx].clone()
    }

    fn endpoint_count(&self) -> usize {
        self.endpoints.read().unwrap().len()
    }

    fn rotate(&self) {
        let len = self.endpoint_count();
        let next = (self.active.load(Ordering::Acquire) + 1) % len;
        self.active.store(next, Ordering::Release);
    }

    fn follow_redirect(&self, location: &str) -> bool {
        let Ok(target) = Url::parse(location).and_then(|u| u.join("/")) else {
            tracing::warn!(location, "ignoring unparsable agency redirect");
            return false;
        };
        let mut endpoints = self.endpoints.write().unwrap();
        let idx = match endpoints.iter().position(|e| e.origin() == target.origin()) {
            Some(idx) => idx,
            None => {
                endpoints.push(target.clone());
                endpoints.len() - 1
            }
        };
        self.active.store(idx, Ordering::Release);
        tracing::debug!(leader = %target, "following agency leader redirect");
        true
    }

    async fn post(
        &self,
        api: &str,
        body: &Value,
        replay_safe: bool,
    ) -> AgencyResult<(StatusCode, u64, Value)> {
        let attempts = self.config.failover_rounds.max(1) * self.endpoint_count();
        let mut last_err = AgencyError::NoEndpoints;

        for _ in 0..attempts {
            let base = self.active_endpoint();
            let url = base
                .join(api)
                .map_err(|e| AgencyError::InvalidEndpoint {
                    value: base.to_string(),
                    reason: e.to_string(),
                })?;

            let resp = match self.client.post(url.clone()).json(body).send().await {
                Ok(resp) => resp,
                Err(err) => {
                    tracing::warn!(endpoint = %base, "agency request failed: {err}");
                    self.rotate();
                    if !replay_safe && !err.is_connect() {
                        return Err(AgencyError::Ambiguous(format!("{base}: {err}")));
                    }
                    last_err = if err.is_timeout() {
                        AgencyError::Timeout(self.config.request_timeout)
                    } else {
                        AgencyError::Transport(err.to_string())
                    };
                    continue;
                }
            };

            let status = resp.status();
            if status == StatusCode::TEMPORARY_REDIRECT {
                let location = resp
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned);
                match location {
                    Some(location) if self.follow_redirect(&location) => {}
                    _ => self.rotate(),
                }
                last_err = AgencyError::Unavailable(format!("{base} redirected"));
                continue;
            }
            if status.is_server_error() {
                tracing::warn!(endpoint = %base, %status, "agency endpoint unavailable");
                self.rotate();
                if !replay_safe {
                    return Err(AgencyError::Ambiguous(format!("{base} answered {status}")));
                }
                last_err = AgencyError::Unavailable(format!("{base} answered {status}"));
                continue;
            }

            let index = resp
                .headers()
                .get(INDEX_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let bytes = resp
                .bytes()
                .await
                .map_err(|e| AgencyError::Transport(e.to_string()))?;
            let value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).map_err(|e| AgencyError::Decode(e.to_string()))?
            };
            return Ok((status, index, value));
        }

        Err(last_err)
    }
}

#[async_trait]
impl AgencyStore for HttpAgency {
    async fn read(&self, path: &str) -> AgencyResult<ReadResult> {
        let key = prefixed(&self.config.root, path);
        let (status, index, body) = self.post(READ_API, &json!([[key]]), true).await?;
        if !status.is_success() {
            return Err(AgencyError::Decode(format!("read answered {status}: {body}")));
        }
        let first = body
            .as_array()
            .and_then(|results| results.first())
            .ok_or_else(|| AgencyError::Decode(format!("expected result array, got {body}")))?;
        let mut segs = tree::segments(&self.config.root);
        segs.extend(tree::segments(path));
        Ok(ReadResult {
            value: tree::get(first, &segs).cloned(),
            index,
        })
    }

    async fn transact(&self, tx: &WriteTransaction) -> AgencyResult<TransactionOutcome> {
        let body = tx.to_wire(&self.config.root);
        let (status, _, body) = self.post(WRITE_API, &body, false).await?;
        if status == StatusCode::PRECONDITION_FAILED {
            return Ok(TransactionOutcome::Rejected);
        }
        if !status.is_success() {
            return Err(AgencyError::Decode(format!("write answered {status}: {body}")));
        }
        let index = body
            .get("results")
            .and_then(Value::as_array)
            .and_then(|r| r.first())
            .and_then(Value::as_u64)
            .ok_or_else(|| AgencyError::Decode(format!("missing results in {body}")))?;
        if index == 0 {
            Ok(TransactionOutcome::Rejected)
        } else {
            Ok(TransactionOutcome::Committed { index })
        }
    }
}
