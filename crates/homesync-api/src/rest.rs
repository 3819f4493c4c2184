// REST API client
//
// Wraps `reqwest::Client` with hub URL construction, bearer auth and
// status-to-error mapping. `request_once` is the batched, never-failing
// read used by the state cache and the polling scheduler.

use std::collections::{BTreeSet, HashMap};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::error::Error;
use crate::fetch::{StateFetcher, complete_with_unavailable};
use crate::model::{Attributes, EntityKey, EntityState, StateValue};
use crate::transport::TransportConfig;

/// Query parameter used for the narrowed `GET /api/states` attempt.
const FILTER_PARAM: &str = "entity_id";

/// HTTP client for the hub's REST API.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: Url,
}

impl RestClient {
    /// Create a client that authenticates every request with `token`.
    pub fn new(
        base_url: Url,
        token: &SecretString,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        let http = transport.build_client(token)?;
        Ok(Self { http, base_url })
    }

    /// Create a client around a pre-built `reqwest::Client`.
    ///
    /// The caller is responsible for the `Authorization` header.
    pub fn with_client(http: reqwest::Client, base_url: Url) -> Self {
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    // ── URL builders ─────────────────────────────────────────────────

    /// `{base}/api/{path}`, preserving any path prefix on the base URL.
    pub(crate) fn api_url(&self, path: &str) -> Result<Url, Error> {
        let base = self.base_url.as_str().trim_end_matches('/');
        Ok(Url::parse(&format!("{base}/api/{path}"))?)
    }

    // ── Endpoints ────────────────────────────────────────────────────

    /// `GET /api/states`, optionally narrowed with repeated
    /// `entity_id` query parameters.
    pub async fn list_states(&self, filter: &[EntityKey]) -> Result<Vec<EntityState>, Error> {
        let mut url = self.api_url("states")?;
        if !filter.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for key in filter {
                pairs.append_pair(FILTER_PARAM, key.as_str());
            }
        }
        self.get_json(url).await
    }

    /// `GET /api/states/{entity_id}`; `None` when the hub does not know it.
    pub async fn get_state(&self, key: &EntityKey) -> Result<Option<EntityState>, Error> {
        let url = self.api_url(&format!("states/{key}"))?;
        match self.get_json(url).await {
            Ok(state) => Ok(Some(state)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// `POST /api/services/{domain}/{service}` with a JSON body.
    ///
    /// Returns the hub's response body (the states changed by the call).
    pub async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Option<&Value>,
    ) -> Result<Value, Error> {
        let url = self.api_url(&format!("services/{domain}/{service}"))?;
        debug!("POST {}", url);
        let empty = Value::Object(serde_json::Map::new());
        let resp = self
            .http
            .post(url)
            .json(data.unwrap_or(&empty))
            .send()
            .await?;
        Self::parse_json(resp).await
    }

    /// `POST /api/states/{entity_id}`: write a state directly.
    pub async fn set_state(
        &self,
        key: &EntityKey,
        status: &str,
        attributes: &Attributes,
    ) -> Result<EntityState, Error> {
        let url = self.api_url(&format!("states/{key}"))?;
        debug!("POST {}", url);
        let body = serde_json::json!({ "state": status, "attributes": attributes });
        let resp = self.http.post(url).json(&body).send().await?;
        Self::parse_json(resp).await
    }

    /// Resolve `keys` in one batched read.
    ///
    /// Tries the filtered query first and falls back to the full state
    /// list when the hub rejects the filter with HTTP 400. Keys missing
    /// from the response, and every key on any other failure, resolve to
    /// `"unavailable"`.
    pub async fn request_once(
        &self,
        keys: &BTreeSet<EntityKey>,
    ) -> HashMap<EntityKey, StateValue> {
        if keys.is_empty() {
            return HashMap::new();
        }

        let filter: Vec<EntityKey> = keys.iter().cloned().collect();
        let states = match self.list_states(&filter).await {
            Ok(states) => Ok(states),
            Err(Error::Http { status: 400, .. }) => {
                debug!(keys = keys.len(), "filtered state query rejected, fetching full set");
                self.list_states(&[]).await
            }
            Err(e) => Err(e),
        };

        match states {
            Ok(states) => {
                let found = states
                    .into_iter()
                    .filter(|s| keys.contains(&s.entity_id))
                    .map(|s| (s.entity_id.clone(), StateValue::from(s)))
                    .collect();
                complete_with_unavailable(keys, found)
            }
            Err(e) => {
                warn!(error = %e, keys = keys.len(), "state fetch failed, resolving batch as unavailable");
                complete_with_unavailable(keys, HashMap::new())
            }
        }
    }

    // ── Request helpers ──────────────────────────────────────────────

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, Error> {
        debug!("GET {}", url);
        let resp = self.http.get(url).send().await?;
        Self::parse_json(resp).await
    }

    async fn parse_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
        let status = resp.status();

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::Authentication {
                message: "hub rejected the access token".into(),
            });
        }

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let preview: String = body.chars().take(200).collect();
            return Err(Error::Http {
                status: status.as_u16(),
                message: preview,
            });
        }

        let body = resp.text().await?;
        serde_json::from_str(&body).map_err(|e| {
            let preview: String = body.chars().take(200).collect();
            Error::Deserialization {
                message: format!("{e} (body preview: {preview:?})"),
                body: body.clone(),
            }
        })
    }
}

impl StateFetcher for RestClient {
    fn request_once<'a>(
        &'a self,
        keys: &'a BTreeSet<EntityKey>,
    ) -> BoxFuture<'a, HashMap<EntityKey, StateValue>> {
        RestClient::request_once(self, keys).boxed()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn api_url_preserves_prefix() {
        let client = RestClient::with_client(
            reqwest::Client::new(),
            Url::parse("https://example.org/hass/").unwrap(),
        );
        assert_eq!(
            client.api_url("states").unwrap().as_str(),
            "https://example.org/hass/api/states"
        );
    }
}
