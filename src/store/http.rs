//! REST-backed session store.
//!
//! Wraps reqwest::Client with the identity header and optional bearer token.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{CallSession, CallSessionStore, StoreError};
use crate::calling::{CallKind, CallStatus, Identity};

/// Header carrying the local identity on every request.
const IDENTITY_HEADER: &str = "X-Pollcall-Identity";

/// Session store reached over HTTP/JSON.
pub struct HttpSessionStore {
    http: reqwest::Client,
    base_url: String,
    identity: Identity,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserProfile {
    display_name: Option<String>,
}

impl HttpSessionStore {
    pub fn new(base_url: &str, identity: Identity, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            identity,
            token,
        }
    }

    /// Base URL extended with percent-encoded path segments.
    fn url(&self, segments: &[&str]) -> Result<reqwest::Url, StoreError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| StoreError::Transport(format!("bad store URL {}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| StoreError::Transport(format!("store URL {} cannot take a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: reqwest::Method, url: &reqwest::Url) -> reqwest::RequestBuilder {
        let req = self
            .http
            .request(method, url.clone())
            .header(IDENTITY_HEADER, self.identity.as_str());
        match self.token {
            Some(ref token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
        url: &reqwest::Url,
    ) -> Result<T, StoreError> {
        let url = url.as_str();
        let resp = req
            .send()
            .await
            .map_err(|e| StoreError::Transport(format!("{} failed: {}", url, e)))?;
        let resp = check_response(resp, url).await?;
        resp.json::<T>()
            .await
            .map_err(|e| StoreError::Decode(format!("{}: {}", url, e)))
    }
}

#[async_trait]
impl CallSessionStore for HttpSessionStore {
    async fn create_call(
        &self,
        callee: &Identity,
        kind: CallKind,
        offer: &str,
    ) -> Result<CallSession, StoreError> {
        let url = self.url(&["calls"])?;
        tracing::debug!("Store POST {}", url);
        let body = serde_json::json!({
            "callee": callee,
            "kind": kind,
            "offer": offer,
        });
        self.send(self.request(reqwest::Method::POST, &url).json(&body), &url)
            .await
    }

    async fn fetch_session(&self, id: &str) -> Result<Option<CallSession>, StoreError> {
        let url = self.url(&["calls", id])?;
        tracing::debug!("Store GET {}", url);
        match self
            .send::<CallSession>(self.request(reqwest::Method::GET, &url), &url)
            .await
        {
            Ok(session) => Ok(Some(session)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn update_status(
        &self,
        id: &str,
        status: CallStatus,
    ) -> Result<CallSession, StoreError> {
        let url = self.url(&["calls", id, "status"])?;
        tracing::debug!("Store PUT {} ({})", url, status);
        let body = serde_json::json!({ "status": status });
        self.send(self.request(reqwest::Method::PUT, &url).json(&body), &url)
            .await
    }

    async fn submit_answer(&self, id: &str, answer: &str) -> Result<CallSession, StoreError> {
        let url = self.url(&["calls", id, "answer"])?;
        tracing::debug!("Store PUT {} ({} bytes)", url, answer.len());
        let body = serde_json::json!({ "answer": answer });
        self.send(self.request(reqwest::Method::PUT, &url).json(&body), &url)
            .await
    }

    async fn list_pending_inbound(
        &self,
        callee: &Identity,
    ) -> Result<Vec<CallSession>, StoreError> {
        let url = self.url(&["calls", "inbound", callee.as_str()])?;
        tracing::debug!("Store GET {}", url);
        self.send(self.request(reqwest::Method::GET, &url), &url)
            .await
    }

    async fn display_name(&self, who: &Identity) -> Result<Option<String>, StoreError> {
        let url = self.url(&["users", who.as_str()])?;
        match self
            .send::<UserProfile>(self.request(reqwest::Method::GET, &url), &url)
            .await
        {
            Ok(profile) => Ok(profile.display_name.filter(|n| !n.trim().is_empty())),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Check HTTP response status code and map failures onto `StoreError`.
async fn check_response(resp: reqwest::Response, url: &str) -> Result<reqwest::Response, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(map_status(status, url, body))
}

fn map_status(status: reqwest::StatusCode, url: &str, body: String) -> StoreError {
    match status {
        reqwest::StatusCode::NOT_FOUND => StoreError::NotFound(url.to_string()),
        reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
            StoreError::Unauthorized(format!("HTTP {} for {}", status.as_u16(), url))
        }
        _ => StoreError::Transport(format!("HTTP {} for {}: {}", status.as_u16(), url, body)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalized() {
        let store = HttpSessionStore::new("http://localhost:8080/api/", Identity::from("me"), None);
        assert_eq!(
            store.url(&["calls"]).unwrap().as_str(),
            "http://localhost:8080/api/calls"
        );
        let bare = HttpSessionStore::new("http://localhost:8080", Identity::from("me"), None);
        assert_eq!(
            bare.url(&["calls", "c1", "status"]).unwrap().as_str(),
            "http://localhost:8080/calls/c1/status"
        );
    }

    #[test]
    fn test_identity_is_escaped_in_path() {
        let store = HttpSessionStore::new("http://localhost:8080/api", Identity::from("me"), None);
        let url = store.url(&["users", "a/b?c#d"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/api/users/a%2Fb%3Fc%23d");
        assert_eq!(url.path_segments().unwrap().count(), 3);
        assert!(url.query().is_none());
    }

    #[test]
    fn test_unusable_base_url_is_transport_error() {
        let store = HttpSessionStore::new("not a url", Identity::from("me"), None);
        assert!(matches!(store.url(&["calls"]), Err(StoreError::Transport(_))));
    }

    #[test]
    fn test_status_mapping() {
        let e = map_status(reqwest::StatusCode::NOT_FOUND, "u", String::new());
        assert!(matches!(e, StoreError::NotFound(_)));
        let e = map_status(reqwest::StatusCode::FORBIDDEN, "u", String::new());
        assert!(matches!(e, StoreError::Unauthorized(_)));
        let e = map_status(reqwest::StatusCode::CONFLICT, "u", "stale".into());
        assert_eq!(e, StoreError::Transport("HTTP 409 for u: stale".into()));
    }

    #[test]
    fn test_session_wire_format() {
        let json = r#"{
            "id": "c1",
            "kind": "video",
            "status": "ringing",
            "caller": "alice",
            "callee": "bob",
            "offer": "v=0",
            "startTime": "2024-05-01T10:00:00Z"
        }"#;
        let session: CallSession = serde_json::from_str(json).unwrap();
        assert_eq!(session.status, CallStatus::Ringing);
        assert_eq!(session.kind, CallKind::Video);
        assert_eq!(session.offer.as_deref(), Some("v=0"));
        assert!(session.answer.is_none());
        assert!(session.end_time.is_none());
    }
}
