// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Authenticated calls to peer agents.
//!
//! Every call fetches (and caches) the peer's RSA public key, seals an
//! [`AuthHeader`] minted for the exact URI, and encrypts the JSON body with
//! fresh AES keys carried inside the header. Responses are plain
//! [`OcsResponse`] JSON; a peer-side failure is re-wrapped as
//! `AGENT_RPC_ERROR(method, uri, peer, inner-code)`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use obshell_security::envelope::{
    AuthHeader, ForwardAgent, ForwardType, OCS_AGENT_HEADER, OCS_HEADER,
};
use obshell_security::keys::public_key_from_pem;
use obshell_security::{BodyKeys, RsaPublicKey};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::agent::AgentAddr;
use crate::coordinator::PeerProbe;
use crate::error::{Error, ErrorKind, Result};
use crate::persistence::ClusterStore;
use crate::response::OcsResponse;

use super::paths;

/// Header carrying the trace id of a request.
pub const TRACE_ID_HEADER: &str = "X-OBSHELL-Trace-ID";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Payload of `GET /api/v1/secret`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSecret {
    /// SPKI PEM public key.
    pub public_key: String,
}

/// How a call authenticates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcAuth {
    /// The peer's bearer token from the cluster store, in `OCS_AGENT_HEADER`.
    Token,
    /// An explicit agent password, in `OCS_AGENT_HEADER`.
    AgentPassword(String),
    /// The database root password, in `OCS_HEADER`.
    RootPassword(String),
}

struct ClientInner {
    http: reqwest::Client,
    cluster: Arc<dyn ClusterStore>,
    header_ttl: i64,
    keys: DashMap<AgentAddr, RsaPublicKey>,
}

/// Client for peer RPC. Cheap to clone.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("header_ttl", &self.inner.header_ttl)
            .field("cached_keys", &self.inner.keys.len())
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Create a client minting headers valid for `header_ttl`.
    pub fn new(cluster: Arc<dyn ClusterStore>, header_ttl: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                http,
                cluster,
                header_ttl: header_ttl.as_secs() as i64,
                keys: DashMap::new(),
            }),
        })
    }

    /// Public key of `peer`, fetched once then cached.
    pub async fn public_key(&self, peer: &AgentAddr) -> Result<RsaPublicKey> {
        if let Some(key) = self.inner.keys.get(peer) {
            return Ok(key.clone());
        }
        let url = format!("{}{}", peer.base_url(), paths::SECRET);
        let resp: OcsResponse<AgentSecret> = self.inner.http.get(&url).send().await?.json().await?;
        let secret = resp
            .into_result()?
            .ok_or_else(|| Error::with_args(ErrorKind::AgentRpcFailed, [peer.to_string(), "empty secret".to_string()]))?;
        let key = public_key_from_pem(&secret.public_key)?;
        self.inner.keys.insert(peer.clone(), key.clone());
        debug!(peer = %peer, "Cached peer public key");
        Ok(key)
    }

    /// Drop the cached key of `peer`.
    pub fn forget_key(&self, peer: &AgentAddr) {
        self.inner.keys.remove(peer);
    }

    /// GET with token authentication.
    pub async fn get<R: DeserializeOwned>(&self, peer: &AgentAddr, uri: &str) -> Result<Option<R>> {
        self.call::<(), R>(Method::GET, peer, uri, &RpcAuth::Token, None).await
    }

    /// POST with token authentication.
    pub async fn post<B: Serialize + Sync, R: DeserializeOwned>(
        &self,
        peer: &AgentAddr,
        uri: &str,
        body: &B,
    ) -> Result<Option<R>> {
        self.call(Method::POST, peer, uri, &RpcAuth::Token, Some(body)).await
    }

    /// Authenticated call. Retries once with a fresh public key when the
    /// peer cannot decrypt the header, which happens after it regenerated
    /// its key pair.
    #[instrument(skip_all, fields(method = %method, peer = %peer, uri = uri))]
    pub async fn call<B: Serialize + Sync, R: DeserializeOwned>(
        &self,
        method: Method,
        peer: &AgentAddr,
        uri: &str,
        auth: &RpcAuth,
        body: Option<&B>,
    ) -> Result<Option<R>> {
        let body = body.map(serde_json::to_vec).transpose()?;
        let resp = match self.send(&method, peer, uri, auth, body.as_deref()).await {
            Err(e) if e.kind() == ErrorKind::SecurityHeaderDecrypt => {
                warn!(peer = %peer, "Peer rejected the header, refreshing its public key");
                self.forget_key(peer);
                self.send(&method, peer, uri, auth, body.as_deref()).await
            }
            other => other,
        };
        let data = resp.map_err(|inner| wrap_remote(&method, uri, peer, inner))?;
        match data {
            None | Some(Value::Null) => Ok(None),
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
        }
    }

    async fn send(
        &self,
        method: &Method,
        peer: &AgentAddr,
        uri: &str,
        auth: &RpcAuth,
        body: Option<&[u8]>,
    ) -> Result<Option<Value>> {
        let public = self.public_key(peer).await?;
        let now = Utc::now().timestamp();
        let (header_name, mut header) = match auth {
            RpcAuth::Token => {
                let token = self
                    .inner
                    .cluster
                    .get_agent_token(&peer.ip, peer.port)
                    .await?
                    .ok_or_else(|| Error::with_args(ErrorKind::AgentNotExist, [peer]))?;
                (
                    OCS_AGENT_HEADER,
                    AuthHeader::new("", uri, now, self.inner.header_ttl).with_token(token),
                )
            }
            RpcAuth::AgentPassword(password) => (
                OCS_AGENT_HEADER,
                AuthHeader::new(password.as_str(), uri, now, self.inner.header_ttl),
            ),
            RpcAuth::RootPassword(password) => (
                OCS_HEADER,
                AuthHeader::new(password.as_str(), uri, now, self.inner.header_ttl),
            ),
        };

        let url = format!("{}{}", peer.base_url(), uri);
        let mut request = self.inner.http.request(method.clone(), &url);
        if let Some(body) = body {
            let keys = BodyKeys::generate();
            header = header.with_body_keys(&keys);
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(keys.encrypt(body));
        }
        let request = request.header(header_name, header.seal(&public)?);

        read_response(peer, request.send().await?).await?.into_result()
    }

    /// Replay a request this agent already verified on `peer`, usually the
    /// maintainer. The peer authenticates the forwarder's token against the
    /// forwarder's registered identity. The peer's response is returned
    /// as-is, failures included.
    #[instrument(skip_all, fields(method = %req.method, peer = %peer, uri = %req.uri))]
    pub async fn forward(&self, peer: &AgentAddr, req: ForwardRequest<'_>) -> Result<OcsResponse> {
        let public = self.public_key(peer).await?;
        let now = Utc::now().timestamp();
        let mut header = AuthHeader::new("", req.uri, now, self.inner.header_ttl)
            .with_token(req.token)
            .forwarded_by(req.forward_type, req.forwarder);

        let url = format!("{}{}", peer.base_url(), req.uri);
        let mut request = self
            .inner
            .http
            .request(req.method, &url)
            .header(TRACE_ID_HEADER, req.trace_id);
        if let Some(body) = req.body {
            let keys = BodyKeys::generate();
            header = header.with_body_keys(&keys);
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(keys.encrypt(body));
        }
        let request = request.header(OCS_AGENT_HEADER, header.seal(&public)?);
        read_response(peer, request.send().await?).await
    }
}

/// A verified request to replay on another agent.
#[derive(Debug)]
pub struct ForwardRequest<'a> {
    /// Method of the original request.
    pub method: Method,
    /// Path and query of the original request.
    pub uri: &'a str,
    /// Plain body of the original request.
    pub body: Option<&'a [u8]>,
    /// Trace id of the original request.
    pub trace_id: &'a str,
    /// This agent.
    pub forwarder: ForwardAgent,
    /// This agent's own token.
    pub token: &'a str,
    /// Forwarding mode.
    pub forward_type: ForwardType,
}

async fn read_response(peer: &AgentAddr, response: reqwest::Response) -> Result<OcsResponse> {
    let status = response.status();
    let text = response.text().await?;
    serde_json::from_str(&text).map_err(|_| {
        Error::with_args(
            ErrorKind::AgentRpcFailed,
            [peer.to_string(), format!("status {}: {}", status, truncate(&text))],
        )
    })
}

/// Code of the peer-side error carried by an `AGENT_RPC_ERROR`.
pub fn remote_code(err: &Error) -> Option<&str> {
    if err.kind() != ErrorKind::AgentRpcError {
        return None;
    }
    err.args().get(3).map(String::as_str)
}

fn wrap_remote(method: &Method, uri: &str, peer: &AgentAddr, inner: Error) -> Error {
    match inner.kind() {
        ErrorKind::AgentRpcFailed | ErrorKind::AgentNotExist => inner,
        _ => Error::with_args(
            ErrorKind::AgentRpcError,
            [
                method.to_string(),
                uri.to_string(),
                peer.to_string(),
                inner.code().to_string(),
                inner.to_string(),
            ],
        ),
    }
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(256) {
        Some((i, _)) => &text[..i],
        None => text,
    }
}

#[async_trait]
impl PeerProbe for RpcClient {
    async fn is_alive(&self, addr: &AgentAddr) -> bool {
        let url = format!("{}{}", addr.base_url(), paths::STATUS);
        match self.inner.http.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(peer = %addr, error = %e, "Peer probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::agent::AgentIdentity;
    use crate::agent::AgentStatus;
    use crate::persistence::SqlitePersistence;
    use obshell_security::AgentKeyPair;
    use std::sync::OnceLock;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub(crate) fn peer_pair() -> &'static AgentKeyPair {
        static PAIR: OnceLock<AgentKeyPair> = OnceLock::new();
        PAIR.get_or_init(|| AgentKeyPair::generate_with_bits(1024).unwrap())
    }

    pub(crate) fn addr_of(server: &MockServer) -> AgentAddr {
        let socket = server.address();
        AgentAddr::new(socket.ip().to_string(), socket.port())
    }

    /// Mount the secret endpoint and register the peer with token `tok`.
    pub(crate) async fn mock_peer(server: &MockServer, store: &SqlitePersistence) -> AgentAddr {
        let secret = AgentSecret {
            public_key: peer_pair().public_pem().unwrap(),
        };
        Mock::given(method("GET"))
            .and(path(paths::SECRET))
            .respond_with(ResponseTemplate::new(200).set_body_json(OcsResponse::ok(Some(secret))))
            .mount(server)
            .await;
        let addr = addr_of(server);
        let identity = AgentIdentity::single(addr.ip.clone(), addr.port, 2881);
        store.insert_agent(&identity, AgentStatus::Active, "tok").await.unwrap();
        addr
    }

    #[tokio::test]
    async fn test_post_seals_header_and_encrypts_body() {
        let server = MockServer::start().await;
        let store = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let peer = mock_peer(&server, &store).await;
        Mock::given(method("POST"))
            .and(path(paths::SUB_DAG))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(OcsResponse::ok(Some(serde_json::json!({"id": "05"})))),
            )
            .mount(&server)
            .await;

        let client = RpcClient::new(store, Duration::from_secs(10)).unwrap();
        let data: Option<Value> = client
            .post(&peer, paths::SUB_DAG, &serde_json::json!({"hello": "world"}))
            .await
            .unwrap();
        assert_eq!(data.unwrap()["id"], "05");

        let requests = server.received_requests().await.unwrap();
        let post = requests.iter().find(|r| r.method.as_str() == "POST").unwrap();
        let sealed = post.headers.get(OCS_AGENT_HEADER).unwrap().to_str().unwrap();
        let header = AuthHeader::open(peer_pair(), sealed).unwrap();
        header.verify_uri(paths::SUB_DAG).unwrap();
        header.verify_fresh(Utc::now().timestamp()).unwrap();
        assert_eq!(header.token, "tok");
        let plain = header.body_keys().unwrap().unwrap().decrypt(&post.body).unwrap();
        let body: Value = serde_json::from_slice(&plain).unwrap();
        assert_eq!(body["hello"], "world");
    }

    #[tokio::test]
    async fn test_peer_error_is_rewrapped() {
        let server = MockServer::start().await;
        let store = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let peer = mock_peer(&server, &store).await;
        let inner = Error::with_args(ErrorKind::TaskNotFound, ["042"]);
        Mock::given(method("GET"))
            .and(path("/api/v1/task/dag/042"))
            .respond_with(ResponseTemplate::new(404).set_body_json(OcsResponse::<()>::fail(&inner)))
            .mount(&server)
            .await;

        let client = RpcClient::new(store, Duration::from_secs(10)).unwrap();
        let err = client
            .get::<Value>(&peer, &paths::dag("042"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AgentRpcError);
        assert_eq!(remote_code(&err), Some("TASK_NOT_FOUND"));
        assert_eq!(err.args()[0], "GET");
        assert_eq!(err.args()[2], peer.to_string());
    }

    #[tokio::test]
    async fn test_unknown_peer_and_probe() {
        let server = MockServer::start().await;
        let store = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let client = RpcClient::new(store, Duration::from_secs(10)).unwrap();
        let peer = addr_of(&server);
        assert!(!client.is_alive(&peer).await);

        Mock::given(method("GET"))
            .and(path(paths::STATUS))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        assert!(client.is_alive(&peer).await);

        // no secret endpoint mounted
        let err = client.get::<Value>(&peer, paths::MAINTAIN_DAG).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::AgentRpcFailed | ErrorKind::AgentRpcError));
    }
    #[tokio::test]
    async fn test_forward_relays_peer_failure_verbatim() {
        let server = MockServer::start().await;
        let store = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let peer = mock_peer(&server, &store).await;
        let inner = Error::with_args(ErrorKind::AgentNotExist, ["10.0.0.9:2886"]);
        Mock::given(method("DELETE"))
            .and(path(paths::AGENT))
            .respond_with(ResponseTemplate::new(404).set_body_json(OcsResponse::<()>::fail(&inner)))
            .mount(&server)
            .await;

        let client = RpcClient::new(store, Duration::from_secs(10)).unwrap();
        let resp = client
            .forward(
                &peer,
                ForwardRequest {
                    method: Method::DELETE,
                    uri: paths::AGENT,
                    body: Some(&br#"{"agent":{"ip":"10.0.0.9","port":2886}}"#[..]),
                    trace_id: "trace-7",
                    forwarder: ForwardAgent {
                        ip: "10.0.0.1".to_string(),
                        port: 2886,
                    },
                    token: "my-token",
                    forward_type: ForwardType::Auto,
                },
            )
            .await
            .unwrap();
        assert!(!resp.successful);
        assert_eq!(resp.status, 404);
        assert_eq!(resp.error.unwrap().code, "AGENT_NOT_EXIST");

        let requests = server.received_requests().await.unwrap();
        let delete = requests.iter().find(|r| r.method.as_str() == "DELETE").unwrap();
        assert_eq!(delete.headers.get(TRACE_ID_HEADER).unwrap(), "trace-7");
        let sealed = delete.headers.get(OCS_AGENT_HEADER).unwrap().to_str().unwrap();
        let header = AuthHeader::open(peer_pair(), sealed).unwrap();
        assert!(header.is_forwarded());
        assert_eq!(header.token, "my-token");
        assert_eq!(header.forward_agent.as_ref().unwrap().ip, "10.0.0.1");
        let plain = header.body_keys().unwrap().unwrap().decrypt(&delete.body).unwrap();
        assert!(String::from_utf8(plain).unwrap().contains("10.0.0.9"));
    }
}
