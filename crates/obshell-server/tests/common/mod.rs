// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for obshell-server integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use obshell_core::agent::AgentAddr;
use obshell_core::persistence::{SqlitePersistence, Stores};
use obshell_core::response::OcsResponse;
use obshell_core::task::{DagDetail, GenericId};
use obshell_core::{AgentContext, BackgroundWorkers, Config};
use obshell_security::{AuthHeader, BodyKeys, OCS_HEADER};
use obshell_server::{AgentLifecycle, ServerState, create_router};
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub const ROOT_PASSWORD: &str = "rootpw";

/// One agent served on an ephemeral port.
pub struct TestContext {
    pub state: ServerState,
    pub addr: AgentAddr,
    pub http: reqwest::Client,
    workers: Option<BackgroundWorkers>,
    shutdown: Arc<Notify>,
    server: JoinHandle<()>,
    _home: TempDir,
}

impl TestContext {
    /// Start an agent with the root password set and its workers running.
    pub async fn start() -> Self {
        let home = tempfile::tempdir().expect("Failed to create home");
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let port = listener.local_addr().unwrap().port();

        let config = Config {
            home: home.path().to_path_buf(),
            port,
            worker_count: 2,
            coordinator_interval: Duration::from_millis(200),
            ..Config::default()
        };
        let local = Arc::new(
            SqlitePersistence::from_path(config.local_db_path())
                .await
                .expect("Failed to open local store"),
        );
        let cluster = Arc::new(
            SqlitePersistence::from_path(config.cluster_db_path())
                .await
                .expect("Failed to open cluster store"),
        );
        let stores = Stores::sqlite(local, cluster);
        let ctx = AgentContext::assemble(config, stores, Some(ROOT_PASSWORD.to_string()))
            .await
            .expect("Failed to assemble agent");
        let workers = BackgroundWorkers::start(&ctx)
            .await
            .expect("Failed to start workers");

        let state = ServerState::new(ctx);
        let shutdown = Arc::new(Notify::new());
        let app = create_router(state.clone());
        let signal = shutdown.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.notified().await })
                .await
                .expect("Server failed");
        });
        state.set_lifecycle(AgentLifecycle::Running);

        // Give the server time to start
        tokio::time::sleep(Duration::from_millis(100)).await;

        Self {
            addr: AgentAddr::new("127.0.0.1", port),
            state,
            http: reqwest::Client::new(),
            workers: Some(workers),
            shutdown,
            server,
            _home: home,
        }
    }

    pub fn url(&self, uri: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.addr.port, uri)
    }

    /// A root-password header sealed for `uri`, minted at `now`.
    pub fn db_header(&self, uri: &str, now: i64, keys: Option<&BodyKeys>) -> String {
        let mut header = AuthHeader::new(ROOT_PASSWORD, uri, now, 10);
        if let Some(keys) = keys {
            header = header.with_body_keys(keys);
        }
        let public = self.state.ctx.keyring.key_pair().public_key().clone();
        header.seal(&public).expect("Failed to seal header")
    }

    /// GET `uri` authenticated with the root password.
    pub async fn get_as_db(&self, uri: &str) -> (u16, OcsResponse) {
        let resp = self
            .http
            .get(self.url(uri))
            .header(OCS_HEADER, self.db_header(uri, Utc::now().timestamp(), None))
            .send()
            .await
            .expect("Request failed");
        read(resp).await
    }

    /// Send `body` to `uri` authenticated with the root password, the body
    /// encrypted under fresh keys.
    pub async fn send_as_db(
        &self,
        method: reqwest::Method,
        uri: &str,
        body: &Value,
    ) -> (u16, OcsResponse) {
        let keys = BodyKeys::generate();
        let plain = serde_json::to_vec(body).unwrap();
        let resp = self
            .http
            .request(method, self.url(uri))
            .header(OCS_HEADER, self.db_header(uri, Utc::now().timestamp(), Some(&keys)))
            .header("Content-Type", "application/json")
            .body(keys.encrypt(&plain))
            .send()
            .await
            .expect("Request failed");
        read(resp).await
    }

    /// Poll `id` until it is terminal.
    pub async fn wait_finished(&self, id: GenericId) -> DagDetail {
        for _ in 0..250 {
            let detail = self.state.ctx.tasks.get_dag(id, true).await.expect("Failed to read dag");
            if detail.is_finished() {
                return detail;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("dag {} did not finish", id);
    }

    pub async fn stop(mut self) {
        self.shutdown.notify_one();
        let _ = (&mut self.server).await;
        if let Some(workers) = self.workers.take() {
            workers.shutdown().await;
        }
    }
}

pub async fn read(resp: reqwest::Response) -> (u16, OcsResponse) {
    let status = resp.status().as_u16();
    let body = resp.json::<OcsResponse>().await.expect("Response is not an envelope");
    (status, body)
}
