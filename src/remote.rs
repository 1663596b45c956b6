//! HTTP adapter for the central database.
//!
//! Every RPC is a JSON `POST <base_url>/rpc/<method>`. A `409 Conflict` on
//! evidence submission means the database already has it (or it was empty).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::database::CentralDatabase;
use crate::error::DatabaseError;
use crate::types::{
    AgentIdentity, FactoryKey, QueueCategory, QueuedItem, SignatureKind, StatusReply, SubmitOutcome, SyncInfo,
};

#[derive(Deserialize)]
struct SignatureReply {
    signature: String,
}

pub struct HttpCentralDatabase {
    base_url: String,
    client: reqwest::Client,
}

impl HttpCentralDatabase {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DatabaseError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DatabaseError::Unreachable(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, method: &str) -> String {
        format!("{}/rpc/{}", self.base_url, method)
    }

    async fn post(&self, method: &str, body: Value) -> Result<reqwest::Response, DatabaseError> {
        debug!(method, "central database call");
        let response = self.client.post(self.url(method)).json(&body).send().await?;
        Ok(response)
    }

    async fn rpc<T: DeserializeOwned>(&self, method: &str, body: Value) -> Result<T, DatabaseError> {
        let response = self.post(method, body).await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(DatabaseError::Rejected(format!("{method}: {status} {text}")));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| DatabaseError::Malformed(format!("{method}: {e}")))
    }

    /// RPC whose reply body carries nothing.
    async fn notify(&self, method: &str, body: Value) -> Result<(), DatabaseError> {
        let response = self.post(method, body).await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DatabaseError::Rejected(format!("{method}: {status}")))
        }
    }
}

#[async_trait]
impl CentralDatabase for HttpCentralDatabase {
    async fn ping(&self) -> Result<(), DatabaseError> {
        self.notify("ping", json!({})).await
    }

    async fn signature(&self, kind: SignatureKind) -> Result<String, DatabaseError> {
        let reply: SignatureReply = self.rpc("signature", json!({ "kind": kind })).await?;
        Ok(reply.signature)
    }

    async fn factory_key(&self, ident: &str) -> Result<Option<FactoryKey>, DatabaseError> {
        self.rpc("factory_key", json!({ "ident": ident })).await
    }

    async fn factory_keys(&self) -> Result<HashMap<String, FactoryKey>, DatabaseError> {
        self.rpc("factory_keys", json!({})).await
    }

    async fn agent_status(&self, identity: &AgentIdentity) -> Result<StatusReply, DatabaseError> {
        self.rpc("agent_status", json!(identity)).await
    }

    async fn agent_uninstall(&self, agent_id: &str) -> Result<(), DatabaseError> {
        self.notify("agent_uninstall", json!({ "agent_id": agent_id })).await
    }

    async fn sync_start(&self, info: &SyncInfo) -> Result<(), DatabaseError> {
        self.notify("sync_start", json!(info)).await
    }

    async fn sync_update(&self, info: &SyncInfo) -> Result<(), DatabaseError> {
        self.notify("sync_update", json!(info)).await
    }

    async fn sync_timeout(&self, info: &SyncInfo) -> Result<(), DatabaseError> {
        self.notify("sync_timeout", json!(info)).await
    }

    async fn sync_end(&self, info: &SyncInfo) -> Result<(), DatabaseError> {
        self.notify("sync_end", json!(info)).await
    }

    async fn send_evidence(&self, instance: &str, blob: &[u8]) -> Result<SubmitOutcome, DatabaseError> {
        let body = json!({ "instance": instance, "content": STANDARD.encode(blob) });
        let response = self.post("send_evidence", body).await?;
        match response.status() {
            StatusCode::CONFLICT => Ok(SubmitOutcome::Conflict),
            status if status.is_success() => Ok(SubmitOutcome::Accepted),
            status => Err(DatabaseError::Rejected(format!("send_evidence: {status}"))),
        }
    }

    async fn fetch_queue(&self, category: QueueCategory, agent_id: &str) -> Result<Vec<QueuedItem>, DatabaseError> {
        self.rpc("fetch_queue", json!({ "category": category, "agent_id": agent_id }))
            .await
    }

    async fn delete_queue_item(
        &self,
        category: QueueCategory,
        agent_id: &str,
        item_id: &str,
    ) -> Result<(), DatabaseError> {
        self.notify(
            "delete_queue_item",
            json!({ "category": category, "agent_id": agent_id, "item_id": item_id }),
        )
        .await
    }

    async fn purge_queue(&self, category: QueueCategory, agent_id: &str) -> Result<(), DatabaseError> {
        self.notify("purge_queue", json!({ "category": category, "agent_id": agent_id }))
            .await
    }
}
