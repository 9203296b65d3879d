//! Thin HTTP client for the control plane. All CLI subcommands except
//! `serve` go through here.

use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("server unreachable at {0} (is `cao serve` running?)")]
    Unreachable(String),
    #[error("{kind}: {message}")]
    Api {
        status: u16,
        kind: String,
        message: String,
    },
    #[error("unexpected response: {0}")]
    Protocol(String),
}

impl ClientError {
    /// CLI exit code for this failure: 3 unreachable, 4 not found, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        match self {
            ClientError::Unreachable(_) => 3,
            ClientError::Api { status: 404, .. } => 4,
            _ => 1,
        }
    }
}

pub struct CaoClient {
    base: String,
    http: reqwest::Client,
}

impl CaoClient {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn handle(&self, response: reqwest::Response) -> Result<Value, ClientError> {
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        if status.is_success() {
            return Ok(body);
        }
        Err(ClientError::Api {
            status: status.as_u16(),
            kind: body
                .get("kind")
                .and_then(Value::as_str)
                .unwrap_or("internal")
                .to_string(),
            message: body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("request failed")
                .to_string(),
        })
    }

    async fn get(&self, path: &str) -> Result<Value, ClientError> {
        let response = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(|_| ClientError::Unreachable(self.base.clone()))?;
        self.handle(response).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, ClientError> {
        let response = self
            .http
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .map_err(|_| ClientError::Unreachable(self.base.clone()))?;
        self.handle(response).await
    }

    pub async fn health(&self) -> Result<Value, ClientError> {
        self.get("/health").await
    }

    pub async fn create_terminal(
        &self,
        agent: &str,
        provider: Option<&str>,
        cwd: Option<&str>,
    ) -> Result<Value, ClientError> {
        let mut body = serde_json::json!({ "agent": agent });
        if let Some(provider) = provider {
            body["provider"] = Value::String(provider.to_string());
        }
        if let Some(cwd) = cwd {
            body["cwd"] = Value::String(cwd.to_string());
        }
        self.post("/terminals", body).await
    }

    pub async fn list_terminals(&self) -> Result<Vec<Value>, ClientError> {
        match self.get("/terminals").await? {
            Value::Array(terminals) => Ok(terminals),
            other => Err(ClientError::Protocol(format!(
                "expected an array of terminals, got {other}"
            ))),
        }
    }

    pub async fn delete_terminal(&self, id: &str) -> Result<Value, ClientError> {
        let response = self
            .http
            .delete(self.url(&format!("/terminals/{id}")))
            .send()
            .await
            .map_err(|_| ClientError::Unreachable(self.base.clone()))?;
        self.handle(response).await
    }

    pub async fn add_flow(&self, content: &str) -> Result<Value, ClientError> {
        let response = self
            .http
            .post(self.url("/flows"))
            .body(content.to_string())
            .send()
            .await
            .map_err(|_| ClientError::Unreachable(self.base.clone()))?;
        self.handle(response).await
    }

    pub async fn list_flows(&self) -> Result<Vec<Value>, ClientError> {
        match self.get("/flows").await? {
            Value::Array(flows) => Ok(flows),
            other => Err(ClientError::Protocol(format!(
                "expected an array of flows, got {other}"
            ))),
        }
    }

    pub async fn run_flow(&self, name: &str) -> Result<Value, ClientError> {
        self.post(&format!("/flows/{name}/run"), Value::Null).await
    }

    pub async fn set_flow_enabled(&self, name: &str, enabled: bool) -> Result<Value, ClientError> {
        let response = self
            .http
            .patch(self.url(&format!("/flows/{name}")))
            .json(&serde_json::json!({ "enabled": enabled }))
            .send()
            .await
            .map_err(|_| ClientError::Unreachable(self.base.clone()))?;
        self.handle(response).await
    }

    pub async fn delete_flow(&self, name: &str) -> Result<Value, ClientError> {
        let response = self
            .http
            .delete(self.url(&format!("/flows/{name}")))
            .send()
            .await
            .map_err(|_| ClientError::Unreachable(self.base.clone()))?;
        self.handle(response).await
    }
}
