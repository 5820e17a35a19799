//! REST hypervisor driver. Node-mapping values are VM identifiers; the
//! API is expected to expose `GET /vms/{id}/status` returning
//! `{"status": "running" | "stopped"}` and `POST /vms/{id}/stop|start`.

use async_trait::async_trait;
use serde::Deserialize;

use super::driver::{DriverError, PowerState, RetryPolicy, StonithDriver};
use crate::p2p::client;
use crate::p2p::http::{Request, Response};

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

pub struct HypervisorDriver {
    api_url: String,
    token: String,
    retry: RetryPolicy,
}

#[derive(Deserialize)]
struct StatusReply {
    status: String,
}

impl HypervisorDriver {
    pub fn new(api_url: String, token: String, retry: RetryPolicy) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
            retry,
        }
    }

    async fn call(&self, method: &str, path: &str) -> Result<Response, DriverError> {
        let url = format!("{}{}", self.api_url, path);
        let (addr, path) = client::resolve_url(&url).await.map_err(DriverError::Unreachable)?;
        let mut request = if method == "GET" {
            Request::get(path)
        } else {
            Request::post_json(path, &serde_json::json!({}))
        };
        request
            .headers
            .insert("Authorization".to_string(), self.token.clone());
        let response = client::fetch(addr, request, REQUEST_TIMEOUT)
            .await
            .map_err(DriverError::Unreachable)?;
        if !response.is_success() {
            return Err(DriverError::Rejected {
                status: response.status,
                detail: String::from_utf8_lossy(&response.body).into_owned(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl StonithDriver for HypervisorDriver {
    fn kind(&self) -> &'static str {
        "hypervisor"
    }

    async fn test(&self) -> Result<(), DriverError> {
        self.call("GET", "/version").await.map(|_| ())
    }

    async fn status(&self, target: &str) -> Result<PowerState, DriverError> {
        let path = format!("/vms/{target}/status");
        let response = self.retry.run(|| self.call("GET", &path)).await?;
        let reply: StatusReply = response
            .json_body()
            .map_err(|e| DriverError::BadReply(e.to_string()))?;
        Ok(match reply.status.as_str() {
            "running" => PowerState::On,
            "stopped" => PowerState::Off,
            _ => PowerState::Unknown,
        })
    }

    async fn power_off(&self, target: &str) -> Result<(), DriverError> {
        let path = format!("/vms/{target}/stop");
        self.retry.run(|| self.call("POST", &path)).await.map(|_| ())
    }

    async fn power_on(&self, target: &str) -> Result<(), DriverError> {
        let path = format!("/vms/{target}/start");
        self.retry.run(|| self.call("POST", &path)).await.map(|_| ())
    }
}
