use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use tokio::time::Duration;

use super::{ClientError, Coordinator};

// HTTP transport for the coordinator surface. Stateless; one instance can
// be shared across tasks.
pub struct HttpCoordinator {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct AcquiredBody {
    token: String,
}

#[derive(Deserialize)]
struct RemainingBody {
    ttl: String,
}

#[derive(Deserialize)]
struct FailureBody {
    message: Option<String>,
}

impl HttpCoordinator {
    // `base_url` addresses the coordinator or the load balancer in front
    // of it, e.g. "http://localhost:8181".
    pub fn new(base_url: &str) -> HttpCoordinator {
        HttpCoordinator {
            base_url: base_url.trim_end_matches('/').to_owned(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn transport(err: reqwest::Error) -> ClientError {
    ClientError::Transport(err.to_string())
}

async fn failure(response: Response) -> ClientError {
    let status = response.status();
    let message = match response.json::<FailureBody>().await {
        Ok(body) => body.message.unwrap_or_else(|| status.to_string()),
        Err(_) => status.to_string(),
    };
    match status {
        StatusCode::BAD_REQUEST => ClientError::BadRequest(message),
        StatusCode::CONFLICT => ClientError::Conflict(message),
        StatusCode::NOT_FOUND => ClientError::NotFound,
        _ => ClientError::Server(message),
    }
}

fn format_ttl(ttl: Duration) -> String {
    humantime::format_duration(ttl).to_string()
}

#[async_trait]
impl Coordinator for HttpCoordinator {
    async fn acquire(&self, resource: &str, ttl: Duration) -> Result<String, ClientError> {
        let ttl = format_ttl(ttl);
        let response = self
            .http
            .post(self.url("/lock"))
            .query(&[("resource", resource), ("ttl", ttl.as_str())])
            .send()
            .await
            .map_err(transport)?;
        if response.status() != StatusCode::OK {
            return Err(failure(response).await);
        }
        let body: AcquiredBody = response.json().await.map_err(transport)?;
        Ok(body.token)
    }

    async fn release(&self, resource: &str, token: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.url("/unlock"))
            .query(&[("resource", resource), ("token", token)])
            .send()
            .await
            .map_err(transport)?;
        if response.status() != StatusCode::OK {
            return Err(failure(response).await);
        }
        Ok(())
    }

    async fn refresh(
        &self,
        resource: &str,
        token: &str,
        new_ttl: Duration,
    ) -> Result<(), ClientError> {
        let ttl = format_ttl(new_ttl);
        let response = self
            .http
            .post(self.url("/refresh"))
            .query(&[
                ("resource", resource),
                ("token", token),
                ("ttl", ttl.as_str()),
            ])
            .send()
            .await
            .map_err(transport)?;
        if response.status() != StatusCode::OK {
            return Err(failure(response).await);
        }
        Ok(())
    }

    async fn remaining_ttl(&self, resource: &str, token: &str) -> Result<Duration, ClientError> {
        let response = self
            .http
            .get(self.url("/ttl"))
            .query(&[("resource", resource), ("token", token)])
            .send()
            .await
            .map_err(transport)?;
        if response.status() != StatusCode::OK {
            return Err(failure(response).await);
        }
        let body: RemainingBody = response.json().await.map_err(transport)?;
        humantime::parse_duration(&body.ttl)
            .map_err(|err| ClientError::Server(format!("unparseable ttl '{}': {}", body.ttl, err)))
    }
}
