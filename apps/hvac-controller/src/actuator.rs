use crate::config::Config;
use crate::policy::Action;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ActuationError {
    #[error("{0} does not map to an HVAC command")]
    NotActuatable(Action),
    #[error("HVAC request timed out")]
    Timeout,
    #[error("HVAC request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("HVAC endpoint returned {0}")]
    Status(StatusCode),
    #[error("malformed HVAC response: {0}")]
    Body(#[from] serde_json::Error),
}

impl From<reqwest::Error> for ActuationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ActuationError::Timeout
        } else {
            ActuationError::Transport(err)
        }
    }
}

#[derive(Deserialize)]
struct HvacResponse {
    #[serde(rename = "Response")]
    response: String,
}

#[derive(Clone)]
pub struct ActuatorClient {
    client: Client,
    host: String,
    token: String,
}

impl ActuatorClient {
    pub fn new(host: &str, token: &str, timeout: Duration) -> Result<Self, ActuationError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ActuationError::Transport)?;
        Ok(Self {
            client,
            host: host.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ActuationError> {
        Self::new(&config.host, &config.token, config.actuator_timeout())
    }

    pub fn command_url(&self, action: Action, ticks: u32) -> String {
        format!("{}/api/hvac/{}/{}/{}", self.host, self.token, action, ticks)
    }

    pub async fn send(&self, action: Action, ticks: u32) -> Result<String, ActuationError> {
        if !action.requires_actuation() {
            return Err(ActuationError::NotActuatable(action));
        }

        let response = self.client.get(self.command_url(action, ticks)).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ActuationError::Status(status));
        }

        let body = response.bytes().await?;
        let parsed: HvacResponse = serde_json::from_slice(&body)?;
        tracing::debug!(%action, ticks, response = %parsed.response, "HVAC command accepted");
        Ok(parsed.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::get;
    use axum::Router;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{addr}")
    }

    #[test]
    fn builds_command_url_without_double_slash() {
        let client = ActuatorClient::new("http://hvac.local/", "abc123", Duration::from_secs(1))
            .expect("client");
        assert_eq!(
            client.command_url(Action::TurnOnAc, 10),
            "http://hvac.local/api/hvac/abc123/TurnOnAc/10"
        );
    }

    #[tokio::test]
    async fn returns_reported_response() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let router = Router::new().route(
            "/api/hvac/{token}/{action}/{ticks}",
            get(move |Path((token, action, ticks)): Path<(String, String, u32)>| {
                let seen = seen_clone.clone();
                async move {
                    seen.lock().unwrap().push((token, action, ticks));
                    r#"{"Response":"Activating AC for 10 ticks"}"#
                }
            }),
        );
        let host = serve(router).await;

        let client = ActuatorClient::new(&host, "tok", Duration::from_secs(2)).expect("client");
        let status = client.send(Action::TurnOnAc, 10).await.expect("sent");
        assert_eq!(status, "Activating AC for 10 ticks");
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[("tok".to_string(), "TurnOnAc".to_string(), 10)]
        );
    }

    #[tokio::test]
    async fn no_action_is_never_sent() {
        let client = ActuatorClient::new("http://127.0.0.1:9", "tok", Duration::from_secs(1))
            .expect("client");
        let err = client.send(Action::NoAction, 10).await.unwrap_err();
        assert!(matches!(err, ActuationError::NotActuatable(Action::NoAction)));
    }

    #[tokio::test]
    async fn http_error_status_is_reported() {
        let router = Router::new().route(
            "/api/hvac/{token}/{action}/{ticks}",
            get(|| async { (AxumStatus::SERVICE_UNAVAILABLE, "down") }),
        );
        let host = serve(router).await;
        let client = ActuatorClient::new(&host, "tok", Duration::from_secs(2)).expect("client");
        let err = client.send(Action::TurnOnHeater, 10).await.unwrap_err();
        assert!(matches!(err, ActuationError::Status(s) if s == StatusCode::SERVICE_UNAVAILABLE));
    }

    #[tokio::test]
    async fn body_without_response_field_is_malformed() {
        let router = Router::new().route(
            "/api/hvac/{token}/{action}/{ticks}",
            get(|| async { r#"{"status":"ok"}"# }),
        );
        let host = serve(router).await;
        let client = ActuatorClient::new(&host, "tok", Duration::from_secs(2)).expect("client");
        let err = client.send(Action::TurnOnAc, 10).await.unwrap_err();
        assert!(matches!(err, ActuationError::Body(_)));
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let router = Router::new().route(
            "/api/hvac/{token}/{action}/{ticks}",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                r#"{"Response":"late"}"#
            }),
        );
        let host = serve(router).await;
        let client =
            ActuatorClient::new(&host, "tok", Duration::from_millis(150)).expect("client");
        let err = client.send(Action::TurnOnAc, 10).await.unwrap_err();
        assert!(matches!(err, ActuationError::Timeout));
    }
}
