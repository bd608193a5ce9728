// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! OAuth2 client-credentials token refresher for the UAA.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, error};

use crate::errors::NozzleError;

const TOKEN_PATH: &str = "/oauth/token";

/// Supplies bearer credentials to a streaming session or an API client.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Returns a full `Authorization` header value, e.g. `bearer abc123`.
    async fn refresh_auth_token(&self) -> Result<String, NozzleError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UaaTokenRefresher {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl UaaTokenRefresher {
    pub fn new(
        uaa_endpoint: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        skip_ssl_validation: bool,
    ) -> Result<Self, NozzleError> {
        let client = Client::builder()
            .danger_accept_invalid_certs(skip_ssl_validation)
            .build()
            .map_err(|e| NozzleError::Token(e.to_string()))?;
        Ok(UaaTokenRefresher {
            client,
            token_url: format!("{}{TOKEN_PATH}", uaa_endpoint.trim_end_matches('/')),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        })
    }
}

#[async_trait]
impl TokenRefresher for UaaTokenRefresher {
    async fn refresh_auth_token(&self) -> Result<String, NozzleError> {
        debug!("Requesting token from {}", self.token_url);
        let response = self
            .client
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .header("Accept", "application/json")
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
            ])
            .send()
            .await
            .map_err(|e| NozzleError::Token(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            error!(
                "Error getting oauth token: status {}. Please check your Client ID and Secret.",
                status.as_u16()
            );
            return Err(NozzleError::Token(format!(
                "token endpoint returned {}",
                status.as_u16()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| NozzleError::Token(e.to_string()))?;
        let token_type = body.token_type.unwrap_or_else(|| "bearer".to_string());
        Ok(format!("{} {}", token_type.to_lowercase(), body.access_token))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[tokio::test]
    async fn test_refresh_returns_bearer_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth/token")
            .match_body(Matcher::UrlEncoded(
                "grant_type".into(),
                "client_credentials".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"abc123","token_type":"bearer","expires_in":599}"#)
            .create_async()
            .await;

        let refresher = UaaTokenRefresher::new(&server.url(), "nozzle", "secret", false).unwrap();
        let token = refresher.refresh_auth_token().await.unwrap();

        assert_eq!(token, "bearer abc123");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_surfaces_rejected_credentials() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/oauth/token")
            .with_status(401)
            .create_async()
            .await;

        let refresher = UaaTokenRefresher::new(&server.url(), "nozzle", "wrong", false).unwrap();
        let err = refresher.refresh_auth_token().await.unwrap_err();

        assert_eq!(
            err,
            NozzleError::Token("token endpoint returned 401".to_string())
        );
    }
}
