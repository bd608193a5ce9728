// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cloud Controller v2 client.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use firehose_nozzle::TokenRefresher;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::app::{is_opt_out, App, AppSummary, Org, Space};
use crate::errors::ClientError;
use crate::rate_limit::RateLimiter;

const RESULTS_PER_PAGE: u32 = 100;

/// Remote enumeration of apps, orgs and spaces.
#[async_trait]
pub trait AppClient: Send + Sync {
    async fn app_by_guid(&self, guid: &str) -> Result<App, ClientError>;

    async fn list_orgs(&self) -> Result<Vec<Org>, ClientError>;

    async fn org_spaces(&self, org_guid: &str) -> Result<Vec<Space>, ClientError>;

    /// Apps deployed to a space, with their environment.
    async fn space_summary(&self, space_guid: &str) -> Result<Vec<AppSummary>, ClientError>;
}

/// Endpoints advertised by `/v2/info`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiInfo {
    #[serde(default)]
    pub token_endpoint: String,
    #[serde(default)]
    pub authorization_endpoint: String,
    #[serde(default)]
    pub doppler_logging_endpoint: String,
}

/// Reads `/v2/info`, which needs no credentials.
pub async fn discover_info(
    api_endpoint: &str,
    skip_ssl_validation: bool,
) -> Result<ApiInfo, ClientError> {
    let client = Client::builder()
        .danger_accept_invalid_certs(skip_ssl_validation)
        .build()?;
    let url = format!("{}/v2/info", api_endpoint.trim_end_matches('/'));
    let response = client.get(url).send().await?;
    classify_status(response.status())?;
    Ok(serde_json::from_slice(&response.bytes().await?)?)
}

fn classify_status(status: StatusCode) -> Result<(), ClientError> {
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::NOT_FOUND {
        return Err(ClientError::NotFound);
    }
    Err(ClientError::Status(status.as_u16()))
}

#[derive(Debug, Deserialize)]
struct Metadata {
    guid: String,
}

#[derive(Debug, Deserialize)]
struct Resource<T> {
    metadata: Metadata,
    entity: T,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default)]
    next_url: Option<String>,
    #[serde(default = "Vec::new")]
    resources: Vec<Resource<T>>,
}

#[derive(Debug, Deserialize)]
struct NamedEntity {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct SpaceEntity {
    #[serde(default)]
    name: String,
    #[serde(default)]
    organization_guid: String,
    organization: Option<Resource<NamedEntity>>,
}

#[derive(Debug, Deserialize)]
struct AppEntity {
    #[serde(default)]
    name: String,
    #[serde(default)]
    space_guid: String,
    #[serde(default)]
    environment_json: Option<HashMap<String, serde_json::Value>>,
    space: Option<Resource<SpaceEntity>>,
}

#[derive(Debug, Deserialize)]
struct SummaryApp {
    guid: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    environment_json: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct SpaceSummary {
    #[serde(default)]
    apps: Vec<SummaryApp>,
}

/// [`AppClient`] over the Cloud Controller v2 API.
pub struct CfClient {
    client: Client,
    api_endpoint: String,
    token_refresher: Arc<dyn TokenRefresher>,
    token: RwLock<Option<String>>,
    limiter: RateLimiter,
}

impl std::fmt::Debug for CfClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CfClient")
            .field("api_endpoint", &self.api_endpoint)
            .finish_non_exhaustive()
    }
}

impl CfClient {
    pub fn new(
        api_endpoint: impl Into<String>,
        token_refresher: Arc<dyn TokenRefresher>,
        skip_ssl_validation: bool,
    ) -> Result<Self, ClientError> {
        let client = Client::builder()
            .danger_accept_invalid_certs(skip_ssl_validation)
            .build()?;
        Ok(CfClient {
            client,
            api_endpoint: api_endpoint.into().trim_end_matches('/').to_string(),
            token_refresher,
            token: RwLock::new(None),
            limiter: RateLimiter::new(0),
        })
    }

    /// Caps outbound requests at `requests_per_second`. Every request takes a token, including
    /// follow-up pages and retries after a rejected token. Zero disables limiting.
    #[must_use]
    pub fn with_rate_limit(mut self, requests_per_second: u32) -> Self {
        self.limiter = RateLimiter::new(requests_per_second);
        self
    }

    async fn token(&self, force_refresh: bool) -> Result<String, ClientError> {
        if !force_refresh {
            if let Some(token) = self.token.read().await.as_ref() {
                return Ok(token.clone());
            }
        }
        let token = self
            .token_refresher
            .refresh_auth_token()
            .await
            .map_err(|e| ClientError::Token(e.to_string()))?;
        *self.token.write().await = Some(token.clone());
        Ok(token)
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{path}", self.api_endpoint)
        }
    }

    /// GETs `path`, refreshing the token once if it was rejected.
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = self.url(path);
        let mut refreshed = false;
        loop {
            let token = self.token(refreshed).await?;
            self.limiter.take().await;
            debug!("GET {url}");
            let response = self
                .client
                .get(&url)
                .header(AUTHORIZATION, token)
                .send()
                .await?;
            match classify_status(response.status()) {
                Ok(()) => return Ok(serde_json::from_slice(&response.bytes().await?)?),
                Err(ClientError::Status(401)) if !refreshed => refreshed = true,
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_all_pages<T: DeserializeOwned>(
        &self,
        first_page: String,
    ) -> Result<Vec<Resource<T>>, ClientError> {
        let mut resources = Vec::new();
        let mut next = Some(first_page);
        while let Some(path) = next {
            let page: Page<T> = self.get_json(&path).await?;
            resources.extend(page.resources);
            next = page.next_url.filter(|url| !url.is_empty());
        }
        Ok(resources)
    }
}

#[async_trait]
impl AppClient for CfClient {
    async fn app_by_guid(&self, guid: &str) -> Result<App, ClientError> {
        let app: Resource<AppEntity> = self
            .get_json(&format!("/v2/apps/{guid}?inline-relations-depth=2"))
            .await?;
        let environment = app.entity.environment_json.unwrap_or_default();
        let mut result = App {
            guid: app.metadata.guid,
            name: app.entity.name,
            space_guid: app.entity.space_guid,
            ignored_app: is_opt_out(&environment),
            ..App::default()
        };
        if let Some(space) = app.entity.space {
            result.space_guid = space.metadata.guid;
            result.space_name = space.entity.name;
            result.org_guid = space.entity.organization_guid;
            if let Some(org) = space.entity.organization {
                result.org_guid = org.metadata.guid;
                result.org_name = org.entity.name;
            }
        }
        Ok(result)
    }

    async fn list_orgs(&self) -> Result<Vec<Org>, ClientError> {
        let resources: Vec<Resource<NamedEntity>> = self
            .get_all_pages(format!(
                "/v2/organizations?results-per-page={RESULTS_PER_PAGE}"
            ))
            .await?;
        Ok(resources
            .into_iter()
            .map(|org| Org {
                guid: org.metadata.guid,
                name: org.entity.name,
            })
            .collect())
    }

    async fn org_spaces(&self, org_guid: &str) -> Result<Vec<Space>, ClientError> {
        let resources: Vec<Resource<SpaceEntity>> = self
            .get_all_pages(format!(
                "/v2/organizations/{org_guid}/spaces?results-per-page={RESULTS_PER_PAGE}"
            ))
            .await?;
        Ok(resources
            .into_iter()
            .map(|space| Space {
                guid: space.metadata.guid,
                name: space.entity.name,
                org_guid: if space.entity.organization_guid.is_empty() {
                    org_guid.to_string()
                } else {
                    space.entity.organization_guid
                },
            })
            .collect())
    }

    async fn space_summary(&self, space_guid: &str) -> Result<Vec<AppSummary>, ClientError> {
        let summary: SpaceSummary = self
            .get_json(&format!("/v2/spaces/{space_guid}/summary"))
            .await?;
        Ok(summary
            .apps
            .into_iter()
            .map(|app| AppSummary {
                guid: app.guid,
                name: app.name,
                environment: app.environment_json.unwrap_or_default(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use firehose_nozzle::NozzleError;
    use mockito::{Matcher, Server};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingRefresher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh_auth_token(&self) -> Result<String, NozzleError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("bearer token-{call}"))
        }
    }

    const APP_GUID: &str = "0c6f2b8e-6a43-4bd0-9d8b-2c1e3f5a7b90";

    fn client(server: &Server, refresher: Arc<CountingRefresher>) -> CfClient {
        CfClient::new(server.url(), refresher, false).unwrap()
    }

    #[tokio::test]
    async fn test_app_by_guid_resolves_space_and_org() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", format!("/v2/apps/{APP_GUID}").as_str())
            .match_query(Matcher::UrlEncoded(
                "inline-relations-depth".into(),
                "2".into(),
            ))
            .match_header("authorization", "bearer token-0")
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "metadata": {"guid": APP_GUID},
                    "entity": {
                        "name": "billing",
                        "space_guid": "space-1",
                        "environment_json": {"F2S_DISABLE_LOGGING": "true"},
                        "space": {
                            "metadata": {"guid": "space-1"},
                            "entity": {
                                "name": "prod",
                                "organization_guid": "org-1",
                                "organization": {
                                    "metadata": {"guid": "org-1"},
                                    "entity": {"name": "acme"}
                                }
                            }
                        }
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let app = client(&server, Arc::default())
            .app_by_guid(APP_GUID)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(
            app,
            App {
                guid: APP_GUID.to_string(),
                name: "billing".to_string(),
                space_guid: "space-1".to_string(),
                space_name: "prod".to_string(),
                org_guid: "org-1".to_string(),
                org_name: "acme".to_string(),
                ignored_app: true,
            }
        );
    }

    #[tokio::test]
    async fn test_missing_app_is_not_found() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", format!("/v2/apps/{APP_GUID}").as_str())
            .match_query(Matcher::Any)
            .with_status(404)
            .create_async()
            .await;

        let result = client(&server, Arc::default()).app_by_guid(APP_GUID).await;
        assert!(matches!(result, Err(ClientError::NotFound)));
    }

    #[tokio::test]
    async fn test_list_orgs_follows_pagination() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v2/organizations")
            .match_query(Matcher::UrlEncoded("results-per-page".into(), "100".into()))
            .with_status(200)
            .with_body(
                r#"{"next_url":"/v2/organizations?page=2","resources":[{"metadata":{"guid":"org-1"},"entity":{"name":"acme"}}]}"#,
            )
            .create_async()
            .await;
        server
            .mock("GET", "/v2/organizations")
            .match_query(Matcher::UrlEncoded("page".into(), "2".into()))
            .with_status(200)
            .with_body(
                r#"{"next_url":null,"resources":[{"metadata":{"guid":"org-2"},"entity":{"name":"globex"}}]}"#,
            )
            .create_async()
            .await;

        let orgs = client(&server, Arc::default()).list_orgs().await.unwrap();
        assert_eq!(
            orgs,
            vec![
                Org {
                    guid: "org-1".to_string(),
                    name: "acme".to_string()
                },
                Org {
                    guid: "org-2".to_string(),
                    name: "globex".to_string()
                }
            ]
        );
    }

    #[tokio::test]
    async fn test_every_page_is_rate_limited() {
        let mut server = Server::new_async().await;
        let first = server
            .mock("GET", "/v2/organizations")
            .match_query(Matcher::UrlEncoded("results-per-page".into(), "100".into()))
            .with_status(200)
            .with_body(r#"{"next_url":"/v2/organizations?page=2","resources":[]}"#)
            .create_async()
            .await;
        let mut pages = Vec::new();
        for page in 2..=6 {
            let next_url = if page < 6 {
                format!("\"/v2/organizations?page={}\"", page + 1)
            } else {
                "null".to_string()
            };
            pages.push(
                server
                    .mock("GET", "/v2/organizations")
                    .match_query(Matcher::UrlEncoded("page".into(), page.to_string()))
                    .with_status(200)
                    .with_body(format!(
                        r#"{{"next_url":{next_url},"resources":[{{"metadata":{{"guid":"org-{page}"}},"entity":{{"name":"org {page}"}}}}]}}"#
                    ))
                    .expect(1)
                    .create_async()
                    .await,
            );
        }

        let client = client(&server, Arc::default()).with_rate_limit(20);
        let start = std::time::Instant::now();
        let orgs = client.list_orgs().await.unwrap();

        first.assert_async().await;
        for page in pages {
            page.assert_async().await;
        }
        assert_eq!(orgs.len(), 5);
        // six requests at 20/s: the first is free, the next five wait 50ms each
        assert!(
            start.elapsed() >= std::time::Duration::from_millis(250),
            "{:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn test_token_retry_is_rate_limited() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v2/spaces/space-1/summary")
            .match_header("authorization", "bearer token-0")
            .with_status(401)
            .create_async()
            .await;
        server
            .mock("GET", "/v2/spaces/space-1/summary")
            .match_header("authorization", "bearer token-1")
            .with_status(200)
            .with_body(r#"{"apps":[]}"#)
            .create_async()
            .await;

        let client = client(&server, Arc::default()).with_rate_limit(5);
        let start = std::time::Instant::now();
        client.space_summary("space-1").await.unwrap();
        assert!(start.elapsed() >= std::time::Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_space_summary_lists_apps_with_environment() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v2/spaces/space-1/summary")
            .with_status(200)
            .with_body(
                r#"{"guid":"space-1","name":"prod","apps":[{"guid":"app-1","name":"billing","environment_json":{"F2S_DISABLE_LOGGING":"true"}},{"guid":"app-2","name":"web"}]}"#,
            )
            .create_async()
            .await;

        let apps = client(&server, Arc::default())
            .space_summary("space-1")
            .await
            .unwrap();
        assert_eq!(apps.len(), 2);
        assert!(apps[0].is_opt_out());
        assert!(!apps[1].is_opt_out());
    }

    #[tokio::test]
    async fn test_rejected_token_is_refreshed_once() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v2/organizations/org-1/spaces")
            .match_query(Matcher::Any)
            .match_header("authorization", "bearer token-0")
            .with_status(401)
            .create_async()
            .await;
        server
            .mock("GET", "/v2/organizations/org-1/spaces")
            .match_query(Matcher::Any)
            .match_header("authorization", "bearer token-1")
            .with_status(200)
            .with_body(
                r#"{"resources":[{"metadata":{"guid":"space-1"},"entity":{"name":"prod","organization_guid":"org-1"}}]}"#,
            )
            .create_async()
            .await;

        let refresher = Arc::new(CountingRefresher::default());
        let spaces = client(&server, refresher.clone())
            .org_spaces("org-1")
            .await
            .unwrap();

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            spaces,
            vec![Space {
                guid: "space-1".to_string(),
                name: "prod".to_string(),
                org_guid: "org-1".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_discover_info() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v2/info")
            .with_status(200)
            .with_body(r#"{"token_endpoint":"https://uaa.example.com","name":"cf"}"#)
            .create_async()
            .await;

        let info = discover_info(&server.url(), false).await.unwrap();
        assert_eq!(info.token_endpoint, "https://uaa.example.com");
    }
}
