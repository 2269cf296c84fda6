//! ForgeClient — paginates the remote code-forge's GraphQL API to
//! enumerate a user's owned / starred / watched repositories and gists
//! (spec.md §4.5).

use std::collections::BTreeSet;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

const GRAPHQL_ENDPOINT: &str = "https://api.github.com/graphql";
const PAGE_SIZE: u32 = 50;
const USER_AGENT: &str = concat!("gitmirror/", env!("CARGO_PKG_VERSION"));

/// Host used to build clone URLs for owned/starred/watching/explicit-extra
/// repositories.
pub const GITHUB_HOST: &str = "github.com";
/// Host used to build clone URLs for gists.
pub const GIST_HOST: &str = "gist.github.com";

/// The four sets of stable identifiers discovered for a user.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub owned: BTreeSet<String>,
    pub starred: BTreeSet<String>,
    pub watching: BTreeSet<String>,
    pub gists: BTreeSet<String>,
}

/// Failures distinguishable to the retry engine and the caller.
#[derive(Debug, Clone)]
pub enum ForgeError {
    UserNotFound,
    ApiError(String),
    RateLimited { retry_after: Option<std::time::Duration> },
    Transport(String),
}

impl std::fmt::Display for ForgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForgeError::UserNotFound => write!(f, "forge user not found"),
            ForgeError::ApiError(msg) => write!(f, "forge API error: {msg}"),
            ForgeError::RateLimited { retry_after } => {
                write!(f, "forge rate limit hit (retry_after={retry_after:?})")
            }
            ForgeError::Transport(msg) => write!(f, "forge transport error: {msg}"),
        }
    }
}

impl std::error::Error for ForgeError {}

pub struct ForgeClient {
    http: Client,
    token: String,
    endpoint: String,
}

impl ForgeClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self::new_with_endpoint(token, GRAPHQL_ENDPOINT)
    }

    /// Builds a client against an arbitrary GraphQL endpoint, for pointing
    /// at a mock server in tests.
    pub fn new_with_endpoint(token: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            token: token.into(),
            endpoint: endpoint.into(),
        }
    }

    /// Discover a user's owned, starred, watching, and gist identifiers
    /// via a single compound query paginated across all four streams
    /// simultaneously.
    pub async fn load_repositories(&self, user: &str) -> Result<Discovery, ForgeError> {
        let mut discovery = Discovery::default();

        let mut owned_cursor: Option<String> = None;
        let mut starred_cursor: Option<String> = None;
        let mut watching_cursor: Option<String> = None;
        let mut gists_cursor: Option<String> = None;

        let mut owned_done = false;
        let mut starred_done = false;
        let mut watching_done = false;
        let mut gists_done = false;

        loop {
            let variables = json!({
                "login": user,
                "pageSize": PAGE_SIZE,
                "ownedAfter": owned_cursor,
                "starredAfter": starred_cursor,
                "watchingAfter": watching_cursor,
                "gistsAfter": gists_cursor,
            });

            let body = json!({
                "query": DISCOVERY_QUERY,
                "variables": variables,
            });

            let response = self
                .http
                .post(&self.endpoint)
                .bearer_auth(&self.token)
                .header("User-Agent", USER_AGENT)
                .json(&body)
                .send()
                .await
                .map_err(|e| ForgeError::Transport(e.to_string()))?;

            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(std::time::Duration::from_secs);
                return Err(ForgeError::RateLimited { retry_after });
            }

            let payload: GraphQlResponse = response
                .json()
                .await
                .map_err(|e| ForgeError::Transport(e.to_string()))?;

            if let Some(errors) = payload.errors {
                if let Some(first) = errors.into_iter().next() {
                    return Err(ForgeError::ApiError(first.message));
                }
            }

            let Some(data) = payload.data else {
                return Err(ForgeError::UserNotFound);
            };
            let Some(user_node) = data.user else {
                return Err(ForgeError::UserNotFound);
            };

            let mut new_edges = 0usize;

            if !owned_done {
                new_edges += ingest_repos(&mut discovery.owned, &user_node.repositories);
                owned_cursor = user_node.repositories.page_info.end_cursor.clone();
                owned_done = !user_node.repositories.page_info.has_next_page;
            }
            if !starred_done {
                new_edges += ingest_repos(&mut discovery.starred, &user_node.starred_repositories);
                starred_cursor = user_node.starred_repositories.page_info.end_cursor.clone();
                starred_done = !user_node.starred_repositories.page_info.has_next_page;
            }
            if !watching_done {
                new_edges += ingest_repos(&mut discovery.watching, &user_node.watching);
                watching_cursor = user_node.watching.page_info.end_cursor.clone();
                watching_done = !user_node.watching.page_info.has_next_page;
            }
            if !gists_done {
                let before = discovery.gists.len();
                for edge in &user_node.gists.nodes {
                    discovery.gists.insert(edge.name.clone());
                }
                new_edges += discovery.gists.len() - before;
                gists_cursor = user_node.gists.page_info.end_cursor.clone();
                gists_done = !user_node.gists.page_info.has_next_page;
            }

            debug!(new_edges, "discovery page fetched");

            if new_edges == 0 {
                break;
            }
        }

        info!(
            owned = discovery.owned.len(),
            starred = discovery.starred.len(),
            watching = discovery.watching.len(),
            gists = discovery.gists.len(),
            "forge discovery complete"
        );

        Ok(discovery)
    }
}

fn ingest_repos(set: &mut BTreeSet<String>, connection: &RepoConnection) -> usize {
    let before = set.len();
    for node in &connection.nodes {
        set.insert(node.name_with_owner.clone());
    }
    set.len() - before
}

const DISCOVERY_QUERY: &str = r#"
query Discovery($login: String!, $pageSize: Int!, $ownedAfter: String, $starredAfter: String, $watchingAfter: String, $gistsAfter: String) {
  user(login: $login) {
    repositories(ownerAffiliations: OWNER, first: $pageSize, after: $ownedAfter) {
      nodes { nameWithOwner }
      pageInfo { hasNextPage endCursor }
    }
    starredRepositories(first: $pageSize, after: $starredAfter) {
      nodes { nameWithOwner }
      pageInfo { hasNextPage endCursor }
    }
    watching(first: $pageSize, after: $watchingAfter) {
      nodes { nameWithOwner }
      pageInfo { hasNextPage endCursor }
    }
    gists(first: $pageSize, after: $gistsAfter) {
      nodes { name }
      pageInfo { hasNextPage endCursor }
    }
  }
}
"#;

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<GraphQlData>,
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct GraphQlData {
    user: Option<UserNode>,
}

#[derive(Debug, Deserialize)]
struct UserNode {
    repositories: RepoConnection,
    #[serde(rename = "starredRepositories")]
    starred_repositories: RepoConnection,
    watching: RepoConnection,
    gists: GistConnection,
}

#[derive(Debug, Deserialize)]
struct RepoConnection {
    nodes: Vec<RepoNode>,
    #[serde(rename = "pageInfo")]
    page_info: PageInfo,
}

#[derive(Debug, Deserialize)]
struct RepoNode {
    #[serde(rename = "nameWithOwner")]
    name_with_owner: String,
}

#[derive(Debug, Deserialize)]
struct GistConnection {
    nodes: Vec<GistNode>,
    #[serde(rename = "pageInfo")]
    page_info: PageInfo,
}

#[derive(Debug, Deserialize)]
struct GistNode {
    name: String,
}

#[derive(Debug, Deserialize)]
struct PageInfo {
    #[serde(rename = "hasNextPage")]
    has_next_page: bool,
    #[serde(rename = "endCursor")]
    end_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn single_page_body() -> serde_json::Value {
        json!({
            "data": {
                "user": {
                    "repositories": {
                        "nodes": [{"nameWithOwner": "octo/owned"}],
                        "pageInfo": {"hasNextPage": false, "endCursor": null}
                    },
                    "starredRepositories": {
                        "nodes": [{"nameWithOwner": "octo/starred"}],
                        "pageInfo": {"hasNextPage": false, "endCursor": null}
                    },
                    "watching": {
                        "nodes": [],
                        "pageInfo": {"hasNextPage": false, "endCursor": null}
                    },
                    "gists": {
                        "nodes": [{"name": "abc123"}],
                        "pageInfo": {"hasNextPage": false, "endCursor": null}
                    }
                }
            }
        })
    }

    fn empty_connection() -> serde_json::Value {
        json!({"nodes": [], "pageInfo": {"hasNextPage": false, "endCursor": null}})
    }

    fn client_for(server: &MockServer) -> ForgeClient {
        ForgeClient::new_with_endpoint("test-token", format!("{}/graphql", server.uri()))
    }

    #[tokio::test]
    async fn discovers_all_four_streams_in_one_page() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(single_page_body()))
            .mount(&server)
            .await;

        let discovery = client_for(&server).load_repositories("octo").await.unwrap();

        assert!(discovery.owned.contains("octo/owned"));
        assert!(discovery.starred.contains("octo/starred"));
        assert!(discovery.gists.contains("abc123"));
        assert!(discovery.watching.is_empty());
    }

    #[tokio::test]
    async fn paginates_a_stream_until_no_new_edges() {
        let server = MockServer::start().await;

        let first_page = json!({
            "data": {
                "user": {
                    "repositories": {
                        "nodes": [{"nameWithOwner": "octo/one"}],
                        "pageInfo": {"hasNextPage": true, "endCursor": "cursor-1"}
                    },
                    "starredRepositories": empty_connection(),
                    "watching": empty_connection(),
                    "gists": {"nodes": [], "pageInfo": {"hasNextPage": false, "endCursor": null}}
                }
            }
        });
        let second_page = json!({
            "data": {
                "user": {
                    "repositories": {
                        "nodes": [{"nameWithOwner": "octo/two"}],
                        "pageInfo": {"hasNextPage": false, "endCursor": null}
                    },
                    "starredRepositories": empty_connection(),
                    "watching": empty_connection(),
                    "gists": {"nodes": [], "pageInfo": {"hasNextPage": false, "endCursor": null}}
                }
            }
        });

        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(first_page))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(second_page))
            .mount(&server)
            .await;

        let discovery = client_for(&server).load_repositories("octo").await.unwrap();

        assert!(discovery.owned.contains("octo/one"));
        assert!(discovery.owned.contains("octo/two"));
    }

    #[tokio::test]
    async fn null_user_yields_user_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"user": null}})))
            .mount(&server)
            .await;

        let err = client_for(&server).load_repositories("octo").await.unwrap_err();
        assert!(matches!(err, ForgeError::UserNotFound));
    }

    #[tokio::test]
    async fn api_error_payload_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": [{"message": "Could not resolve to a User"}]
            })))
            .mount(&server)
            .await;

        let err = client_for(&server).load_repositories("octo").await.unwrap_err();
        match err {
            ForgeError::ApiError(msg) => assert_eq!(msg, "Could not resolve to a User"),
            other => panic!("expected ApiError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limit_response_surfaces_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "30"))
            .mount(&server)
            .await;

        let err = client_for(&server).load_repositories("octo").await.unwrap_err();
        match err {
            ForgeError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(std::time::Duration::from_secs(30)));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }
}
