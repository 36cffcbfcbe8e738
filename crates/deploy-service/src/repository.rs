//! Repository hosting API client
//!
//! Detection only needs two operations from the host: the top-level file
//! listing of a repository and the raw content of one file.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("unsupported repository URL: {0}")]
    UnsupportedUrl(String),

    #[error("repository host returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("repository host request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[async_trait]
pub trait RepositoryHost: Send + Sync {
    /// Names of the files and directories at the repository root
    async fn list_top_level(&self, repo_url: &str) -> Result<Vec<String>, HostError>;

    /// Raw content of a file on the default branch
    async fn fetch_file(&self, repo_url: &str, path: &str) -> Result<String, HostError>;
}

/// Owner and name of a GitHub repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSlug {
    pub owner: String,
    pub name: String,
}

impl RepoSlug {
    /// Parse `https://github.com/<owner>/<name>[.git][/...]`
    pub fn parse(repo_url: &str) -> Result<Self, HostError> {
        let unsupported = || HostError::UnsupportedUrl(repo_url.to_string());

        let url = Url::parse(repo_url).map_err(|_| unsupported())?;
        let host = url.host_str().ok_or_else(unsupported)?;
        if host != "github.com" && host != "www.github.com" {
            return Err(unsupported());
        }

        let mut segments = url.path_segments().ok_or_else(unsupported)?;
        let owner = segments.next().filter(|s| !s.is_empty()).ok_or_else(unsupported)?;
        let name = segments
            .next()
            .map(|s| s.trim_end_matches(".git"))
            .filter(|s| !s.is_empty())
            .ok_or_else(unsupported)?;

        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ContentEntry {
    name: String,
}

/// GitHub REST API client (unauthenticated)
pub struct GitHubHost {
    client: reqwest::Client,
    api_url: String,
    raw_url: String,
}

impl GitHubHost {
    pub fn new(api_url: &str, raw_url: &str, timeout: Duration) -> Result<Self, HostError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("noskill-deploy/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            raw_url: raw_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get(&self, url: String) -> Result<reqwest::Response, HostError> {
        debug!("GET {}", url);
        let response = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(HostError::Status {
                status: response.status().as_u16(),
                url,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl RepositoryHost for GitHubHost {
    async fn list_top_level(&self, repo_url: &str) -> Result<Vec<String>, HostError> {
        let slug = RepoSlug::parse(repo_url)?;
        let url = format!("{}/repos/{}/{}/contents", self.api_url, slug.owner, slug.name);

        let entries: Vec<ContentEntry> = self.get(url).await?.json().await?;
        Ok(entries.into_iter().map(|e| e.name).collect())
    }

    async fn fetch_file(&self, repo_url: &str, path: &str) -> Result<String, HostError> {
        let slug = RepoSlug::parse(repo_url)?;
        let url = format!("{}/{}/{}/HEAD/{}", self.raw_url, slug.owner, slug.name, path);

        Ok(self.get(url).await?.text().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_parse_slug() {
        let slug = RepoSlug::parse("https://github.com/acme/site.git").unwrap();
        assert_eq!(slug.owner, "acme");
        assert_eq!(slug.name, "site");

        let slug = RepoSlug::parse("https://github.com/acme/site/tree/main").unwrap();
        assert_eq!(slug.name, "site");

        assert!(RepoSlug::parse("https://gitlab.com/acme/site").is_err());
        assert!(RepoSlug::parse("https://github.com/acme").is_err());
        assert!(RepoSlug::parse("not a url").is_err());
    }

    #[tokio::test]
    async fn test_list_and_fetch() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/repos/acme/site/contents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"name": "package.json", "type": "file"},
                {"name": "src", "type": "dir"}
            ])))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/acme/site/HEAD/package.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"dependencies":{"next":"14"}}"#))
            .mount(&server)
            .await;

        let host = GitHubHost::new(&server.uri(), &server.uri(), Duration::from_secs(5)).unwrap();

        let files = host.list_top_level("https://github.com/acme/site").await.unwrap();
        assert_eq!(files, vec!["package.json", "src"]);

        let manifest = host
            .fetch_file("https://github.com/acme/site", "package.json")
            .await
            .unwrap();
        assert!(manifest.contains("next"));
    }

    #[tokio::test]
    async fn test_missing_repository_is_an_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/repos/acme/gone/contents"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let host = GitHubHost::new(&server.uri(), &server.uri(), Duration::from_secs(5)).unwrap();
        let err = host.list_top_level("https://github.com/acme/gone").await.unwrap_err();
        assert!(matches!(err, HostError::Status { status: 404, .. }));
    }
}
