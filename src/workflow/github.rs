//! GitHub implementation of `HostingService` over the REST git data API.
//!
//! Pushing never touches a local clone: the commit is assembled remotely as
//! default-branch head → new tree → new commit → new ref.

use async_trait::async_trait;
use autoship_common::RepoRef;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::hosting::HostingService;
use super::patch::{AppliedChangeSet, ChangeKind};
use crate::config::HostingConfig;
use crate::errors::HostingError;
use crate::util::truncate;

const PER_PAGE: usize = 100;
const FILE_MODE: &str = "100644";
const EXECUTABLE_MODE: &str = "100755";

/// Known GitHub token prefixes.
/// See: https://github.blog/2021-04-05-behind-githubs-new-authentication-token-formats/
const GITHUB_TOKEN_PREFIXES: &[&str] = &[
    "ghp_",        // Personal access tokens (classic)
    "github_pat_", // Fine-grained personal access tokens
    "gho_",        // OAuth access tokens
    "ghu_",        // GitHub App user-to-server tokens
    "ghs_",        // GitHub App server-to-server tokens
    "ghr_",        // GitHub App refresh tokens
];

/// Validate that a string looks like a GitHub token based on its prefix.
///
/// Format check only; it does not verify the token is active or scoped.
pub fn is_valid_github_token(token: &str) -> bool {
    if token.is_empty() {
        return false;
    }
    GITHUB_TOKEN_PREFIXES
        .iter()
        .any(|prefix| token.starts_with(prefix))
}

fn warn_on_token_format(credential: &SecretString) {
    if !is_valid_github_token(credential.expose_secret()) {
        tracing::warn!("hosting credential does not look like a GitHub token; continuing anyway");
    }
}

/// A GitHub repository (subset of fields we care about).
#[derive(Debug, Serialize, Deserialize)]
pub struct GitHubRepo {
    pub full_name: String,
    pub name: String,
    pub owner: GitHubOwner,
    pub private: bool,
    #[serde(default)]
    pub fork: bool,
    pub clone_url: String,
    pub description: Option<String>,
    pub language: Option<String>,
    pub default_branch: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GitHubOwner {
    pub login: String,
}

impl From<GitHubRepo> for RepoRef {
    fn from(repo: GitHubRepo) -> Self {
        let mut r = RepoRef::new(repo.owner.login, repo.name).with_default_branch(repo.default_branch);
        r.clone_url = repo.clone_url;
        r.description = repo.description;
        r.language = repo.language;
        r
    }
}

#[derive(Deserialize)]
struct GitRef {
    object: GitObject,
}

#[derive(Deserialize)]
struct GitObject {
    sha: String,
}

#[derive(Deserialize)]
struct GitCommit {
    sha: String,
    tree: GitObject,
}

#[derive(Deserialize)]
struct Created {
    sha: String,
}

#[derive(Serialize)]
struct TreeEntry<'a> {
    path: &'a str,
    mode: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    /// `null` deletes the path; absent when `content` is given.
    #[serde(skip_serializing_if = "is_false_flag")]
    sha: DeleteMarker,
}

/// Serialises as JSON `null` when set, otherwise omitted.
#[derive(Clone, Copy)]
struct DeleteMarker(bool);

impl Serialize for DeleteMarker {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_none()
    }
}

fn is_false_flag(marker: &DeleteMarker) -> bool {
    !marker.0
}

#[derive(Serialize)]
struct Signature<'a> {
    name: &'a str,
    email: &'a str,
}

#[derive(Deserialize)]
struct ApiMessage {
    message: String,
}

/// Parse `Name <email>` into its parts.
fn parse_author(author: &str) -> Option<(&str, &str)> {
    let (name, rest) = author.split_once('<')?;
    let email = rest.strip_suffix('>')?.trim();
    let name = name.trim();
    (!name.is_empty() && !email.is_empty()).then_some((name, email))
}

fn map_status(status: StatusCode, body: &str) -> HostingError {
    let message = serde_json::from_str::<ApiMessage>(body)
        .map(|m| m.message)
        .unwrap_or_else(|_| truncate(body, 300).to_string());
    match status.as_u16() {
        401 | 403 => HostingError::Auth(message),
        409 => HostingError::Conflict(message),
        422 if message.to_ascii_lowercase().contains("already exists") => HostingError::Conflict(message),
        500..=599 => HostingError::Network(format!("HTTP {}: {}", status.as_u16(), message)),
        code => HostingError::Api {
            status: code,
            message,
        },
    }
}

pub struct GitHubHosting {
    client: Client,
    api_base: String,
    user_agent: String,
    author: Option<String>,
}

impl GitHubHosting {
    pub fn new(config: &HostingConfig) -> Self {
        Self {
            client: Client::new(),
            api_base: config.api_base_url.trim_end_matches('/').to_string(),
            user_agent: config.user_agent.clone(),
            author: config.commit_author.clone(),
        }
    }

    fn request(&self, builder: RequestBuilder, credential: &SecretString) -> RequestBuilder {
        builder
            .bearer_auth(credential.expose_secret())
            .header("User-Agent", &self.user_agent)
            .header("Accept", "application/vnd.github+json")
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder, what: &str) -> Result<T, HostingError> {
        let response: Response = builder
            .send()
            .await
            .map_err(|e| HostingError::Network(format!("{}: {}", what, e.without_url())))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| HostingError::Malformed(format!("{}: {}", what, e)))
    }

    fn repo_url(&self, repo: &RepoRef, tail: &str) -> String {
        format!("{}/repos/{}/{}/{}", self.api_base, repo.owner, repo.name, tail)
    }
}

#[async_trait]
impl HostingService for GitHubHosting {
    async fn list_repositories(&self, credential: &SecretString) -> Result<Vec<RepoRef>, HostingError> {
        warn_on_token_format(credential);
        let url = format!("{}/user/repos", self.api_base);
        let mut repos = Vec::new();
        let mut page = 1u32;
        loop {
            let builder = self.client.get(&url).query(&[
                ("sort", "updated".to_string()),
                ("per_page", PER_PAGE.to_string()),
                ("page", page.to_string()),
            ]);
            let batch: Vec<GitHubRepo> = self
                .send(self.request(builder, credential), "list repositories")
                .await?;
            let count = batch.len();
            repos.extend(batch.into_iter().filter(|r| !r.fork).map(RepoRef::from));
            if count < PER_PAGE {
                break;
            }
            page += 1;
        }
        tracing::debug!(count = repos.len(), "listed repositories");
        Ok(repos)
    }

    async fn push(
        &self,
        credential: &SecretString,
        repo: &RepoRef,
        branch: &str,
        changes: &AppliedChangeSet,
        message: &str,
    ) -> Result<String, HostingError> {
        warn_on_token_format(credential);

        let head: GitRef = self
            .send(
                self.request(
                    self.client
                        .get(self.repo_url(repo, &format!("git/ref/heads/{}", repo.default_branch))),
                    credential,
                ),
                "resolve default branch",
            )
            .await?;
        let base: GitCommit = self
            .send(
                self.request(
                    self.client
                        .get(self.repo_url(repo, &format!("git/commits/{}", head.object.sha))),
                    credential,
                ),
                "read base commit",
            )
            .await?;

        let entries: Vec<TreeEntry<'_>> = changes
            .changes
            .iter()
            .map(|change| TreeEntry {
                path: &change.path,
                mode: if change.executable { EXECUTABLE_MODE } else { FILE_MODE },
                kind: "blob",
                content: change.content.as_deref(),
                sha: DeleteMarker(change.kind == ChangeKind::Deleted),
            })
            .collect();
        let tree: Created = self
            .send(
                self.request(self.client.post(self.repo_url(repo, "git/trees")), credential).json(
                    &serde_json::json!({ "base_tree": base.tree.sha, "tree": entries }),
                ),
                "create tree",
            )
            .await?;

        let mut commit = serde_json::json!({
            "message": message,
            "tree": tree.sha,
            "parents": [base.sha],
        });
        if let Some((name, email)) = self.author.as_deref().and_then(parse_author) {
            commit["author"] = serde_json::to_value(Signature { name, email })
                .map_err(|e| HostingError::Malformed(e.to_string()))?;
        }
        let created: Created = self
            .send(
                self.request(self.client.post(self.repo_url(repo, "git/commits")), credential)
                    .json(&commit),
                "create commit",
            )
            .await?;

        let _: serde_json::Value = self
            .send(
                self.request(self.client.post(self.repo_url(repo, "git/refs")), credential).json(
                    &serde_json::json!({ "ref": format!("refs/heads/{}", branch), "sha": created.sha }),
                ),
                "create branch",
            )
            .await?;

        tracing::info!(repo = %repo.full_name(), branch = %branch, commit = %created.sha, "branch pushed");
        Ok(created.sha)
    }
}
