//! Code-hosting collaborator: the `CodeHost` capability and its GitHub REST adapter.

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

const USER_AGENT: &str = concat!("relay/", env!("CARGO_PKG_VERSION"));
const PER_PAGE: u32 = 100;

static LINKED_ISSUE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:close[sd]?|fix(?:e[sd])?|resolve[sd]?)\s*:?\s*#(\d+)").ok());

// ── Host data ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommentData {
    pub author: String,
    pub body: String,
    /// RFC 3339 as reported by the host.
    pub created_at: String,
    /// File path for pull request review comments.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IssueData {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub comments: Vec<CommentData>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PullRequestData {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub head_branch: String,
    pub base_branch: String,
    /// Conversation and review comments merged.
    pub comments: Vec<CommentData>,
}

/// Everything the context bundle needs from the code host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostContext {
    pub issue: IssueData,
    pub pull_request: Option<PullRequestData>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PullRequestRef {
    pub number: u64,
    pub url: String,
}

/// Where a status comment lives. `comment_id` is set once it has been posted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentTarget {
    pub repo: String,
    pub number: u64,
    pub comment_id: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    Eyes,
    Rocket,
    Confused,
}

impl Reaction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eyes => "eyes",
            Self::Rocket => "rocket",
            Self::Confused => "confused",
        }
    }
}

/// Parse `closes #N` style references from a pull request body.
pub fn linked_issue(body: &str) -> Option<u64> {
    LINKED_ISSUE
        .as_ref()?
        .captures(body)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

// ── Capability ────────────────────────────────────────────────────────

#[async_trait]
pub trait CodeHost: Send + Sync {
    /// Issue, comments and (when `pr` is set) the pull request. For a pull
    /// request scope the issue section is the linked issue when the body
    /// names one, otherwise `issue`.
    async fn fetch_context(&self, repo: &str, issue: u64, pr: Option<u64>) -> Result<HostContext>;

    /// Return the open PR for `branch`, creating one if none exists.
    async fn create_or_update_pr(
        &self,
        repo: &str,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequestRef>;

    /// Post a new comment or edit the existing one. Returns the comment id.
    async fn post_or_update_comment(&self, target: &CommentTarget, body: &str) -> Result<u64>;

    async fn add_reaction(&self, repo: &str, comment_id: u64, reaction: Reaction) -> Result<()>;
}

// ── GitHub REST adapter ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct ApiIssue {
    number: u64,
    title: String,
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiComment {
    id: u64,
    user: Option<ApiUser>,
    body: Option<String>,
    created_at: String,
    #[serde(default)]
    path: Option<String>,
}

impl ApiComment {
    fn into_comment(self) -> CommentData {
        CommentData {
            author: self.user.map(|u| u.login).unwrap_or_else(|| "ghost".to_string()),
            body: self.body.unwrap_or_default(),
            created_at: self.created_at,
            path: self.path,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiBranchRef {
    #[serde(rename = "ref")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct ApiPullRequest {
    number: u64,
    title: String,
    body: Option<String>,
    html_url: String,
    head: ApiBranchRef,
    base: ApiBranchRef,
}

#[derive(Debug, Deserialize)]
struct ApiRepository {
    default_branch: String,
}

#[derive(Debug, Deserialize)]
struct ApiCreated {
    id: u64,
}

/// GitHub REST v3 client authenticated with a token.
#[derive(Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_url: String,
    token: String,
}

impl GitHubClient {
    pub fn new(
        api_url: &str,
        token: &str,
        timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, self.url(path))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request(reqwest::Method::GET, path)
            .send()
            .await
            .with_context(|| format!("Failed to send request to GitHub: GET {}", path))?
            .error_for_status()
            .with_context(|| format!("GitHub returned error status for GET {}", path))?
            .json::<T>()
            .await
            .with_context(|| format!("Failed to parse GitHub response for GET {}", path))
    }

    /// Follow `page=` until a short page comes back.
    async fn get_paginated<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        let mut all = Vec::new();
        let mut page = 1u32;
        loop {
            let items: Vec<T> = self
                .request(reqwest::Method::GET, path)
                .query(&[("per_page", PER_PAGE), ("page", page)])
                .send()
                .await
                .with_context(|| format!("Failed to send request to GitHub: GET {}", path))?
                .error_for_status()
                .with_context(|| format!("GitHub returned error status for GET {}", path))?
                .json()
                .await
                .with_context(|| format!("Failed to parse GitHub response for GET {}", path))?;
            let len = items.len();
            all.extend(items);
            if len < PER_PAGE as usize {
                return Ok(all);
            }
            page += 1;
        }
    }

    async fn send_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let label = format!("{} {}", method, path);
        self.request(method, path)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to send request to GitHub: {}", label))?
            .error_for_status()
            .with_context(|| format!("GitHub returned error status for {}", label))?
            .json::<T>()
            .await
            .with_context(|| format!("Failed to parse GitHub response for {}", label))
    }

    async fn fetch_issue(&self, repo: &str, number: u64) -> Result<IssueData> {
        let issue: ApiIssue = self
            .get_json(&format!("/repos/{}/issues/{}", repo, number))
            .await?;
        let comments = self.fetch_issue_comments(repo, number).await?;
        Ok(IssueData {
            number: issue.number,
            title: issue.title,
            body: issue.body.unwrap_or_default(),
            comments,
        })
    }

    async fn fetch_issue_comments(&self, repo: &str, number: u64) -> Result<Vec<CommentData>> {
        let comments: Vec<ApiComment> = self
            .get_paginated(&format!("/repos/{}/issues/{}/comments", repo, number))
            .await?;
        Ok(comments.into_iter().map(ApiComment::into_comment).collect())
    }

    async fn fetch_pull_request(&self, repo: &str, number: u64) -> Result<PullRequestData> {
        let pr: ApiPullRequest = self
            .get_json(&format!("/repos/{}/pulls/{}", repo, number))
            .await?;
        let mut comments = self.fetch_issue_comments(repo, number).await?;
        let review: Vec<ApiComment> = self
            .get_paginated(&format!("/repos/{}/pulls/{}/comments", repo, number))
            .await?;
        comments.extend(review.into_iter().map(ApiComment::into_comment));
        Ok(PullRequestData {
            number: pr.number,
            title: pr.title,
            body: pr.body.unwrap_or_default(),
            head_branch: pr.head.name,
            base_branch: pr.base.name,
            comments,
        })
    }

    async fn find_open_pr(&self, repo: &str, branch: &str) -> Result<Option<PullRequestRef>> {
        let owner = repo.split('/').next().unwrap_or(repo);
        let head = format!("{}:{}", owner, branch);
        let path = format!("/repos/{}/pulls", repo);
        let prs: Vec<ApiPullRequest> = self
            .request(reqwest::Method::GET, &path)
            .query(&[("head", head.as_str()), ("state", "open")])
            .send()
            .await
            .context("Failed to send request to GitHub: list pull requests")?
            .error_for_status()
            .context("GitHub returned error status listing pull requests")?
            .json()
            .await
            .context("Failed to parse pull request list")?;
        Ok(prs.into_iter().next().map(|pr| PullRequestRef {
            number: pr.number,
            url: pr.html_url,
        }))
    }
}

#[async_trait]
impl CodeHost for GitHubClient {
    async fn fetch_context(&self, repo: &str, issue: u64, pr: Option<u64>) -> Result<HostContext> {
        let pull_request = match pr {
            Some(number) => Some(self.fetch_pull_request(repo, number).await?),
            None => None,
        };
        let issue_number = pull_request
            .as_ref()
            .and_then(|pr| linked_issue(&pr.body))
            .unwrap_or(issue);
        let issue = self.fetch_issue(repo, issue_number).await?;
        Ok(HostContext {
            issue,
            pull_request,
        })
    }

    async fn create_or_update_pr(
        &self,
        repo: &str,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequestRef> {
        if let Some(existing) = self.find_open_pr(repo, branch).await? {
            // Refresh the description so it matches the latest run.
            let pr: ApiPullRequest = self
                .send_json(
                    reqwest::Method::PATCH,
                    &format!("/repos/{}/pulls/{}", repo, existing.number),
                    &serde_json::json!({ "title": title, "body": body }),
                )
                .await?;
            return Ok(PullRequestRef {
                number: pr.number,
                url: pr.html_url,
            });
        }
        let repository: ApiRepository = self.get_json(&format!("/repos/{}", repo)).await?;
        let pr: ApiPullRequest = self
            .send_json(
                reqwest::Method::POST,
                &format!("/repos/{}/pulls", repo),
                &serde_json::json!({
                    "title": title,
                    "head": branch,
                    "base": repository.default_branch,
                    "body": body,
                }),
            )
            .await?;
        Ok(PullRequestRef {
            number: pr.number,
            url: pr.html_url,
        })
    }

    async fn post_or_update_comment(&self, target: &CommentTarget, body: &str) -> Result<u64> {
        let payload = serde_json::json!({ "body": body });
        let created: ApiCreated = match target.comment_id {
            Some(id) => {
                self.send_json(
                    reqwest::Method::PATCH,
                    &format!("/repos/{}/issues/comments/{}", target.repo, id),
                    &payload,
                )
                .await?
            }
            None => {
                self.send_json(
                    reqwest::Method::POST,
                    &format!("/repos/{}/issues/{}/comments", target.repo, target.number),
                    &payload,
                )
                .await?
            }
        };
        Ok(created.id)
    }

    async fn add_reaction(&self, repo: &str, comment_id: u64, reaction: Reaction) -> Result<()> {
        let _: serde_json::Value = self
            .send_json(
                reqwest::Method::POST,
                &format!("/repos/{}/issues/comments/{}/reactions", repo, comment_id),
                &serde_json::json!({ "content": reaction.as_str() }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::extract::{Path, State};
    use axum::routing::{get, patch};
    use axum::{Json, Router};

    fn test_client(api_url: &str) -> GitHubClient {
        GitHubClient::new(api_url, "t", Duration::from_secs(5), Duration::from_secs(5)).unwrap()
    }

    type Patches = Arc<Mutex<Vec<(u64, serde_json::Value)>>>;

    /// Serve a repository with one open PR on `relay/issue-42-oneshot`.
    async fn serve_open_pr() -> (String, Patches) {
        let patches: Patches = Arc::default();
        let app = Router::new()
            .route(
                "/repos/{owner}/{repo}/pulls",
                get(|| async {
                    Json(serde_json::json!([{
                        "number": 7, "title": "old", "body": "old body",
                        "html_url": "https://github.com/acme/widgets/pull/7",
                        "head": {"ref": "relay/issue-42-oneshot"}, "base": {"ref": "main"}
                    }]))
                }),
            )
            .route(
                "/repos/{owner}/{repo}/pulls/{number}",
                patch(
                    |State(patches): State<Patches>,
                     Path((_, _, number)): Path<(String, String, u64)>,
                     Json(body): Json<serde_json::Value>| async move {
                        let reply = serde_json::json!({
                            "number": number, "title": body["title"], "body": body["body"],
                            "html_url": format!("https://github.com/acme/widgets/pull/{}", number),
                            "head": {"ref": "relay/issue-42-oneshot"}, "base": {"ref": "main"}
                        });
                        patches.lock().unwrap().push((number, body));
                        Json(reply)
                    },
                ),
            )
            .with_state(patches.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), patches)
    }

    #[tokio::test]
    async fn test_existing_pr_gets_fresh_title_and_body() {
        let (url, patches) = serve_open_pr().await;
        let client = test_client(&url);

        let pr = client
            .create_or_update_pr("acme/widgets", "relay/issue-42-oneshot", "new title", "new body")
            .await
            .unwrap();

        assert_eq!(pr.number, 7);
        assert_eq!(pr.url, "https://github.com/acme/widgets/pull/7");
        let patches = patches.lock().unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].0, 7);
        assert_eq!(patches[0].1["title"], "new title");
        assert_eq!(patches[0].1["body"], "new body");
    }

    #[test]
    fn test_linked_issue_keywords() {
        assert_eq!(linked_issue("Closes #42"), Some(42));
        assert_eq!(linked_issue("this fixes #7 for good"), Some(7));
        assert_eq!(linked_issue("RESOLVES: #123"), Some(123));
        assert_eq!(linked_issue("Resolved #5"), Some(5));
        assert_eq!(linked_issue("fixed#9"), Some(9));
    }

    #[test]
    fn test_linked_issue_absent() {
        assert_eq!(linked_issue("Related to #42"), None);
        assert_eq!(linked_issue(""), None);
        assert_eq!(linked_issue("prefixes #3"), None);
    }

    #[test]
    fn test_api_comment_conversion() {
        let json = r#"{"id": 1, "user": {"login": "alice"}, "body": "hi", "created_at": "2024-01-02T03:04:05Z"}"#;
        let comment: ApiComment = serde_json::from_str(json).unwrap();
        let data = comment.into_comment();
        assert_eq!(data.author, "alice");
        assert_eq!(data.path, None);

        let json = r#"{"id": 2, "user": null, "body": null, "created_at": "x", "path": "src/lib.rs"}"#;
        let comment: ApiComment = serde_json::from_str(json).unwrap();
        let data = comment.into_comment();
        assert_eq!(data.author, "ghost");
        assert_eq!(data.body, "");
        assert_eq!(data.path.as_deref(), Some("src/lib.rs"));
    }

    #[test]
    fn test_api_pull_request_parses_branch_refs() {
        let json = r#"{
            "number": 124, "title": "t", "body": null,
            "html_url": "https://github.com/acme/widgets/pull/124",
            "head": {"ref": "feature"}, "base": {"ref": "main"}
        }"#;
        let pr: ApiPullRequest = serde_json::from_str(json).unwrap();
        assert_eq!(pr.head.name, "feature");
        assert_eq!(pr.base.name, "main");
    }

    #[test]
    fn test_client_trims_api_url() {
        let client = test_client("https://api.example.com/");
        assert_eq!(client.url("/repos/a/b"), "https://api.example.com/repos/a/b");
    }

    #[test]
    fn test_reaction_names() {
        assert_eq!(Reaction::Eyes.as_str(), "eyes");
        assert_eq!(Reaction::Rocket.as_str(), "rocket");
        assert_eq!(Reaction::Confused.as_str(), "confused");
    }
}
