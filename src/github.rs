//! GitHub REST client for the comment store and PR file listing.
//!
//! One client value is constructed per process invocation and passed down;
//! nothing here is cached globally. The bot never deletes comments, it
//! only creates them and rewrites their bodies.

use crate::error::BotError;
use reqwest::header::AUTHORIZATION;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::env;

const API_ROOT: &str = "https://api.github.com";
const PER_PAGE: usize = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub login: String,
}

/// A PR review comment as consumed by the bot. Review comments form a
/// reply tree through `in_reply_to_id`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReviewComment {
    pub id: u64,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub in_reply_to_id: Option<u64>,
    #[serde(default)]
    pub user: Option<User>,
}

impl ReviewComment {
    pub fn author(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.login.as_str())
    }

    #[cfg(test)]
    pub fn for_tests(id: u64, body: &str, login: Option<&str>) -> ReviewComment {
        ReviewComment {
            id,
            body: body.to_string(),
            in_reply_to_id: None,
            user: login.map(|l| User {
                login: l.to_string(),
            }),
        }
    }

    #[cfg(test)]
    pub fn reply_for_tests(id: u64, body: &str, in_reply_to: u64) -> ReviewComment {
        ReviewComment {
            in_reply_to_id: Some(in_reply_to),
            ..ReviewComment::for_tests(id, body, Some("alice"))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PrFile {
    pub filename: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Deserialize)]
struct PrInfo {
    head: PrHead,
}

#[derive(Debug, Deserialize)]
struct PrHead {
    sha: String,
}

pub struct GithubClient {
    http: reqwest::Client,
    owner: String,
    repo: String,
    token: Option<String>,
    base_url: String,
}

impl GithubClient {
    /// The token comes from GITHUB_TOKEN; reads of public repos work
    /// without one, every write requires one.
    pub fn new(owner: &str, repo: &str) -> GithubClient {
        GithubClient {
            http: reqwest::Client::new(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            token: env::var("GITHUB_TOKEN").ok(),
            base_url: API_ROOT.to_string(),
        }
    }

    #[cfg(test)]
    fn with_base_url(owner: &str, repo: &str, base_url: &str) -> GithubClient {
        GithubClient {
            http: reqwest::Client::new(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            token: None,
            base_url: base_url.to_string(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/repos/{}/{}/{}", self.base_url, self.owner, self.repo, path);
        let request = self
            .http
            .request(method, url)
            .header("User-Agent", "patchbot")
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        match &self.token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, BotError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let body = if status == StatusCode::NOT_FOUND || status == StatusCode::UNAUTHORIZED {
            format!(
                "{} (if this is a private repo, GITHUB_TOKEN must be set)",
                body
            )
        } else {
            body
        };
        Err(BotError::Api { status, body })
    }

    /// Changed files of a PR, following pagination (the API serves 30 per
    /// page by default; a large PR would otherwise be silently cut short).
    pub async fn pr_files(&self, pr_number: u64) -> Result<Vec<PrFile>, BotError> {
        let mut files: Vec<PrFile> = Vec::new();
        let mut page = 1usize;
        loop {
            let response = self
                .request(Method::GET, &format!("pulls/{}/files", pr_number))
                .query(&[("per_page", PER_PAGE.to_string()), ("page", page.to_string())])
                .send()
                .await?;
            let batch: Vec<PrFile> = Self::check(response).await?.json().await?;
            let batch_len = batch.len();
            files.extend(batch);
            if batch_len < PER_PAGE {
                break;
            }
            page += 1;
        }
        Ok(files)
    }

    /// SHA of the PR's head commit, needed to anchor new review comments.
    pub async fn pr_head_sha(&self, pr_number: u64) -> Result<String, BotError> {
        let response = self
            .request(Method::GET, &format!("pulls/{}", pr_number))
            .send()
            .await?;
        let info: PrInfo = Self::check(response).await?.json().await?;
        Ok(info.head.sha)
    }

    /// One review comment, fetched fresh. The state gate relies on this
    /// never being served from a cache.
    pub async fn get_review_comment(&self, comment_id: u64) -> Result<ReviewComment, BotError> {
        let response = self
            .request(Method::GET, &format!("pulls/comments/{}", comment_id))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// All review comments on a PR, following pagination.
    pub async fn list_review_comments(
        &self,
        pr_number: u64,
    ) -> Result<Vec<ReviewComment>, BotError> {
        let mut comments: Vec<ReviewComment> = Vec::new();
        let mut page = 1usize;
        loop {
            let response = self
                .request(Method::GET, &format!("pulls/{}/comments", pr_number))
                .query(&[("per_page", PER_PAGE.to_string()), ("page", page.to_string())])
                .send()
                .await?;
            let batch: Vec<ReviewComment> = Self::check(response).await?.json().await?;
            let batch_len = batch.len();
            comments.extend(batch);
            if batch_len < PER_PAGE {
                break;
            }
            page += 1;
        }
        Ok(comments)
    }

    /// Create an inline review comment on the PR's head commit.
    pub async fn create_review_comment(
        &self,
        pr_number: u64,
        body: &str,
        commit_id: &str,
        path: &str,
        line: u32,
    ) -> Result<ReviewComment, BotError> {
        let payload = json!({
            "body": body,
            "commit_id": commit_id,
            "path": path,
            "line": line,
            "side": "RIGHT",
        });
        let response = self
            .request(Method::POST, &format!("pulls/{}/comments", pr_number))
            .json(&payload)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Rewrite a review comment's body in place.
    pub async fn update_review_comment(
        &self,
        comment_id: u64,
        body: &str,
    ) -> Result<(), BotError> {
        let response = self
            .request(Method::PATCH, &format!("pulls/comments/{}", comment_id))
            .json(&json!({ "body": body }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}
