//! Issue tracker access scoped to one organization.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::io::config::TrackerConfig;
use crate::io::http::Fetch;

/// An issue or pull request as seen at fetch time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub open: bool,
    pub body: String,
}

pub trait IssueTracker {
    fn issue(&self, repo: &str, number: u64) -> Result<Issue>;

    /// Bodies of every comment on the issue, oldest first.
    fn comments(&self, repo: &str, number: u64) -> Result<Vec<String>>;

    /// Download the change request as a mailbox patch into `dest`.
    fn patch(&self, repo: &str, number: u64, dest: &Path) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct IssueDoc {
    state: String,
    #[serde(default)]
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommentDoc {
    #[serde(default)]
    body: Option<String>,
}

/// GitHub-style tracker: REST issues API plus `.patch` links on the web host.
#[derive(Debug)]
pub struct GithubTracker<F> {
    fetch: F,
    api_url: String,
    web_url: String,
    organization: String,
}

impl<F: Fetch> GithubTracker<F> {
    pub fn new(fetch: F, config: &TrackerConfig) -> Self {
        Self {
            fetch,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            web_url: config.web_url.trim_end_matches('/').to_string(),
            organization: config.organization.clone(),
        }
    }

    fn issue_url(&self, repo: &str, number: u64) -> String {
        format!(
            "{}/repos/{}/{repo}/issues/{number}",
            self.api_url, self.organization
        )
    }
}

impl<F: Fetch> IssueTracker for GithubTracker<F> {
    #[instrument(skip(self))]
    fn issue(&self, repo: &str, number: u64) -> Result<Issue> {
        let text = self.fetch.get_text(&self.issue_url(repo, number))?;
        let doc: IssueDoc = serde_json::from_str(&text)
            .with_context(|| format!("parse issue {repo}#{number}"))?;
        debug!(state = %doc.state, "fetched issue");
        Ok(Issue {
            open: doc.state == "open",
            body: doc.body.unwrap_or_default(),
        })
    }

    #[instrument(skip(self))]
    fn comments(&self, repo: &str, number: u64) -> Result<Vec<String>> {
        let url = format!("{}/comments", self.issue_url(repo, number));
        let text = self.fetch.get_text(&url)?;
        let docs: Vec<CommentDoc> = serde_json::from_str(&text)
            .with_context(|| format!("parse comments of {repo}#{number}"))?;
        Ok(docs
            .into_iter()
            .map(|doc| doc.body.unwrap_or_default())
            .collect())
    }

    #[instrument(skip(self, dest))]
    fn patch(&self, repo: &str, number: u64, dest: &Path) -> Result<()> {
        let url = format!(
            "{}/{}/{repo}/pull/{number}.patch",
            self.web_url, self.organization
        );
        self.fetch.download(&url, dest)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::StaticFetcher;

    fn tracker(fetcher: StaticFetcher) -> GithubTracker<StaticFetcher> {
        GithubTracker::new(fetcher, &TrackerConfig::default())
    }

    #[test]
    fn reads_issue_state_and_body() {
        let fetcher = StaticFetcher::new().with(
            "https://api.github.com/repos/autotest/tp-libvirt/issues/5",
            r#"{"state":"open","body":"needs autotest/virt-test#7","title":"x"}"#,
        );
        let issue = tracker(fetcher).issue("tp-libvirt", 5).expect("issue");
        assert!(issue.open);
        assert_eq!(issue.body, "needs autotest/virt-test#7");
    }

    #[test]
    fn null_body_reads_as_empty() {
        let fetcher = StaticFetcher::new().with(
            "https://api.github.com/repos/autotest/virt-test/issues/7",
            r#"{"state":"closed","body":null}"#,
        );
        let issue = tracker(fetcher).issue("virt-test", 7).expect("issue");
        assert!(!issue.open);
        assert_eq!(issue.body, "");
    }

    #[test]
    fn lists_comment_bodies() {
        let fetcher = StaticFetcher::new().with(
            "https://api.github.com/repos/autotest/tp-libvirt/issues/5/comments",
            r#"[{"body":"first"},{"body":"second","user":{}}]"#,
        );
        let comments = tracker(fetcher).comments("tp-libvirt", 5).expect("comments");
        assert_eq!(comments, vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn downloads_patch_from_web_host() {
        let fetcher = StaticFetcher::new().with(
            "https://github.com/autotest/virt-test/pull/7.patch",
            "From abc\n",
        );
        let temp = tempfile::tempdir().expect("tempdir");
        let dest = temp.path().join("7.patch");
        tracker(fetcher).patch("virt-test", 7, &dest).expect("patch");
        assert_eq!(std::fs::read_to_string(dest).expect("read"), "From abc\n");
    }

    #[test]
    fn missing_document_is_an_error() {
        assert!(tracker(StaticFetcher::new()).issue("virt-test", 1).is_err());
    }
}
