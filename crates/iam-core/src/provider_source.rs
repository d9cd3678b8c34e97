//! Provider source strings
//!
//! Providers are distributed as GitHub releases. A source is written as
//! `github:OWNER/REPO` or `github:OWNER/REPO//subdir`.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GithubProviderSource {
    pub owner: String,
    pub repo: String,
    pub subdir: Option<String>,
}

impl GithubProviderSource {
    pub fn parse(input: &str) -> Result<Self> {
        let rest = input
            .strip_prefix("github:")
            .ok_or_else(|| Error::config(format!("Unsupported provider source: {input}")))?;

        let (repo_part, subdir) = match rest.split_once("//") {
            Some((repo_part, subdir)) if !subdir.trim().is_empty() => {
                (repo_part, Some(subdir.trim().trim_matches('/').to_string()))
            }
            Some((repo_part, _)) => (repo_part, None),
            None => (rest, None),
        };

        let (owner, repo) = repo_part
            .split_once('/')
            .ok_or_else(|| Error::config(format!("Invalid github provider source: {input}")))?;

        let owner = owner.trim();
        let repo = repo.trim();
        if owner.is_empty() || repo.is_empty() {
            return Err(Error::config(format!(
                "Invalid github provider source (empty owner or repo): {input}"
            )));
        }

        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            subdir,
        })
    }

    pub fn github_repo_slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

impl FromStr for GithubProviderSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for GithubProviderSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subdir {
            Some(subdir) => write!(f, "github:{}/{}//{}", self.owner, self.repo, subdir),
            None => write!(f, "github:{}/{}", self.owner, self.repo),
        }
    }
}

/// Release tag for a provider version: `<provider>-v<version>`
pub fn derive_github_release_tag(provider: &str, version: &str) -> Result<String> {
    let provider = provider.trim();
    let version = version.trim();

    if provider.is_empty() {
        return Err(Error::config("Provider name cannot be empty"));
    }
    if version.is_empty() {
        return Err(Error::config("Provider version cannot be empty"));
    }

    // Only the leading 'v' is normalized; SemVer is not checked.
    let version = version.strip_prefix('v').unwrap_or(version);
    Ok(format!("{provider}-v{version}"))
}
