//! Git collaborator for git-origin dependencies.
//!
//! Only three operations are needed: list a remote's refs, pick the commit a
//! committish (or `semver:` range) names, and check that commit out.

use super::error::PkgError;
use super::version::Range;
use futures::future::BoxFuture;
use futures::FutureExt;
use semver::Version;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// One advertised ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitRef {
    pub name: String,
    pub sha: String,
}

/// Access to git remotes.
pub trait GitClient: Send + Sync {
    /// List a remote's refs (`git ls-remote`).
    fn ls_remote<'a>(&'a self, remote: &'a str) -> BoxFuture<'a, Result<Vec<GitRef>, PkgError>>;

    /// Check out `sha` of `remote` into `dest`, which must not exist yet.
    fn clone_at<'a>(
        &'a self,
        remote: &'a str,
        sha: &'a str,
        dest: &'a Path,
    ) -> BoxFuture<'a, Result<(), PkgError>>;

    /// Resolve a committish or tag range to a full commit sha.
    fn resolve_ref<'a>(
        &'a self,
        remote: &'a str,
        committish: Option<&'a str>,
        semver: Option<&'a str>,
    ) -> BoxFuture<'a, Result<String, PkgError>> {
        async move {
            if let Some(sha) = committish.filter(|c| is_full_sha(c)) {
                return Ok(sha.to_string());
            }
            let refs = self.ls_remote(remote).await?;
            select_ref(&refs, committish, semver).ok_or_else(|| {
                PkgError::Git(format!(
                    "{remote}: no ref matches '{}'",
                    semver.or(committish).unwrap_or("HEAD")
                ))
            })
        }
        .boxed()
    }
}

/// Whether `s` is a full 40-character hex commit id.
#[must_use]
pub fn is_full_sha(s: &str) -> bool {
    s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Parse `git ls-remote` output (`<sha>\t<ref>` per line). Peeled tag entries
/// (`refs/tags/v1^{}`) replace the tag object with the commit it points at.
#[must_use]
pub fn parse_ls_remote(output: &str) -> Vec<GitRef> {
    let mut refs: Vec<GitRef> = Vec::new();
    for line in output.lines() {
        let Some((sha, name)) = line.split_once('\t') else {
            continue;
        };
        let (sha, name) = (sha.trim(), name.trim());
        if let Some(tag) = name.strip_suffix("^{}") {
            if let Some(existing) = refs.iter_mut().find(|r| r.name == tag) {
                existing.sha = sha.to_string();
                continue;
            }
            refs.push(GitRef {
                name: tag.to_string(),
                sha: sha.to_string(),
            });
            continue;
        }
        refs.push(GitRef {
            name: name.to_string(),
            sha: sha.to_string(),
        });
    }
    refs
}

/// Pick the sha for a committish or `semver:` range.
///
/// A range selects the highest tag (with or without a `v` prefix) it
/// satisfies. A committish matches `HEAD`, a tag, a branch, a full ref name
/// or a sha prefix, in that order. No committish means `HEAD`.
#[must_use]
pub fn select_ref(refs: &[GitRef], committish: Option<&str>, semver: Option<&str>) -> Option<String> {
    if let Some(range) = semver {
        let range = Range::parse(range).ok()?;
        return refs
            .iter()
            .filter_map(|r| {
                let tag = r.name.strip_prefix("refs/tags/")?;
                let version = Version::parse(tag.trim_start_matches('v')).ok()?;
                range.satisfies(&version).then_some((version, &r.sha))
            })
            .max_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, sha)| sha.clone());
    }

    let wanted = committish.unwrap_or("HEAD");
    let candidates = [
        wanted.to_string(),
        format!("refs/tags/{wanted}"),
        format!("refs/heads/{wanted}"),
    ];
    for candidate in &candidates {
        if let Some(found) = refs.iter().find(|r| &r.name == candidate) {
            return Some(found.sha.clone());
        }
    }

    if wanted.len() >= 7 && wanted.bytes().all(|b| b.is_ascii_hexdigit()) {
        return refs
            .iter()
            .find(|r| r.sha.starts_with(wanted))
            .map(|r| r.sha.clone());
    }
    None
}

/// [`GitClient`] backed by the `git` executable.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            program: PathBuf::from("git"),
        }
    }
}

impl GitCli {
    /// Use a specific `git` binary.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str], cwd: Option<&Path>) -> Result<String, PkgError> {
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        debug!(args = ?args, "spawning git");
        let output = command
            .output()
            .await
            .map_err(|e| PkgError::Git(format!("failed to spawn {}: {e}", self.program.display())))?;

        if !output.status.success() {
            return Err(PkgError::Git(format!(
                "git {} exited with {}: {}",
                args.first().unwrap_or(&""),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl GitClient for GitCli {
    fn ls_remote<'a>(&'a self, remote: &'a str) -> BoxFuture<'a, Result<Vec<GitRef>, PkgError>> {
        async move {
            let out = self.run(&["ls-remote", remote], None).await?;
            Ok(parse_ls_remote(&out))
        }
        .boxed()
    }

    fn clone_at<'a>(
        &'a self,
        remote: &'a str,
        sha: &'a str,
        dest: &'a Path,
    ) -> BoxFuture<'a, Result<(), PkgError>> {
        async move {
            let dest_str = dest.to_string_lossy();
            self.run(&["clone", "--quiet", "--no-checkout", remote, &dest_str], None)
                .await?;
            self.run(&["checkout", "--quiet", sha], Some(dest)).await?;
            Ok(())
        }
        .boxed()
    }
}
