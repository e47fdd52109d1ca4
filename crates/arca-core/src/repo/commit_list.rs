use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::warn;

use arca_types::BlobKey;

use super::Repo;
use crate::error::Result;
use crate::snapshot::Commit;

/// The commits reachable from a head through parent links, newest first.
pub struct CommitList {
    commits: Vec<(BlobKey, Commit)>,
    had_missing_blobs: bool,
}

impl CommitList {
    /// Walk the parent chain starting at `head`.
    ///
    /// A parent that is no longer stored ends the walk and sets
    /// `had_missing_blobs`; the commits read so far are kept.
    pub fn load(repo: &Repo, head: Option<&BlobKey>) -> Result<Self> {
        let mut commits = Vec::new();
        let mut had_missing_blobs = false;
        let mut seen = HashSet::new();
        let mut next = head.cloned();
        while let Some(blob_key) = next.take() {
            if !seen.insert(*blob_key.sha1()) {
                warn!("commit chain loops back to {blob_key}");
                break;
            }
            match repo.commit_for_blob_key(&blob_key) {
                Ok(commit) => {
                    next = commit.parent_commit_blob_key.clone();
                    commits.push((blob_key, commit));
                }
                Err(e) if e.is_not_found() => {
                    warn!("commit {blob_key} is missing, history ends here");
                    had_missing_blobs = true;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Self {
            commits,
            had_missing_blobs,
        })
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    pub fn had_missing_blobs(&self) -> bool {
        self.had_missing_blobs
    }

    pub fn pairs(&self) -> &[(BlobKey, Commit)] {
        &self.commits
    }

    pub fn commit_blob_keys(&self) -> impl Iterator<Item = &BlobKey> {
        self.commits.iter().map(|(key, _)| key)
    }

    pub fn newest_blob_key(&self) -> Option<&BlobKey> {
        self.commits.first().map(|(key, _)| key)
    }

    pub fn oldest_commit_date(&self) -> Option<DateTime<Utc>> {
        self.commits.last().map(|(_, commit)| commit.creation_date)
    }

    /// Keys of commits created in `[from, to]`, newest first.
    pub fn reverse_chrono_commit_blob_keys_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<&BlobKey> {
        self.commits
            .iter()
            .filter(|(_, commit)| commit.creation_date >= from && commit.creation_date <= to)
            .map(|(key, _)| key)
            .collect()
    }

    pub fn newest_commit_blob_key_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Option<&BlobKey> {
        self.reverse_chrono_commit_blob_keys_between(from, to)
            .into_iter()
            .next()
    }

    /// Forget `blob_key` and every commit older than it. Returns false if
    /// the list does not contain it.
    pub fn drop_commit_blob_key_and_all_older(&mut self, blob_key: &BlobKey) -> bool {
        match self
            .commits
            .iter()
            .position(|(key, _)| key.same_identity(blob_key))
        {
            Some(index) => {
                self.commits.truncate(index);
                true
            }
            None => false,
        }
    }
}
