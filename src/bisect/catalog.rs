use std::collections::BTreeSet;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use semver::Version;

use crate::bisect::config::CatalogConfig;
use crate::bisect::git::History;
use crate::bisect::revision::{Revision, RevisionKind};

#[derive(thiserror::Error,Debug)]
pub enum CatalogError {
    #[error("Cannot find revision '{0}'")]
    NotFound(String),
    #[error("Revision '{0}' is ambiguous ({1} matches)")]
    Ambiguous(String, usize),
    #[error("Invalid version '{0}'")]
    InvalidVersion(String)
}

/// Turn `X.Y` into `X.Y.0` so that two-component release names parse as
/// semantic versions
pub fn normalize_version(name : &str) -> String {
    if name.split('.').count() == 2 {
        format!("{}.0", name)
    } else {
        name.to_owned()
    }
}

/// Parse the version part of a release tag.  Returns `None` for anything that
/// is not a plain release (pre-releases, snapshots, typos in old tags).
pub fn parse_release_version(name : &str) -> Option<Version> {
    if name.contains("prerelease") {
        return None;
    }
    let version = Version::parse(&normalize_version(name)).ok()?;
    if version.pre.is_empty() && version.build.is_empty() {
        Some(version)
    } else {
        None
    }
}

/// The revisions we track, as seen at one point in time
#[derive(Debug,Clone,Default)]
pub struct Catalog {
    pub releases : Vec<Revision>,
    pub branches : Vec<Revision>,
    pub branch_bases : Vec<Revision>,
    /// Latest mainline commits, newest first
    pub latest : Vec<Revision>
}

impl Catalog {
    /// Every tracked revision, in the order builds should happen
    pub fn all(&self) -> impl Iterator<Item = &Revision> {
        self.releases.iter()
            .chain(self.branch_bases.iter())
            .chain(self.branches.iter())
            .chain(self.latest.iter())
    }

    /// Hashes of every revision whose artifact must survive garbage collection
    pub fn keep_set(&self) -> BTreeSet<String> {
        self.all().map(|r| r.hash.clone()).collect()
    }

    /// Resolve a user-provided revision name within `pool`.
    ///
    /// Accepted forms: a branch base label (`12-base`), a release or branch
    /// label, a GCC description (`r13-1234-g0123abcd`) and a hash prefix.
    pub fn find<'a>(&self, name : &str, pool : &'a [Revision]) -> Result<&'a Revision, CatalogError> {
        let mut needle = name.to_owned();
        if name.contains("base") {
            if let Some(b) = self.branch_bases.iter().find(|b| b.label.as_deref() == Some(name)) {
                needle = b.hash.clone();
            }
        } else if let Some(r) = pool.iter().find(|r| r.label.as_deref() == Some(name)) {
            return Ok(r);
        } else if name.contains('-') {
            let last = name.rsplit('-').next().unwrap_or(name);
            needle = last.strip_prefix('g').unwrap_or(last).to_owned();
        }
        if needle.is_empty() {
            return Err(CatalogError::NotFound(name.to_owned()));
        }

        let matches : Vec<&Revision> = pool.iter().filter(|r| r.hash.starts_with(&needle)).collect();
        // The same commit may be tracked under several roles
        let distinct : BTreeSet<&str> = matches.iter().map(|r| r.hash.as_str()).collect();
        match distinct.len() {
            0 => Err(CatalogError::NotFound(name.to_owned())),
            1 => Ok(matches[0]),
            n => Err(CatalogError::Ambiguous(name.to_owned(), n))
        }
    }
}

/// Projects version-control history onto the set of revisions worth
/// tracking.  Nothing here mutates state except the optional `pull`.
pub struct RevisionCatalog<'a> {
    history : &'a dyn History,
    config : &'a CatalogConfig
}

impl<'a> RevisionCatalog<'a> {
    pub fn new(history : &'a dyn History, config : &'a CatalogConfig) -> RevisionCatalog<'a> {
        RevisionCatalog { history, config }
    }

    /// Refresh remote history.  Network trouble is retried a bounded number of
    /// times; after that we carry on with whatever is available locally.
    pub fn pull(&self) -> bool {
        let attempts = self.config.fetch_attempts.max(1);
        for attempt in 1..=attempts {
            println!("Pulling {} repository", self.config.remote);
            match self.history.fetch() {
                Ok(()) => { return true }
                Err(e) => {
                    warn!("Fetch attempt {}/{} failed: {:#}", attempt, attempts, e);
                    if attempt < attempts {
                        thread::sleep(Duration::from_secs(self.config.fetch_backoff_secs));
                    }
                }
            }
        }
        warn!("Giving up on fetching; continuing with local history");
        false
    }

    /// All releases at or above `oldest_version`, sorted by version
    pub fn list_releases(&self, oldest_version : &str) -> anyhow::Result<Vec<Revision>> {
        let oldest = Version::parse(&normalize_version(oldest_version))
            .map_err(|_| CatalogError::InvalidVersion(oldest_version.to_owned()))?;
        let prefix = &self.config.release_tag_prefix;
        let mut releases = Vec::new();
        for tag in self.history.tags()? {
            let name = match tag.strip_prefix(prefix.as_str()) {
                None => { continue }
                Some(n) => n
            };
            match parse_release_version(name) {
                None => { debug!("Skipping tag {} (not a release version)", tag) }
                Some(version) => {
                    if version >= oldest {
                        let commit = self.history.commit(&tag)?;
                        releases.push(Revision::release(version, name.to_owned(), commit));
                    }
                }
            }
        }
        releases.sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.hash.cmp(&b.hash)));
        releases.dedup_by(|a, b| a.version == b.version);
        Ok(releases)
    }

    /// Numbered maintenance branches, ascending, as `(number, ref)`
    fn numbered_branches(&self) -> anyhow::Result<Vec<(u32, String)>> {
        let prefix = &self.config.branch_prefix;
        let mut branches : Vec<(u32, String)> = self.history.remote_branches()?
            .into_iter()
            .filter_map(|b| {
                let number = b.strip_prefix(prefix.as_str())?.parse::<u32>().ok()?;
                Some((number, b))
            })
            .collect();
        branches.sort();
        Ok(branches)
    }

    /// Label of the synthetic branch standing for mainline: one past the
    /// newest numbered branch
    fn mainline_label(&self, branches : &[(u32, String)]) -> String {
        match branches.last() {
            Some((n, _)) => (n + 1).to_string(),
            None => self.config.mainline.clone()
        }
    }

    /// Active branches with number at least `oldest_branch_number`, plus mainline
    pub fn list_branches(&self, oldest_branch_number : u32) -> anyhow::Result<Vec<Revision>> {
        let branches = self.numbered_branches()?;
        let mut result = Vec::new();
        for (number, refname) in branches.iter() {
            if *number >= oldest_branch_number {
                let commit = self.history.commit(refname)?;
                result.push(Revision::new(RevisionKind::Branch, Some(number.to_string()), commit));
            }
        }
        let head = self.history.commit(&self.config.mainline)?;
        result.push(Revision::new(RevisionKind::Branch, Some(self.mainline_label(&branches)), head));
        Ok(result)
    }

    /// The point where each branch left mainline.  These do not move when
    /// mainline advances, so bisection ranges anchored on them stay valid.
    pub fn list_branch_bases(&self) -> anyhow::Result<Vec<Revision>> {
        let mut result = Vec::new();
        for (number, refname) in self.numbered_branches()? {
            let base = self.history.merge_base(&self.config.mainline, &refname)?;
            let commit = self.history.commit(&base)?;
            result.push(Revision::new(RevisionKind::BranchBase, Some(format!("{}-base", number)), commit));
        }
        Ok(result)
    }

    /// The newest `window_size` first-parent mainline commits, newest first
    pub fn list_latest(&self, window_size : usize) -> anyhow::Result<Vec<Revision>> {
        Ok(self.history.first_parent_log(&self.config.mainline, window_size)?
           .into_iter()
           .map(|c| Revision::new(RevisionKind::Mainline, None, c))
           .collect())
    }

    pub fn collect(&self) -> anyhow::Result<Catalog> {
        let catalog = Catalog {
            releases : self.list_releases(&self.config.oldest_release)?,
            branches : self.list_branches(self.config.oldest_branch)?,
            branch_bases : self.list_branch_bases()?,
            latest : self.list_latest(self.config.latest_window)?
        };
        info!("Catalog: {} releases, {} branches, {} branch bases, {} latest revisions",
              catalog.releases.len(), catalog.branches.len(),
              catalog.branch_bases.len(), catalog.latest.len());
        Ok(catalog)
    }
}
