use std::fmt;

use semver::Version;

/// Why a revision is tracked
#[derive(Debug,Clone,Copy,Hash,Eq,PartialEq,Ord,PartialOrd)]
pub enum RevisionKind {
    /// A tagged release
    Release,
    /// The tip of a maintenance branch (or of mainline)
    Branch,
    /// The merge-base of a maintenance branch with mainline
    BranchBase,
    /// An anonymous mainline commit from the latest window
    Mainline
}

/// A commit as read out of the history, before we know why we track it
#[derive(Debug,Clone,Eq,PartialEq)]
pub struct Commit {
    pub hash : String,
    /// Committer timestamp, unix seconds
    pub timestamp : i64,
    /// Committer date, pre-formatted by git (`%d %b %Y %H:%M`)
    pub date : String,
    /// Author e-mail
    pub author : String,
    /// First line of the commit message
    pub summary : String
}

/// One immutable point in the project history
#[derive(Debug,Clone,Eq,PartialEq)]
pub struct Revision {
    pub hash : String,
    pub kind : RevisionKind,
    /// Release version, branch number or `<N>-base`; `None` for mainline commits
    pub label : Option<String>,
    pub timestamp : i64,
    pub date : String,
    pub author : String,
    pub summary : String,
    /// Parsed version, for releases only
    pub version : Option<Version>
}

impl Revision {
    pub fn new(kind : RevisionKind, label : Option<String>, commit : Commit) -> Revision {
        Revision {
            hash : commit.hash,
            kind,
            label,
            timestamp : commit.timestamp,
            date : commit.date,
            author : commit.author,
            summary : commit.summary,
            version : None
        }
    }

    pub fn release(version : Version, label : String, commit : Commit) -> Revision {
        Revision { version : Some(version), ..Revision::new(RevisionKind::Release, Some(label), commit) }
    }

    pub fn short_hash(&self) -> &str {
        let end = self.hash.len().min(16);
        &self.hash[..end]
    }

    /// One-line human description used in every listing and probe line.
    ///
    /// `full_name` replaces the short hash when the caller resolved a richer
    /// name (e.g. `r13-1234-g0123abcd`).
    pub fn description(&self, full_name : Option<&str>) -> String {
        let hash = full_name.unwrap_or(self.short_hash());
        match (&self.kind, &self.label) {
            (RevisionKind::Mainline, _) | (_, None) => {
                format!("{}({})({})", hash, self.date, self.author)
            }
            (_, Some(label)) => {
                format!("{} ({})({})", label, hash, self.date)
            }
        }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{}:{}", self.hash, label),
            None => write!(f, "{}:{}", self.hash, self.date)
        }
    }
}
