use std::path::{Path, PathBuf};

use log::debug;

use crate::bisect::revision::Commit;
use crate::bisect::subproc::SubProcOperation;

/// Field separator for `git log --format`; commit subjects may contain
/// anything printable, but not a unit separator
const SEP : char = '\x1f';
const LOG_FORMAT : &str = "--format=%H%x1f%ct%x1f%cd%x1f%ae%x1f%s";
const DATE_FORMAT : &str = "--date=format:%d %b %Y %H:%M";

#[derive(thiserror::Error,Debug)]
pub enum GitError {
    #[error("Unexpected git log line: '{0}'")]
    MalformedLog(String),
    #[error("Reference '{0}' does not name a commit")]
    UnknownRef(String),
    #[error("No merge base between '{0}' and '{1}'")]
    NoMergeBase(String, String)
}

/// The view of version-control history that cataloging, building and
/// reporting need.
///
/// All queries are read-only except `fetch` and `checkout`.
pub trait History {
    /// Update remote-tracking refs
    fn fetch(&self) -> anyhow::Result<()>;
    /// All tag names
    fn tags(&self) -> anyhow::Result<Vec<String>>;
    /// All remote-tracking branch names (e.g. `origin/releases/gcc-12`)
    fn remote_branches(&self) -> anyhow::Result<Vec<String>>;
    /// Resolve a reference to its commit
    fn commit(&self, refname : &str) -> anyhow::Result<Commit>;
    fn merge_base(&self, a : &str, b : &str) -> anyhow::Result<String>;
    /// Up to `limit` first-parent commits reachable from `refname`, newest first
    fn first_parent_log(&self, refname : &str, limit : usize) -> anyhow::Result<Vec<Commit>>;
    /// First-parent hashes in `from..to`, newest first
    fn rev_list(&self, from : &str, to : &str) -> anyhow::Result<Vec<String>>;
    /// Full commit message
    fn message(&self, hash : &str) -> anyhow::Result<String>;
    /// Project-specific long name for a commit, if the repository provides one
    fn describe(&self, hash : &str) -> Option<String>;
    /// Force the working tree to the given commit
    fn checkout(&self, hash : &str) -> anyhow::Result<()>;
}

/// A git working copy driven through the `git` executable
#[derive(Debug,Clone)]
pub struct GitRepo {
    git : PathBuf,
    location : PathBuf,
    remote : String
}

impl GitRepo {
    pub fn new(git : &Path, location : &Path, remote : &str) -> GitRepo {
        GitRepo { git : git.to_path_buf(), location : location.to_path_buf(), remote : remote.to_owned() }
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    fn git_op(&self) -> SubProcOperation {
        let mut op = SubProcOperation::new(self.git.as_os_str());
        op.push_arg("-C").push_arg(self.location.as_os_str());
        op
    }

    fn run<I, S>(&self, args : I) -> anyhow::Result<String>
    where I: IntoIterator<Item = S>, S: AsRef<str>
    {
        let mut op = self.git_op();
        for arg in args {
            op.push_arg(arg.as_ref());
        }
        Ok(op.execute_checked()?.stdout)
    }

    fn lines<I, S>(&self, args : I) -> anyhow::Result<Vec<String>>
    where I: IntoIterator<Item = S>, S: AsRef<str>
    {
        Ok(self.run(args)?
           .lines()
           .map(|l| l.trim().to_owned())
           .filter(|l| !l.is_empty())
           .collect())
    }
}

fn parse_log_line(line : &str) -> Result<Commit, GitError> {
    let fields : Vec<&str> = line.splitn(5, SEP).collect();
    if fields.len() != 5 {
        return Err(GitError::MalformedLog(line.to_owned()));
    }
    let timestamp = fields[1].parse::<i64>().map_err(|_| GitError::MalformedLog(line.to_owned()))?;
    Ok(Commit { hash : fields[0].to_owned(),
                timestamp,
                date : fields[2].to_owned(),
                author : fields[3].to_owned(),
                summary : fields[4].to_owned() })
}

impl History for GitRepo {
    fn fetch(&self) -> anyhow::Result<()> {
        self.run(["fetch", self.remote.as_str()])?;
        Ok(())
    }

    fn tags(&self) -> anyhow::Result<Vec<String>> {
        self.lines(["tag", "--list"])
    }

    fn remote_branches(&self) -> anyhow::Result<Vec<String>> {
        let pattern = format!("refs/remotes/{}/", self.remote);
        self.lines(["for-each-ref", "--format=%(refname:short)", pattern.as_str()])
    }

    fn commit(&self, refname : &str) -> anyhow::Result<Commit> {
        let spec = format!("{}^{{commit}}", refname);
        let out = self.run(["log", "-1", LOG_FORMAT, DATE_FORMAT, spec.as_str(), "--"])?;
        match out.lines().next() {
            None => Err(anyhow::Error::new(GitError::UnknownRef(refname.to_owned()))),
            Some(line) => Ok(parse_log_line(line)?)
        }
    }

    fn merge_base(&self, a : &str, b : &str) -> anyhow::Result<String> {
        let out = self.lines(["merge-base", a, b])?;
        out.into_iter().next()
            .ok_or_else(|| anyhow::Error::new(GitError::NoMergeBase(a.to_owned(), b.to_owned())))
    }

    fn first_parent_log(&self, refname : &str, limit : usize) -> anyhow::Result<Vec<Commit>> {
        let count = format!("-n{}", limit);
        let out = self.run(["log", "--first-parent", count.as_str(), LOG_FORMAT, DATE_FORMAT, refname, "--"])?;
        let commits = out.lines()
            .filter(|l| !l.is_empty())
            .map(parse_log_line)
            .collect::<Result<Vec<_>, _>>()?;
        debug!("Read {} first-parent commits from {}", commits.len(), refname);
        Ok(commits)
    }

    fn rev_list(&self, from : &str, to : &str) -> anyhow::Result<Vec<String>> {
        let range = format!("{}..{}", from, to);
        self.lines(["rev-list", "--first-parent", range.as_str()])
    }

    fn message(&self, hash : &str) -> anyhow::Result<String> {
        self.run(["log", "-1", "--format=%B", hash, "--"])
    }

    fn describe(&self, hash : &str) -> Option<String> {
        // `gcc-descr` is a git alias shipped by GCC's contrib/gcc-git-customization.sh
        match self.run(["gcc-descr", "--full", hash]) {
            Err(e) => {
                debug!("git gcc-descr unavailable for {}: {}", hash, e);
                None
            }
            Ok(out) => {
                let descr = out.trim();
                let parts : Vec<&str> = descr.split('-').collect();
                if parts.len() != 3 {
                    return None;
                }
                let tail : String = parts[2].chars().take(17).collect();
                Some(format!("{}-{}-{}", parts[0], parts[1], tail))
            }
        }
    }

    fn checkout(&self, hash : &str) -> anyhow::Result<()> {
        self.run(["checkout", "--force", hash])?;
        Ok(())
    }
}
