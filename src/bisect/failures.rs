use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Append-only record of revisions whose build failed.  Each line is
/// `<hash>:<message>`; an operator removes lines by hand to retry a build.
#[derive(Debug,Clone)]
pub struct FailureLog {
    path : PathBuf
}

impl FailureLog {
    pub fn new(path : &Path) -> FailureLog {
        FailureLog { path : path.to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All `(hash, message)` records, oldest first.  A missing log is empty.
    pub fn entries(&self) -> anyhow::Result<Vec<(String, String)>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => { return Ok(Vec::new()) }
            Err(e) => { return Err(e.into()) }
        };
        Ok(text.lines()
           .filter(|l| !l.trim().is_empty())
           .map(|l| match l.split_once(':') {
               Some((h, m)) => (h.trim().to_owned(), m.to_owned()),
               None => (l.trim().to_owned(), String::new())
           })
           .collect())
    }

    pub fn contains(&self, hash : &str) -> anyhow::Result<bool> {
        Ok(self.entries()?.iter().any(|(h, _)| h == hash))
    }

    pub fn append(&self, hash : &str, message : &str) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let folded = message.trim().replace('\n', ";");
        writeln!(f, "{}:{}", hash, folded)?;
        Ok(())
    }
}
