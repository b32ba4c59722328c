use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

/// Version of the manifest format; bumped whenever the layout of an artifact
/// changes so that old stores are rejected instead of silently misread
pub const CURRENT_VERSION : u32 = 1;

/// Name of the marker file recording which revision is staged in a directory.
/// It is never part of an archive.
pub const STAGING_MARKER : &str = ".gcc-bisect-revision";

#[derive(thiserror::Error,Debug)]
pub enum ManifestError {
    #[error("Manifest version mismatch in {0:?} (got {1} but expected {2})")]
    VersionMismatch(PathBuf, u32, u32),
    #[error("Manifest {0:?} is for revision {1}, expected {2}")]
    WrongRevision(PathBuf, String, String),
    #[error("Manifest entry escapes the install tree: '{0}'")]
    UnsafePath(String)
}

/// Side-car metadata for one artifact: everything the archive format is not
/// trusted to round-trip, plus integrity data for the archive itself
#[derive(Debug,Clone,PartialEq,Eq,Serialize,Deserialize)]
pub struct Manifest {
    pub version : u32,
    pub revision : String,
    /// Relative path of each symlink to its (unmodified) target
    pub symlinks : BTreeMap<String, String>,
    /// Relative paths of regular files with any executable bit set
    pub executables : BTreeSet<String>,
    pub archive_size : u64,
    pub sha256 : String
}

fn relative(root : &Path, path : &Path) -> Option<String> {
    path.strip_prefix(root).ok().map(|p| p.to_string_lossy().into_owned())
}

/// Reject absolute paths and `..` components coming from a manifest
fn checked_join(root : &Path, rel : &str) -> Result<PathBuf, ManifestError> {
    let p = Path::new(rel);
    if p.is_absolute() || p.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        return Err(ManifestError::UnsafePath(rel.to_owned()));
    }
    Ok(root.join(p))
}

impl Manifest {
    /// Record the symlinks and executable files under `root`
    pub fn capture(revision : &str, root : &Path) -> anyhow::Result<Manifest> {
        let mut symlinks = BTreeMap::new();
        let mut executables = BTreeSet::new();
        for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            let entry = entry?;
            let rel = match relative(root, entry.path()) {
                Some(r) if !r.is_empty() && r != STAGING_MARKER => r,
                _ => { continue }
            };
            let ft = entry.file_type();
            if ft.is_symlink() {
                let target = fs::read_link(entry.path())?;
                symlinks.insert(rel, target.to_string_lossy().into_owned());
            } else if ft.is_file() {
                let mode = entry.metadata()?.permissions().mode();
                if mode & 0o111 != 0 {
                    executables.insert(rel);
                }
            }
        }
        debug!("Manifest for {}: {} symlinks, {} executables", revision, symlinks.len(), executables.len());
        Ok(Manifest { version : CURRENT_VERSION,
                      revision : revision.to_owned(),
                      symlinks,
                      executables,
                      archive_size : 0,
                      sha256 : String::new() })
    }

    /// Recreate symlinks and restore executable bits under `root`
    pub fn replay(&self, root : &Path) -> anyhow::Result<()> {
        for (rel, target) in self.symlinks.iter() {
            let link = checked_join(root, rel)?;
            if let Some(parent) = link.parent() {
                fs::create_dir_all(parent)?;
            }
            if fs::symlink_metadata(&link).is_ok() {
                fs::remove_file(&link)?;
            }
            symlink(target, &link)?;
        }
        for rel in self.executables.iter() {
            let path = checked_join(root, rel)?;
            let mut perms = fs::metadata(&path)?.permissions();
            perms.set_mode(perms.mode() | 0o111);
            fs::set_permissions(&path, perms)?;
        }
        Ok(())
    }

    pub fn save(&self, path : &Path) -> anyhow::Result<()> {
        let f = fs::File::create(path)?;
        serde_json::to_writer_pretty(f, self)?;
        Ok(())
    }

    pub fn load(path : &Path, revision : &str) -> anyhow::Result<Manifest> {
        let f = fs::File::open(path)?;
        let manifest : Manifest = serde_json::from_reader(std::io::BufReader::new(f))?;
        if manifest.version != CURRENT_VERSION {
            return Err(anyhow::Error::new(ManifestError::VersionMismatch(path.to_path_buf(), manifest.version, CURRENT_VERSION)));
        }
        if manifest.revision != revision {
            return Err(anyhow::Error::new(ManifestError::WrongRevision(path.to_path_buf(), manifest.revision, revision.to_owned())));
        }
        Ok(manifest)
    }
}
