use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::bisect::config::Config;
use crate::bisect::lock::{FileLock, StoreGuard, StoreLock};
use crate::bisect::manifest::{Manifest, STAGING_MARKER};
use crate::bisect::subproc::SubProcOperation;

pub const ARCHIVE_SUFFIX : &str = ".tar.zst";
pub const MANIFEST_SUFFIX : &str = ".json";

const ELF_MAGIC : &[u8; 4] = b"\x7fELF";

#[derive(thiserror::Error,Debug)]
pub enum StoreError {
    #[error("No stored binaries for revision {0}")]
    MissingArtifact(String),
    #[error("Archive for revision {0} is corrupted (checksum {1} but manifest says {2})")]
    Corrupted(String, String, String),
    #[error("Install tree {0:?} does not exist")]
    MissingInstallTree(PathBuf)
}

#[derive(Debug,Clone,PartialEq,Eq)]
pub enum StoreOutcome {
    /// A new archive of the given compressed size was committed
    Stored(u64),
    AlreadyStored
}

#[derive(Debug,Clone,PartialEq,Eq)]
pub enum ExtractOutcome {
    Extracted,
    /// The destination already held this revision
    AlreadyStaged
}

#[derive(Debug,Clone,Default,PartialEq,Eq)]
pub struct GcSummary {
    pub candidates : Vec<String>,
    pub removed : Vec<String>,
    pub freed_bytes : u64
}

/// Content-addressed archives of installed toolchains, one per revision
pub struct ArtifactStore {
    location : PathBuf,
    archiver : PathBuf,
    strip : PathBuf,
    lock : Arc<dyn StoreLock>
}

fn sha256_file(path : &Path) -> anyhow::Result<String> {
    let mut hasher = Sha256::new();
    let mut f = File::open(path)?;
    let mut buf = vec![0u8; 1 << 16];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn is_elf(path : &Path) -> bool {
    let mut magic = [0u8; 4];
    match File::open(path).and_then(|mut f| f.read_exact(&mut magic)) {
        Ok(()) => &magic == ELF_MAGIC,
        Err(_) => false
    }
}

/// Empty `dir`, creating it if needed
pub fn clear_dir(dir : &Path) -> anyhow::Result<()> {
    if fs::symlink_metadata(dir).is_ok() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    Ok(())
}

/// The revision currently staged in `dir`, if any
pub fn staged_revision(dir : &Path) -> Option<String> {
    fs::read_to_string(dir.join(STAGING_MARKER)).ok().map(|s| s.trim().to_owned())
}

pub fn mark_staged(dir : &Path, hash : &str) -> anyhow::Result<()> {
    fs::write(dir.join(STAGING_MARKER), hash)?;
    Ok(())
}

impl ArtifactStore {
    pub fn new(location : &Path, archiver : &Path, strip : &Path, lock : Arc<dyn StoreLock>) -> ArtifactStore {
        ArtifactStore { location : location.to_path_buf(),
                        archiver : archiver.to_path_buf(),
                        strip : strip.to_path_buf(),
                        lock }
    }

    pub fn from_config(config : &Config) -> ArtifactStore {
        let lock = Arc::new(FileLock::new(&config.paths.lock_file));
        ArtifactStore::new(&config.paths.binaries_location, &config.paths.archiver, &config.paths.strip, lock)
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn archive_path(&self, hash : &str) -> PathBuf {
        self.location.join(format!("{}{}", hash, ARCHIVE_SUFFIX))
    }

    pub fn manifest_path(&self, hash : &str) -> PathBuf {
        self.location.join(format!("{}{}", hash, MANIFEST_SUFFIX))
    }

    /// Block until the store lock is held
    pub fn lock(&self) -> anyhow::Result<StoreGuard> {
        self.lock.acquire()
    }

    pub fn exists(&self, hash : &str) -> bool {
        self.archive_path(hash).is_file()
    }

    /// Hashes of every stored revision
    pub fn list(&self) -> anyhow::Result<BTreeSet<String>> {
        let pattern = self.location.join(format!("*{}", ARCHIVE_SUFFIX));
        let mut hashes = BTreeSet::new();
        for entry in glob::glob(&pattern.to_string_lossy())? {
            let path = entry?;
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if let Some(hash) = name.strip_suffix(ARCHIVE_SUFFIX) {
                    hashes.insert(hash.to_owned());
                }
            }
        }
        Ok(hashes)
    }

    /// Strip debug information from every ELF file under `root`.  A file
    /// strip refuses (scripts with an ELF-looking header, odd objects) is
    /// left alone.
    fn strip_debug(&self, root : &Path) -> anyhow::Result<usize> {
        let mut stripped = 0;
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry?;
            if !entry.file_type().is_file() || !is_elf(entry.path()) {
                continue;
            }
            let mut op = SubProcOperation::new(self.strip.as_os_str());
            op.push_arg("--strip-debug").push_arg(entry.path().as_os_str());
            match op.execute() {
                Ok(out) if out.success() => { stripped += 1 }
                Ok(out) => { debug!("strip failed on {:?}: {}", entry.path(), out.stderr.trim()) }
                Err(e) => { debug!("strip failed on {:?}: {}", entry.path(), e) }
            }
        }
        Ok(stripped)
    }

    fn write_tar(&self, root : &Path, tar_file : File) -> anyhow::Result<()> {
        let mut tb = tar::Builder::new(tar_file);
        tb.follow_symlinks(false);
        for entry in WalkDir::new(root).min_depth(1).follow_links(false).sort_by_file_name() {
            let entry = entry?;
            let rel = entry.path().strip_prefix(root)?;
            if rel == Path::new(STAGING_MARKER) {
                continue;
            }
            if entry.file_type().is_dir() {
                tb.append_dir(rel, entry.path())?;
            } else {
                tb.append_path_with_name(entry.path(), rel)?;
            }
        }
        tb.into_inner()?;
        Ok(())
    }

    /// Archive the install tree at `root` as the artifact for `hash`.
    ///
    /// The manifest is written before the archive is renamed into place, so
    /// an interrupted store never leaves an archive without its manifest.
    pub fn store(&self, _guard : &StoreGuard, hash : &str, root : &Path) -> anyhow::Result<StoreOutcome> {
        if self.exists(hash) {
            info!("Revision {} is already stored", hash);
            return Ok(StoreOutcome::AlreadyStored);
        }
        if !root.is_dir() {
            return Err(anyhow::Error::new(StoreError::MissingInstallTree(root.to_path_buf())));
        }
        fs::create_dir_all(&self.location)?;

        let stripped = self.strip_debug(root)?;
        debug!("Stripped {} files under {:?}", stripped, root);
        let mut manifest = Manifest::capture(hash, root)?;

        let tar_tmp = tempfile::Builder::new().prefix(".stage-").suffix(".tar").tempfile_in(&self.location)?;
        self.write_tar(root, tar_tmp.reopen()?)?;
        let archive_tmp = tempfile::Builder::new().prefix(".stage-").suffix(".zst.tmp").tempfile_in(&self.location)?;
        let mut compress = SubProcOperation::new(self.archiver.as_os_str());
        compress.push_arg("-q").push_arg("-19").push_arg("-T0")
            .push_arg("-f").push_arg(tar_tmp.path().as_os_str())
            .push_arg("-o").push_arg(archive_tmp.path().as_os_str());
        compress.execute_checked()?;

        manifest.archive_size = fs::metadata(archive_tmp.path())?.len();
        manifest.sha256 = sha256_file(archive_tmp.path())?;
        manifest.save(&self.manifest_path(hash))?;
        archive_tmp.persist(self.archive_path(hash))?;
        info!("Stored revision {} ({} bytes)", hash, manifest.archive_size);
        Ok(StoreOutcome::Stored(manifest.archive_size))
    }

    /// Stage the artifact for `hash` into `dest`, replacing whatever was there
    pub fn extract(&self, _guard : &StoreGuard, hash : &str, dest : &Path) -> anyhow::Result<ExtractOutcome> {
        let archive = self.archive_path(hash);
        if !archive.is_file() {
            return Err(anyhow::Error::new(StoreError::MissingArtifact(hash.to_owned())));
        }
        if staged_revision(dest).as_deref() == Some(hash) {
            debug!("Revision {} already staged in {:?}", hash, dest);
            return Ok(ExtractOutcome::AlreadyStaged);
        }
        let manifest = Manifest::load(&self.manifest_path(hash), hash)?;
        let checksum = sha256_file(&archive)?;
        if checksum != manifest.sha256 {
            return Err(anyhow::Error::new(StoreError::Corrupted(hash.to_owned(), checksum, manifest.sha256)));
        }

        clear_dir(dest)?;
        let tar_tmp = tempfile::Builder::new().prefix(".unpack-").suffix(".tar").tempfile_in(&self.location)?;
        let mut decompress = SubProcOperation::new(self.archiver.as_os_str());
        decompress.push_arg("-d").push_arg("-q")
            .push_arg("-f").push_arg(archive.as_os_str())
            .push_arg("-o").push_arg(tar_tmp.path().as_os_str());
        decompress.execute_checked()?;

        // The archiver replaces its output file, so the temporary must be
        // opened again by name
        let mut ar = tar::Archive::new(File::open(tar_tmp.path())?);
        ar.set_preserve_permissions(true);
        ar.unpack(dest)?;
        manifest.replay(dest)?;
        mark_staged(dest, hash)?;
        debug!("Extracted revision {} into {:?}", hash, dest);
        Ok(ExtractOutcome::Extracted)
    }

    /// Delete every artifact whose revision is not in `keep`, after `confirm`
    /// approves the list of candidates
    pub fn garbage_collect<F>(&self, keep : &BTreeSet<String>, confirm : F) -> anyhow::Result<GcSummary>
    where F: FnOnce(&[String]) -> anyhow::Result<bool>
    {
        let _guard = self.lock()?;
        let candidates : Vec<String> = self.list()?.into_iter().filter(|h| !keep.contains(h)).collect();
        let mut summary = GcSummary { candidates, ..GcSummary::default() };
        if summary.candidates.is_empty() || !confirm(&summary.candidates)? {
            return Ok(summary);
        }
        for hash in summary.candidates.iter() {
            let archive = self.archive_path(hash);
            summary.freed_bytes += fs::metadata(&archive).map(|m| m.len()).unwrap_or(0);
            fs::remove_file(&archive)?;
            match fs::remove_file(self.manifest_path(hash)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => { return Err(e.into()) }
            }
            summary.removed.push(hash.clone());
        }
        info!("Removed {} artifacts, freed {} bytes", summary.removed.len(), summary.freed_bytes);
        Ok(summary)
    }

    /// Fraction of the store filesystem in use
    pub fn disk_usage(&self) -> anyhow::Result<f64> {
        // The store directory only appears with the first artifact
        let existing = self.location.ancestors().find(|p| p.exists()).unwrap_or(Path::new("/"));
        let st = nix::sys::statvfs::statvfs(existing)?;
        let total = st.blocks() as f64;
        if total == 0.0 {
            return Ok(0.0);
        }
        Ok((total - st.blocks_free() as f64) / total)
    }

    /// Warn when the store filesystem is fuller than `threshold`.  Returns
    /// whether the warning fired.
    pub fn check_disk_usage(&self, threshold : f64) -> anyhow::Result<bool> {
        let usage = self.disk_usage()?;
        if usage > threshold {
            println!("WARNING: Disk usage: {:.0}%", usage * 100.0);
            warn!("Store filesystem of {:?} is {:.1}% full", self.location, usage * 100.0);
            return Ok(true);
        }
        Ok(false)
    }
}
