use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use xshell::Cmd;

use gccbisect::bisect::config::{parse_config, Config};
use gccbisect::bisect::lock::{FileLock, StoreGuard, StoreLock};

/// Stand-in for zstd when it is not installed: copies the input file to the
/// `-o` output and ignores every other flag.  Like zstd with `-f`, it
/// replaces the output file rather than writing into it.
const ARCHIVER_SHIM : &str = r#"#!/bin/sh
in=
out=
while [ $# -gt 0 ]; do
    case "$1" in
        -o) out="$2"; shift ;;
        -*) ;;
        *) in="$1" ;;
    esac
    shift
done
rm -f "$out"
exec cp "$in" "$out"
"#;

pub fn write_script(path : &Path, text : &str) -> anyhow::Result<()> {
    fs::write(path, text)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

/// The real zstd if available, otherwise a shim written into `dir`
pub fn archiver(dir : &Path) -> anyhow::Result<PathBuf> {
    if let Ok(zstd) = which::which("zstd") {
        return Ok(zstd);
    }
    let shim = dir.join("zstd-shim");
    write_script(&shim, ARCHIVER_SHIM)?;
    Ok(shim)
}

/// The installed zstd, for tests that must not fall back to the shim
#[allow(dead_code)] // used by test_store, not test_bisect
pub fn real_zstd() -> Option<PathBuf> {
    which::which("zstd").ok()
}

/// Run git in `dir` with a fixed identity
pub fn git(dir : &Path, args : &[&str]) -> anyhow::Result<String> {
    let out = Cmd::new("git")
        .arg("-C").arg(dir)
        .arg("-c").arg("user.name=Test Developer")
        .arg("-c").arg("user.email=dev@example.org")
        .args(args)
        .echo_cmd(false)
        .read()?;
    Ok(out)
}

/// One commit of a synthetic compiler project
pub struct FakeCommit<'a> {
    /// Body of `build.sh`, run from the build directory
    pub build : &'a str,
    /// What the installed `gcc` prints
    pub output : &'a str,
    /// Exit code of the installed `gcc`
    pub exit_code : i32
}

pub const BUILD_OK : &str = "exit 0\n";

/// Create a repository at `dir` with one commit per entry (oldest first) and
/// a `mainline` branch at the last one.  Returns the commit hashes.
pub fn make_history(dir : &Path, commits : &[FakeCommit]) -> anyhow::Result<Vec<String>> {
    fs::create_dir_all(dir)?;
    git(dir, &["init", "-q"])?;
    let mut hashes = Vec::new();
    for (i, c) in commits.iter().enumerate() {
        hashes.push(commit(dir, c, &i.to_string())?);
    }
    git(dir, &["branch", "mainline"])?;
    Ok(hashes)
}

/// Commit the build and install scripts for `c` on the current branch
fn commit(dir : &Path, c : &FakeCommit, name : &str) -> anyhow::Result<String> {
    write_script(&dir.join("build.sh"), &format!("#!/bin/sh\n{}", c.build))?;
    let install = format!(r#"#!/bin/sh
set -e
bin="$1/usr/local/bin"
mkdir -p "$bin" "$1/usr/local/lib64"
cat > "$bin/gcc" <<'EOF'
#!/bin/sh
echo "{}"
exit {}
EOF
chmod +x "$bin/gcc"
ln -sf gcc "$bin/cc"
echo "revision {}" > "$1/usr/local/lib64/README"
"#, c.output, c.exit_code, name);
    write_script(&dir.join("install.sh"), &install)?;
    git(dir, &["add", "build.sh", "install.sh"])?;
    let message = format!("commit {}\n\nChange number {}.", name, name);
    git(dir, &["commit", "-q", "-m", message.as_str()])?;
    git(dir, &["rev-parse", "HEAD"])
}

/// Fork maintenance branch `number` off `base` with one commit of its own,
/// published as the remote-tracking ref `origin/releases/gcc-<number>`.
/// Returns the branch tip.
#[allow(dead_code)] // used by test_bisect, not test_store
pub fn make_branch(dir : &Path, number : u32, base : &str, c : &FakeCommit) -> anyhow::Result<String> {
    let local = format!("gcc-{}", number);
    git(dir, &["checkout", "-q", "-b", local.as_str(), base])?;
    let tip = commit(dir, c, &format!("branch-{}", number))?;
    let remote = format!("refs/remotes/origin/releases/gcc-{}", number);
    git(dir, &["update-ref", remote.as_str(), tip.as_str()])?;
    git(dir, &["checkout", "-q", "-"])?;
    Ok(tip)
}

/// Tag `hash` as release `version`
#[allow(dead_code)] // used by test_bisect, not test_store
pub fn tag_release(dir : &Path, version : &str, hash : &str) -> anyhow::Result<()> {
    let tag = format!("releases/gcc-{}", version);
    git(dir, &["tag", tag.as_str(), hash])?;
    Ok(())
}

/// Configuration for a workspace under `root` whose sources live in `repo`.
/// `extra` is appended verbatim.
pub fn make_config(root : &Path, repo : &Path, extra : &str) -> anyhow::Result<Config> {
    let archiver = archiver(root)?;
    let text = format!(r#"
[Default]
git_location = "{repo}"
binaries_location = "{root}/binaries"
extract_location = "{root}/extract"
build_location = "{root}/build"
archiver = "{archiver}"

[catalog]
mainline = "mainline"
latest_window = 50
fetch_attempts = 1
fetch_backoff_secs = 0
{extra}"#,
                       repo = repo.display(),
                       root = root.display(),
                       archiver = archiver.display(),
                       extra = extra);
    let path = root.join("gcc-bisect.toml");
    fs::write(&path, &text)?;
    Ok(parse_config(&path, &text)?)
}

/// The `[build]` section of the synthetic project
pub const SCRIPT_RECIPE : &str = r#"
[build]
configure = ["true"]
build = ["sh", "{src}/build.sh"]
install = ["sh", "{src}/install.sh", "{dest}"]
jobs = 1
"#;

/// Store lock that logs every acquire and release in order
pub struct RecordingLock {
    inner : FileLock,
    pub events : Arc<Mutex<Vec<&'static str>>>
}

struct Recorded {
    events : Arc<Mutex<Vec<&'static str>>>,
    _guard : StoreGuard
}

impl Drop for Recorded {
    fn drop(&mut self) {
        if let Ok(mut ev) = self.events.lock() {
            ev.push("release");
        }
    }
}

impl RecordingLock {
    pub fn new(path : &Path) -> RecordingLock {
        RecordingLock { inner : FileLock::new(path), events : Arc::new(Mutex::new(Vec::new())) }
    }
}

impl StoreLock for RecordingLock {
    fn acquire(&self) -> anyhow::Result<StoreGuard> {
        let guard = self.inner.acquire()?;
        self.events.lock().map_err(|_| anyhow::anyhow!("poisoned"))?.push("acquire");
        Ok(StoreGuard::new(Recorded { events : Arc::clone(&self.events), _guard : guard }))
    }
}

/// Events must strictly alternate, starting with an acquire
#[allow(dead_code)] // used by test_store, not test_bisect
pub fn assert_alternating(events : &[&str]) {
    assert_eq!(events.len() % 2, 0, "{:?}", events);
    for pair in events.chunks(2) {
        assert_eq!(pair, ["acquire", "release"], "{:?}", events);
    }
}
