use std::path::{Path, PathBuf};

use serde::Deserialize;

/// File name of the configuration file inside the user configuration directory
pub const CONFIG_FILE_NAME : &str = "gcc-bisect.toml";

#[derive(thiserror::Error,Debug)]
pub enum ConfigError {
    #[error("Cannot determine the user configuration directory")]
    NoConfigDir,
    #[error("Cannot read config file {0:?}: {1}")]
    Unreadable(PathBuf, std::io::Error),
    #[error("Cannot parse config file {0:?}: {1}")]
    Malformed(PathBuf, toml::de::Error),
    #[error("Cannot find Default section in config file: {0:?}")]
    MissingSection(PathBuf),
    #[error("Missing variable {0} in config file: {1:?}")]
    MissingKey(&'static str, PathBuf),
    #[error("Cannot find tool '{0}' ({1})")]
    MissingTool(String, which::Error),
    #[error("Invalid value for {0} in config file: {1}")]
    InvalidValue(&'static str, String)
}

#[derive(Deserialize,Debug,Default)]
struct RawConfig {
    #[serde(rename = "Default")]
    default : Option<RawPaths>,
    #[serde(default)]
    catalog : CatalogConfig,
    #[serde(default)]
    build : BuildConfig,
    #[serde(default)]
    bisect : BisectConfig
}

#[derive(Deserialize,Debug,Default)]
struct RawPaths {
    git_location : Option<PathBuf>,
    binaries_location : Option<PathBuf>,
    extract_location : Option<PathBuf>,
    archiver : Option<PathBuf>,
    strip : Option<PathBuf>,
    git : Option<PathBuf>,
    build_location : Option<PathBuf>,
    failure_log : Option<PathBuf>,
    lock_file : Option<PathBuf>
}

/// Filesystem locations and external tools
#[derive(Debug,Clone)]
pub struct Paths {
    /// Source repository (a git working copy)
    pub git_location : PathBuf,
    /// Artifact store directory
    pub binaries_location : PathBuf,
    /// Staging directory binaries are installed into and extracted to
    pub extract_location : PathBuf,
    /// Warm build directory reused between builds
    pub build_location : PathBuf,
    pub failure_log : PathBuf,
    pub lock_file : PathBuf,
    pub archiver : PathBuf,
    pub strip : PathBuf,
    pub git : PathBuf
}

/// How the revisions worth tracking are found
#[derive(Deserialize,Debug,Clone)]
#[serde(default)]
pub struct CatalogConfig {
    pub remote : String,
    /// Reference of the mainline head
    pub mainline : String,
    pub release_tag_prefix : String,
    pub branch_prefix : String,
    pub oldest_release : String,
    pub oldest_branch : u32,
    pub latest_window : usize,
    pub fetch_attempts : u32,
    pub fetch_backoff_secs : u64
}

impl Default for CatalogConfig {
    fn default() -> Self {
        CatalogConfig {
            remote : "origin".to_owned(),
            mainline : "origin/master".to_owned(),
            release_tag_prefix : "releases/gcc-".to_owned(),
            branch_prefix : "origin/releases/gcc-".to_owned(),
            oldest_release : "4.8.0".to_owned(),
            oldest_branch : 10,
            latest_window : 10000,
            fetch_attempts : 10,
            fetch_backoff_secs : 30
        }
    }
}

/// The native build recipe.  Every step is an argument vector; `{src}`,
/// `{dest}` and `{jobs}` are substituted before running.
#[derive(Deserialize,Debug,Clone)]
#[serde(default)]
pub struct BuildConfig {
    pub configure : Vec<String>,
    pub build : Vec<String>,
    pub install : Vec<String>,
    pub jobs : Option<usize>,
    pub patches : Vec<PathBuf>,
    pub disable_makeinfo : bool
}

impl Default for BuildConfig {
    fn default() -> Self {
        let argv = |v : &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        BuildConfig {
            configure : argv(&["{src}/configure",
                               "--disable-bootstrap",
                               "--enable-checking=yes",
                               "--disable-libsanitizer",
                               "--enable-languages=c,c++,fortran",
                               "--without-isl",
                               "--disable-cet",
                               "--disable-libstdcxx-pch",
                               "--disable-static"]),
            build : argv(&["nice", "make", "-j{jobs}", "CFLAGS=-O2 -g0", "CXXFLAGS=-O2 -g0"]),
            install : argv(&["make", "install", "DESTDIR={dest}"]),
            jobs : None,
            patches : Vec::new(),
            disable_makeinfo : true
        }
    }
}

impl BuildConfig {
    pub fn jobs(&self) -> usize {
        self.jobs.unwrap_or_else(|| {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        })
    }
}

#[derive(Deserialize,Debug,Clone)]
#[serde(default)]
pub struct BisectConfig {
    /// Install prefix inside the staging directory
    pub install_prefix : PathBuf,
    /// Library directory inside the install prefix
    pub library_dir : String,
    /// Bug submission URL; empty disables the hint
    pub bug_tracker_url : String,
    /// Fill ratio of the store filesystem above which we warn
    pub disk_usage_threshold : f64
}

impl Default for BisectConfig {
    fn default() -> Self {
        BisectConfig {
            install_prefix : PathBuf::from("usr/local"),
            library_dir : "lib64".to_owned(),
            bug_tracker_url : "https://gcc.gnu.org/bugzilla/enter_bug.cgi?product=gcc".to_owned(),
            disk_usage_threshold : 0.95
        }
    }
}

#[derive(Debug,Clone)]
pub struct Config {
    pub source : PathBuf,
    pub paths : Paths,
    pub catalog : CatalogConfig,
    pub build : BuildConfig,
    pub bisect : BisectConfig
}

/// Location of the configuration file when none is given on the command line
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|d| d.join(CONFIG_FILE_NAME))
        .ok_or(ConfigError::NoConfigDir)
}

pub fn load_config(path : &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Unreadable(path.to_path_buf(), e))?;
    parse_config(path, &text)
}

/// Parse and validate configuration text.  Every required key is checked
/// before anything else happens so that a broken configuration never gets as
/// far as touching the store.
pub fn parse_config(path : &Path, text : &str) -> Result<Config, ConfigError> {
    let raw : RawConfig = toml::from_str(text)
        .map_err(|e| ConfigError::Malformed(path.to_path_buf(), e))?;
    let paths = raw.default.ok_or_else(|| ConfigError::MissingSection(path.to_path_buf()))?;
    let required = |value : Option<PathBuf>, key : &'static str| {
        value.ok_or_else(|| ConfigError::MissingKey(key, path.to_path_buf()))
    };
    let git_location = required(paths.git_location, "git_location")?;
    let binaries_location = required(paths.binaries_location, "binaries_location")?;
    let extract_location = required(paths.extract_location, "extract_location")?;

    if raw.bisect.disk_usage_threshold <= 0.0 || raw.bisect.disk_usage_threshold > 1.0 {
        return Err(ConfigError::InvalidValue("disk_usage_threshold",
                                             raw.bisect.disk_usage_threshold.to_string()));
    }
    if raw.build.build.is_empty() || raw.build.install.is_empty() {
        return Err(ConfigError::InvalidValue("build", "build and install steps must not be empty".to_owned()));
    }
    if semver::Version::parse(&crate::bisect::catalog::normalize_version(&raw.catalog.oldest_release)).is_err() {
        return Err(ConfigError::InvalidValue("oldest_release", raw.catalog.oldest_release.clone()));
    }

    let paths = Paths {
        failure_log : paths.failure_log.unwrap_or_else(|| binaries_location.join("build-failures.log")),
        lock_file : paths.lock_file.unwrap_or_else(|| binaries_location.join(".gcc-bisect.lock")),
        build_location : paths.build_location.unwrap_or_else(|| PathBuf::from("/dev/shm/gcc-bisect-tmp")),
        archiver : paths.archiver.unwrap_or_else(|| PathBuf::from("zstd")),
        strip : paths.strip.unwrap_or_else(|| PathBuf::from("strip")),
        git : paths.git.unwrap_or_else(|| PathBuf::from("git")),
        git_location,
        binaries_location,
        extract_location
    };

    Ok(Config { source : path.to_path_buf(),
                paths,
                catalog : raw.catalog,
                build : raw.build,
                bisect : raw.bisect })
}

impl Config {
    /// Resolve the external tools to absolute paths
    pub fn resolve_tools(&mut self) -> Result<(), ConfigError> {
        for tool in [&mut self.paths.git, &mut self.paths.archiver, &mut self.paths.strip] {
            let found = which::which(tool.as_path())
                .map_err(|e| ConfigError::MissingTool(tool.display().to_string(), e))?;
            *tool = found;
        }
        Ok(())
    }

    /// Where binaries land inside the staging directory
    pub fn install_path(&self) -> PathBuf {
        self.paths.extract_location.join(&self.bisect.install_prefix)
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    const MINIMAL : &str = r#"
[Default]
git_location = "/src/gcc"
binaries_location = "/data/gcc-binaries"
extract_location = "/dev/shm/gcc-extract"
"#;

    #[test]
    fn test_minimal_config() -> anyhow::Result<()> {
        let cfg = parse_config(Path::new("cfg.toml"), MINIMAL)?;
        assert_eq!(cfg.paths.git_location, PathBuf::from("/src/gcc"));
        assert_eq!(cfg.paths.failure_log, PathBuf::from("/data/gcc-binaries/build-failures.log"));
        assert_eq!(cfg.paths.lock_file, PathBuf::from("/data/gcc-binaries/.gcc-bisect.lock"));
        assert_eq!(cfg.paths.archiver, PathBuf::from("zstd"));
        assert_eq!(cfg.catalog.mainline, "origin/master");
        assert_eq!(cfg.catalog.oldest_branch, 10);
        assert_eq!(cfg.build.install, vec!["make", "install", "DESTDIR={dest}"]);
        assert_eq!(cfg.install_path(), PathBuf::from("/dev/shm/gcc-extract/usr/local"));
        Ok(())
    }

    #[test]
    fn test_overrides() -> anyhow::Result<()> {
        let text = format!("{}\narchiver = \"/opt/zstd\"\n\n[catalog]\nlatest_window = 50\nmainline = \"master\"\n\n[build]\nbuild = [\"sh\", \"{{src}}/build.sh\"]\njobs = 3\n", MINIMAL);
        let cfg = parse_config(Path::new("cfg.toml"), &text)?;
        assert_eq!(cfg.paths.archiver, PathBuf::from("/opt/zstd"));
        assert_eq!(cfg.catalog.latest_window, 50);
        assert_eq!(cfg.catalog.mainline, "master");
        assert_eq!(cfg.catalog.remote, "origin");
        assert_eq!(cfg.build.build, vec!["sh", "{src}/build.sh"]);
        assert_eq!(cfg.build.jobs(), 3);
        assert_eq!(cfg.build.install, vec!["make", "install", "DESTDIR={dest}"]);
        Ok(())
    }

    #[test]
    fn test_missing_keys() {
        match parse_config(Path::new("cfg.toml"), "[catalog]\nremote = \"upstream\"\n") {
            Err(ConfigError::MissingSection(_)) => {}
            other => panic!("unexpected {:?}", other)
        }
        let text = "[Default]\ngit_location = \"/src\"\nbinaries_location = \"/bin\"\n";
        match parse_config(Path::new("cfg.toml"), text) {
            Err(ConfigError::MissingKey(key, _)) => assert_eq!(key, "extract_location"),
            other => panic!("unexpected {:?}", other)
        }
        let err = parse_config(Path::new("cfg.toml"), text).unwrap_err();
        assert_eq!(err.to_string(), "Missing variable extract_location in config file: \"cfg.toml\"");
    }

    #[test]
    fn test_invalid_values() {
        let text = format!("{}\n[bisect]\ndisk_usage_threshold = 1.5\n", MINIMAL);
        assert!(matches!(parse_config(Path::new("c"), &text), Err(ConfigError::InvalidValue("disk_usage_threshold", _))));
        let text = format!("{}\n[catalog]\noldest_release = \"banana\"\n", MINIMAL);
        assert!(matches!(parse_config(Path::new("c"), &text), Err(ConfigError::InvalidValue("oldest_release", _))));
        assert!(matches!(parse_config(Path::new("c"), "not toml ["), Err(ConfigError::Malformed(_, _))));
    }
}
