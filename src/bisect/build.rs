use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::bisect::classify::return_code;
use crate::bisect::options::BuildOptions;
use crate::bisect::revision::Revision;
use crate::bisect::session::Session;
use crate::bisect::store::{clear_dir, mark_staged};
use crate::bisect::subproc::{SubProcOperation, SubProcOutput};

#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum SkipReason {
    AlreadyStored,
    PreviouslyFailed
}

#[derive(Debug,Clone,PartialEq,Eq)]
pub enum BuildOutcome {
    Skipped(SkipReason),
    Built(Duration),
    /// The build failed and a failure record with this message was written
    Failed(String)
}

/// Render a duration as `H:MM:SS`
pub fn format_duration(d : Duration) -> String {
    let secs = d.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

fn failure_message(out : &SubProcOutput) -> String {
    let errors = out.error_lines();
    if errors.is_empty() {
        format!("exit status {}", return_code(out))
    } else {
        errors
    }
}

/// Drives the native build system for one revision at a time
pub struct Builder<'a> {
    session : &'a Session,
    preserve : bool,
    build_times : Vec<Duration>
}

impl<'a> Builder<'a> {
    pub fn new(session : &'a Session, preserve : bool) -> Builder<'a> {
        Builder { session, preserve, build_times : Vec::new() }
    }

    /// One step of the build recipe with its placeholders filled in, run from
    /// the build directory
    fn step(&self, argv : &[String]) -> anyhow::Result<SubProcOperation> {
        let config = &self.session.config;
        let mut op = SubProcOperation::from_argv(argv)
            .ok_or_else(|| anyhow::anyhow!("Empty build step in {:?}", config.source))?;
        op.replace_in_args("{src}", &OsString::from(config.paths.git_location.as_os_str()))
            .replace_in_args("{dest}", &OsString::from(config.paths.extract_location.as_os_str()))
            .replace_in_args("{jobs}", &OsString::from(config.build.jobs().to_string()))
            .set_dir(&config.paths.build_location);
        Ok(op)
    }

    fn apply_patches(&self) -> anyhow::Result<()> {
        let paths = &self.session.config.paths;
        for patch in self.session.config.build.patches.iter() {
            let mut op = SubProcOperation::new("patch");
            op.push_arg("-p1").push_arg("-i").push_arg(patch.as_os_str()).set_dir(&paths.git_location);
            let out = op.execute()?;
            println!("applying patch {} with result: {}", patch.display(), return_code(&out));
            if !out.success() {
                warn!("Patch {:?} did not apply cleanly: {}", patch, out.stdout.trim());
            }
        }
        Ok(())
    }

    fn disable_makeinfo(&self, build_dir : &Path) -> anyhow::Result<()> {
        let makefile = build_dir.join("Makefile");
        if self.session.config.build.disable_makeinfo && makefile.is_file() {
            let mut f = OpenOptions::new().append(true).open(&makefile)?;
            writeln!(f, "MAKEINFO = :")?;
        }
        Ok(())
    }

    /// Configure and compile the checked-out sources.  The warm build
    /// directory is tried first; the error message of the clean build is
    /// returned on failure.
    fn compile(&self) -> anyhow::Result<Result<(), String>> {
        let build_config = &self.session.config.build;
        let build_dir = &self.session.config.paths.build_location;
        if build_dir.is_dir() {
            let out = self.step(&build_config.build)?.execute()?;
            if out.success() {
                return Ok(Ok(()));
            }
            println!("Cannot build, clean-up and start again with clean build folder");
            debug!("Warm build failed: {}", failure_message(&out));
        }

        clear_dir(build_dir)?;
        let out = self.step(&build_config.configure)?.execute()?;
        if !out.success() {
            return Ok(Err(failure_message(&out)));
        }
        self.disable_makeinfo(build_dir)?;
        let out = self.step(&build_config.build)?.execute()?;
        if !out.success() {
            return Ok(Err(failure_message(&out)));
        }
        Ok(Ok(()))
    }

    /// Install into the staging directory and store the result, all under
    /// the store lock
    fn install(&self, rev : &Revision) -> anyhow::Result<Result<(), String>> {
        let session = self.session;
        let staging = &session.config.paths.extract_location;
        let guard = session.store.lock()?;
        clear_dir(staging)?;
        let out = self.step(&session.config.build.install)?.execute()?;
        if !out.success() {
            clear_dir(staging)?;
            return Ok(Err(failure_message(&out)));
        }
        session.store.store(&guard, &rev.hash, staging)?;
        if self.preserve {
            mark_staged(staging, &rev.hash)?;
        } else {
            fs::remove_dir_all(staging)?;
        }
        Ok(Ok(()))
    }

    /// Make sure `rev` has an artifact, building it if needed
    pub fn build(&mut self, rev : &Revision) -> anyhow::Result<BuildOutcome> {
        let session = self.session;
        if session.store.exists(&rev.hash) {
            info!("Revision {} already exists", rev);
            return Ok(BuildOutcome::Skipped(SkipReason::AlreadyStored));
        }
        if session.failures.contains(&rev.hash)? {
            info!("Revision {} already failed", rev);
            return Ok(BuildOutcome::Skipped(SkipReason::PreviouslyFailed));
        }

        println!("Building {}", rev);
        let start = Instant::now();
        session.history.checkout(&rev.hash)?;
        self.apply_patches()?;

        let result = match self.compile()? {
            Ok(()) => self.install(rev)?,
            Err(e) => Err(e)
        };
        match result {
            Err(message) => {
                println!("Build of {} failed: {}", rev, message);
                session.failures.append(&rev.hash, &message)?;
                Ok(BuildOutcome::Failed(message))
            }
            Ok(()) => {
                let took = start.elapsed();
                self.build_times.push(took);
                let avg = self.build_times.iter().sum::<Duration>() / self.build_times.len() as u32;
                println!("Build has taken: {}, avg: {}", format_duration(took), format_duration(avg));
                Ok(BuildOutcome::Built(took))
            }
        }
    }
}

/// Build every tracked revision that has neither an artifact nor a failure
/// record
pub fn build_entrypoint(session : &Session, opts : &BuildOptions, pull : bool) -> anyhow::Result<i32> {
    let catalog = session.catalog(pull)?;
    session.store.check_disk_usage(session.config.bisect.disk_usage_threshold)?;
    let mut builder = Builder::new(session, opts.preserve);
    let mut seen = BTreeSet::new();
    let (mut built, mut failed) = (0, 0);
    for rev in catalog.all() {
        if opts.limit.map_or(false, |l| built >= l) {
            info!("Reached the limit of {} builds", built);
            break;
        }
        if !seen.insert(rev.hash.as_str()) {
            continue;
        }
        match builder.build(rev)? {
            BuildOutcome::Built(_) => { built += 1 }
            BuildOutcome::Failed(_) => { failed += 1 }
            BuildOutcome::Skipped(_) => {}
        }
    }
    println!("Built {} revisions, {} failed", built, failed);
    Ok(0)
}
