use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::Write;
use std::time::Duration;

use log::{debug, info};

use crate::bisect::catalog::Catalog;
use crate::bisect::classify::{ice_details, Classifier, Prompt, StdinPrompt, Verdict};
use crate::bisect::options::{BisectOptions, UnpackOptions};
use crate::bisect::revision::Revision;
use crate::bisect::search::{bisect, Probe, SearchOutcome};
use crate::bisect::session::Session;
use crate::bisect::subproc::{SubProcOperation, SubProcOutput};

#[derive(thiserror::Error,Debug)]
pub enum BisectError {
    #[error("Missing command for bisection!")]
    MissingCommand,
    #[error("Revision '{0}' has no stored binaries")]
    NoArtifact(String),
    #[error("Bisection start {0} is newer than bisection end {1}")]
    InvertedRange(String, String),
    #[error("Invalid {0}: {1}")]
    InvalidTimeout(&'static str, f64)
}

/// What one run of the test command against one revision produced
#[derive(Debug,Clone)]
pub struct ProbeResult {
    pub verdict : Verdict,
    pub output : SubProcOutput
}

/// Runs the test command against staged binaries
pub struct Tester<'a> {
    session : &'a Session,
    classifier : Classifier,
    command : String,
    timeout : Option<Duration>,
    silent : bool,
    prompt : Box<dyn Prompt + 'a>
}

fn seconds(what : &'static str, value : Option<f64>) -> Result<Option<Duration>, BisectError> {
    match value {
        None => Ok(None),
        Some(s) => Duration::try_from_secs_f64(s).map(Some).map_err(|_| BisectError::InvalidTimeout(what, s))
    }
}

fn echo(text : &str) {
    print!("{}", text);
    let _ = std::io::stdout().flush();
}

impl<'a> Tester<'a> {
    pub fn new(session : &'a Session, opts : &BisectOptions, prompt : Box<dyn Prompt + 'a>) -> Result<Tester<'a>, BisectError> {
        if opts.command.trim().is_empty() {
            return Err(BisectError::MissingCommand);
        }
        let classifier = Classifier { negate : opts.negate,
                                      ice : opts.ice,
                                      ask : opts.ask,
                                      soft_timeout : seconds("soft timeout", opts.soft_timeout)?,
                                      success_exit_code : opts.success_exit_code };
        Ok(Tester { session,
                    classifier,
                    command : opts.command.clone(),
                    timeout : seconds("timeout", opts.timeout)?,
                    silent : opts.silent,
                    prompt })
    }

    fn command_op(&self) -> SubProcOperation {
        let config = &self.session.config;
        let install = config.install_path();
        let prepend = |dir : std::path::PathBuf, var : &str| {
            let mut value = OsString::from(dir.as_os_str());
            value.push(":");
            value.push(std::env::var_os(var).unwrap_or_default());
            value
        };
        let mut op = SubProcOperation::new("sh");
        op.push_arg("-c").push_arg(self.command.as_str())
            .set_env("PATH", prepend(install.join("bin"), "PATH"))
            .set_env("LD_LIBRARY_PATH", prepend(install.join(&config.bisect.library_dir), "LD_LIBRARY_PATH"))
            .set_timeout(self.timeout)
            .merge_output();
        op
    }

    /// Stage `rev` and run the test command against it.  `None` when the
    /// revision has no binaries.  The store lock is held until the command
    /// has finished.
    pub fn test(&mut self, rev : &Revision) -> anyhow::Result<Option<ProbeResult>> {
        let store = &self.session.store;
        if !store.exists(&rev.hash) {
            println!("  {}: missing binary", rev.description(None));
            return Ok(None);
        }
        let guard = store.lock()?;
        store.extract(&guard, &rev.hash, &self.session.config.paths.extract_location)?;
        let output = self.command_op().execute()?;

        let mut echoed = false;
        if self.classifier.ask && !self.silent && !output.timed_out {
            echo(&output.stdout);
            echoed = true;
        }
        let verdict = self.classifier.classify(&output, self.prompt.as_mut())?;
        drop(guard);

        println!("  {}: [took: {:.2} s] result: {}",
                 rev.description(None),
                 output.elapsed.as_secs_f64(),
                 Classifier::describe(verdict, &output));
        if !self.silent && !echoed {
            echo(&output.stdout);
        }
        Ok(Some(ProbeResult { verdict, output }))
    }
}

/// Adapts the tester to the search, remembering every result
struct CandidateProbe<'t, 'a> {
    tester : &'t mut Tester<'a>,
    candidates : &'t [Revision],
    results : BTreeMap<usize, ProbeResult>
}

impl<'t, 'a> Probe for CandidateProbe<'t, 'a> {
    fn probe(&mut self, idx : usize) -> anyhow::Result<Option<Verdict>> {
        let result = self.tester.test(&self.candidates[idx])?;
        let verdict = result.as_ref().map(|r| r.verdict);
        if let Some(r) = result {
            self.results.insert(idx, r);
        }
        Ok(verdict)
    }

    fn narrowed(&mut self, remaining : usize) {
        let steps = (remaining as f64).log2().ceil() as usize;
        println!("  bisecting: {} revisions (~{} steps)", remaining, steps.saturating_sub(1));
    }
}

/// Percent-encode everything except unreserved characters and `/`
pub fn url_quote(text : &str) -> String {
    let mut out = String::with_capacity(text.len());
    for b in text.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'.' | b'-' | b'~' | b'/' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b))
        }
    }
    out
}

/// A pre-filled bug report for a compiler crash
#[derive(Debug,Clone,PartialEq,Eq)]
pub struct BugReport {
    pub summary : String,
    pub url : String
}

/// Build a bug report from the output of the first crashing revision.
/// Failing branches are named in the summary only when some, but not all,
/// active branches fail.
pub fn bug_report(tracker_url : &str,
                  output : &str,
                  failing_branches : Option<&[String]>,
                  branch_count : usize,
                  since : &str,
                  author : &str) -> Option<BugReport> {
    if tracker_url.is_empty() {
        return None;
    }
    let details = ice_details(output)?;
    let prefix = match failing_branches {
        Some(f) if !f.is_empty() && f.len() != branch_count => format!("[{} Regression] ", f.join("/")),
        _ => String::new()
    };
    let summary = format!("{}ICE {} since {}", prefix, details, since);
    let url = format!("{}&short_desc={}&cc={}", tracker_url, url_quote(&summary), author);
    Some(BugReport { summary, url })
}

#[derive(Debug,Clone)]
pub enum BisectResult {
    NoChange(Verdict),
    Boundary {
        older : Revision,
        newer : Revision,
        /// Mainline revisions strictly between the two that have no
        /// binaries, so the boundary cannot be narrowed further
        between : usize,
        /// Candidates inside the boundary that could not be tested
        skipped : Vec<Revision>,
        bug_report : Option<BugReport>
    }
}

/// The latest window in chronological order, restricted to revisions with
/// binaries and to the inclusive start/end range
pub fn candidate_list(session : &Session, catalog : &Catalog, opts : &BisectOptions) -> anyhow::Result<Vec<Revision>> {
    let candidates : Vec<Revision> = catalog.latest.iter().rev()
        .filter(|r| session.store.exists(&r.hash))
        .cloned()
        .collect();
    let position = |name : &str| -> anyhow::Result<usize> {
        let rev = catalog.find(name, &catalog.latest)?;
        candidates.iter().position(|c| c.hash == rev.hash)
            .ok_or_else(|| anyhow::Error::new(BisectError::NoArtifact(name.to_owned())))
    };
    let start = match &opts.bisect_start {
        Some(name) => position(name)?,
        None => 0
    };
    let end = match &opts.bisect_end {
        Some(name) => position(name)?,
        None => candidates.len().saturating_sub(1)
    };
    if candidates.is_empty() {
        return Ok(candidates);
    }
    if start > end {
        return Err(anyhow::Error::new(BisectError::InvertedRange(candidates[start].hash.clone(),
                                                                 candidates[end].hash.clone())));
    }
    Ok(candidates[start..=end].to_vec())
}

fn print_boundary_side(session : &Session, rev : &Revision, result : Option<&ProbeResult>, silent : bool) -> anyhow::Result<()> {
    let full_name = session.history.describe(&rev.hash);
    match result {
        Some(r) => {
            println!("  {}: [took: {:.2} s] result: {}",
                     rev.description(full_name.as_deref()),
                     r.output.elapsed.as_secs_f64(),
                     Classifier::describe(r.verdict, &r.output));
            if !silent {
                echo(&r.output.stdout);
            }
        }
        None => println!("  {}", rev.description(full_name.as_deref()))
    }
    println!("{}", session.history.message(&rev.hash)?);
    Ok(())
}

/// Probe releases, branches and branch bases for orientation, then bisect the
/// latest window
pub fn run_bisection(session : &Session, catalog : &Catalog, opts : &BisectOptions, prompt : Box<dyn Prompt + '_>) -> anyhow::Result<BisectResult> {
    let mut tester = Tester::new(session, opts, prompt)?;
    let mut failing_branches = None;
    if !opts.only_latest {
        println!("Releases");
        for r in catalog.releases.iter() {
            let major = r.version.as_ref().map_or(0, |v| v.major);
            if opts.old || major >= session.config.catalog.oldest_branch as u64 {
                tester.test(r)?;
            }
        }

        println!("\nActive branches");
        let mut failing = Vec::new();
        for r in catalog.branches.iter() {
            let passed = matches!(tester.test(r)?, Some(ProbeResult { verdict : Verdict::Success, .. }));
            if passed == opts.ice {
                failing.push(r.label.clone().unwrap_or_else(|| r.short_hash().to_owned()));
            }
        }
        failing_branches = Some(failing);

        println!("\nActive branch bases");
        for r in catalog.branch_bases.iter() {
            tester.test(r)?;
        }
    }

    println!("\nBisecting latest revisions");
    let candidates = candidate_list(session, catalog, opts)?;
    info!("{} candidates with binaries", candidates.len());
    let mut probe = CandidateProbe { tester : &mut tester, candidates : &candidates, results : BTreeMap::new() };
    let outcome = bisect(candidates.len(), &mut probe)?;
    let results = probe.results;
    match outcome {
        SearchOutcome::NoChange { verdict, probes } => {
            debug!("No change after {} probes", probes);
            println!("  bisect finished: there is no change!");
            Ok(BisectResult::NoChange(verdict))
        }
        SearchOutcome::Boundary { older, newer, skipped, probes } => {
            debug!("Boundary found after {} probes", probes);
            let (older_rev, newer_rev) = (&candidates[older], &candidates[newer]);
            println!("\nFirst change is ({}):", newer_rev.short_hash());
            print_boundary_side(session, newer_rev, results.get(&newer), opts.silent)?;
            print_boundary_side(session, older_rev, results.get(&older), opts.silent)?;

            let between = session.history.rev_list(&older_rev.hash, &newer_rev.hash)?
                .iter()
                .filter(|h| **h != newer_rev.hash && !session.store.exists(h))
                .count();
            if between > 0 {
                println!("Revisions in between without binaries: {}", between);
            }
            let skipped : Vec<Revision> = skipped.iter().map(|i| candidates[*i].clone()).collect();
            for r in skipped.iter() {
                println!("Untestable candidate in range: {}", r.description(None));
            }

            let newer_output = results.get(&newer).map(|r| r.output.stdout.as_str()).unwrap_or("");
            let since = session.history.describe(&newer_rev.hash).unwrap_or_else(|| newer_rev.hash.clone());
            let report = bug_report(&session.config.bisect.bug_tracker_url,
                                    newer_output,
                                    failing_branches.as_deref(),
                                    catalog.branches.len(),
                                    &since,
                                    &newer_rev.author);
            if let Some(b) = &report {
                println!("Bugzilla: {}\n  {}", b.summary, b.url);
            }
            Ok(BisectResult::Boundary { older : older_rev.clone(),
                                        newer : newer_rev.clone(),
                                        between,
                                        skipped,
                                        bug_report : report })
        }
    }
}

pub fn bisect_entrypoint(session : &Session, opts : &BisectOptions, pull : bool) -> anyhow::Result<i32> {
    if opts.command.trim().is_empty() {
        return Err(anyhow::Error::new(BisectError::MissingCommand));
    }
    let catalog = session.catalog(pull)?;
    session.store.check_disk_usage(session.config.bisect.disk_usage_threshold)?;
    run_bisection(session, &catalog, opts, Box::new(StdinPrompt))?;
    Ok(0)
}

/// Stage one revision's binaries for manual use
pub fn unpack_entrypoint(session : &Session, opts : &UnpackOptions, pull : bool) -> anyhow::Result<i32> {
    let catalog = session.catalog(pull)?;
    let pool : Vec<Revision> = catalog.latest.iter()
        .chain(catalog.branches.iter())
        .chain(catalog.branch_bases.iter())
        .chain(catalog.releases.iter())
        .cloned()
        .collect();
    let rev = catalog.find(&opts.revision, &pool)?;
    let guard = session.store.lock()?;
    session.store.extract(&guard, &rev.hash, &session.config.paths.extract_location)?;
    println!("Revision extracted to: {}", session.config.install_path().join("bin").display());
    Ok(0)
}
