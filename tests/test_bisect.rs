use std::fs;
use std::path::Path;

use serial_test::serial;  // for tests whose probes depend on wall-clock timeouts
use tempfile::tempdir;

use gccbisect::bisect::build::{build_entrypoint, BuildOutcome, Builder, SkipReason};
use gccbisect::bisect::classify::{Prompt, Verdict};
use gccbisect::bisect::driver::{run_bisection, BisectError, BisectResult};
use gccbisect::bisect::options::{BisectOptions, BuildOptions};
use gccbisect::bisect::session::Session;
use gccbisect::bisect::status::{collect_garbage, RevisionStatus};

mod common;

use common::{FakeCommit, BUILD_OK};

const ICE : &str = "a.c:1:1: internal compiler error: Segmentation fault";

struct NoPrompt;

impl Prompt for NoPrompt {
    fn ask(&mut self, question : &str) -> anyhow::Result<String> {
        panic!("unexpected prompt: {}", question);
    }
}

struct Answer(&'static str);

impl Prompt for Answer {
    fn ask(&mut self, _question : &str) -> anyhow::Result<String> {
        Ok(self.0.to_owned())
    }
}

/// History A(fail) -> B(ok) -> C(ok) -> D(crash) -> E(crash)
fn crash_history(repo : &Path) -> anyhow::Result<Vec<String>> {
    common::make_history(repo, &[
        FakeCommit { build : "echo 'error: broken' >&2\nexit 1\n", output : "ok", exit_code : 0 },
        FakeCommit { build : BUILD_OK, output : "ok", exit_code : 0 },
        FakeCommit { build : BUILD_OK, output : "ok", exit_code : 0 },
        FakeCommit { build : BUILD_OK, output : ICE, exit_code : 1 },
        FakeCommit { build : BUILD_OK, output : ICE, exit_code : 1 },
    ])
}

fn bisect_opts(start : &str, end : &str) -> BisectOptions {
    BisectOptions { command : "gcc -c a.c".to_owned(),
                    bisect_start : Some(start.to_owned()),
                    bisect_end : Some(end.to_owned()),
                    only_latest : true,
                    silent : true,
                    ..BisectOptions::default() }
}

#[test_log::test]
fn test_build_and_bisect_ice() -> anyhow::Result<()> {
    let tdir = tempdir()?;
    let repo = tdir.path().join("src");
    let hashes = crash_history(&repo)?;
    let config = common::make_config(tdir.path(), &repo, common::SCRIPT_RECIPE)?;
    let session = Session::from_config(config);

    assert_eq!(build_entrypoint(&session, &BuildOptions::default(), false)?, 0);
    let failures = session.failures.entries()?;
    assert_eq!(failures, vec![(hashes[0].clone(), "error: broken".to_owned())]);
    assert!(!session.store.exists(&hashes[0]));
    for h in hashes[1..].iter() {
        assert!(session.store.exists(h), "no artifact for {}", h);
    }
    assert!(!session.config.paths.extract_location.exists());

    let catalog = session.catalog(false)?;
    assert_eq!(RevisionStatus::of(&session, &catalog.latest[4])?, RevisionStatus::BuildFailed);
    assert_eq!(RevisionStatus::of(&session, &catalog.latest[0])?, RevisionStatus::Ok);

    let opts = BisectOptions { ice : true, ..bisect_opts(&hashes[1][..10], &hashes[4]) };
    match run_bisection(&session, &catalog, &opts, Box::new(NoPrompt))? {
        BisectResult::Boundary { older, newer, between, skipped, bug_report } => {
            assert_eq!(older.hash, hashes[2]);
            assert_eq!(newer.hash, hashes[3]);
            assert_eq!(between, 0);
            assert!(skipped.is_empty());
            let report = bug_report.ok_or_else(|| anyhow::anyhow!("no bug report"))?;
            assert_eq!(report.summary, format!("ICE Segmentation fault since {}", hashes[3]));
            assert!(report.url.ends_with("&cc=dev@example.org"));
        }
        other => panic!("unexpected {:?}", other)
    }

    // The staging directory holds the last probed revision
    let staged = fs::read_to_string(session.config.install_path().join("bin/gcc"))?;
    assert!(staged.contains("echo"));
    Ok(())
}

#[test_log::test]
fn test_exit_code_bisection() -> anyhow::Result<()> {
    let tdir = tempdir()?;
    let repo = tdir.path().join("src");
    let hashes = crash_history(&repo)?;
    let config = common::make_config(tdir.path(), &repo, common::SCRIPT_RECIPE)?;
    let session = Session::from_config(config);
    build_entrypoint(&session, &BuildOptions::default(), false)?;
    let catalog = session.catalog(false)?;

    // Plain exit codes: B and C succeed, D and E fail
    match run_bisection(&session, &catalog, &bisect_opts(&hashes[1], &hashes[4]), Box::new(NoPrompt))? {
        BisectResult::Boundary { older, newer, .. } => {
            assert_eq!((older.hash, newer.hash), (hashes[2].clone(), hashes[3].clone()));
        }
        other => panic!("unexpected {:?}", other)
    }

    // No change between B and C
    match run_bisection(&session, &catalog, &bisect_opts(&hashes[1], &hashes[2]), Box::new(NoPrompt))? {
        BisectResult::NoChange(v) => assert_eq!(v, Verdict::Success),
        other => panic!("unexpected {:?}", other)
    }

    // A has no binaries, so it cannot start a range
    let err = run_bisection(&session, &catalog, &bisect_opts(&hashes[0], &hashes[4]), Box::new(NoPrompt)).unwrap_err();
    assert!(matches!(err.downcast_ref::<BisectError>(), Some(BisectError::NoArtifact(_))));

    let err = run_bisection(&session, &catalog, &bisect_opts(&hashes[3], &hashes[1]), Box::new(NoPrompt)).unwrap_err();
    assert!(matches!(err.downcast_ref::<BisectError>(), Some(BisectError::InvertedRange(_, _))));

    let empty = BisectOptions { command : " ".to_owned(), ..bisect_opts(&hashes[1], &hashes[4]) };
    let err = run_bisection(&session, &catalog, &empty, Box::new(NoPrompt)).unwrap_err();
    assert!(matches!(err.downcast_ref::<BisectError>(), Some(BisectError::MissingCommand)));

    // Without C's binaries the boundary can only be narrowed to B..D
    fs::remove_file(session.store.archive_path(&hashes[2]))?;
    match run_bisection(&session, &catalog, &bisect_opts(&hashes[1], &hashes[4]), Box::new(NoPrompt))? {
        BisectResult::Boundary { older, newer, between, skipped, .. } => {
            assert_eq!((older.hash, newer.hash), (hashes[1].clone(), hashes[3].clone()));
            assert_eq!(between, 1);
            assert!(skipped.is_empty());
        }
        other => panic!("unexpected {:?}", other)
    }
    Ok(())
}

#[test_log::test]
fn test_orientation_probes() -> anyhow::Result<()> {
    let tdir = tempdir()?;
    let repo = tdir.path().join("src");
    let crash = |name : &str| format!("{} {}", name, ICE);
    let (crash_d, crash_e, crash_12) = (crash("rev-D"), crash("rev-E"), crash("branch-12"));
    let hashes = common::make_history(&repo, &[
        FakeCommit { build : BUILD_OK, output : "rev-A ok", exit_code : 0 },
        FakeCommit { build : BUILD_OK, output : "rev-B ok", exit_code : 0 },
        FakeCommit { build : BUILD_OK, output : "rev-C ok", exit_code : 0 },
        FakeCommit { build : BUILD_OK, output : &crash_d, exit_code : 1 },
        FakeCommit { build : BUILD_OK, output : &crash_e, exit_code : 1 },
    ])?;
    // 12 got the bad change backported, 13 did not; mainline is branch 14
    common::make_branch(&repo, 12, &hashes[1], &FakeCommit { build : BUILD_OK, output : &crash_12, exit_code : 1 })?;
    common::make_branch(&repo, 13, &hashes[2], &FakeCommit { build : BUILD_OK, output : "branch-13 ok", exit_code : 0 })?;
    common::tag_release(&repo, "9.1.0", &hashes[0])?;
    common::tag_release(&repo, "11.1.0", &hashes[1])?;

    let config = common::make_config(tdir.path(), &repo, common::SCRIPT_RECIPE)?;
    let session = Session::from_config(config);
    build_entrypoint(&session, &BuildOptions::default(), false)?;
    let catalog = session.catalog(false)?;
    assert_eq!(catalog.branches.iter().map(|b| b.label.clone().unwrap_or_default()).collect::<Vec<_>>(),
               ["12", "13", "14"]);

    let probed = tdir.path().join("probed");
    let read_probed = || -> anyhow::Result<Vec<String>> {
        Ok(fs::read_to_string(&probed)?.lines().map(|l| l.split(' ').next().unwrap_or("").to_owned()).collect())
    };
    let opts = BisectOptions { command : format!("gcc | tee -a {}", probed.display()),
                               only_latest : false,
                               ice : true,
                               ..bisect_opts(&hashes[0], &hashes[4]) };
    match run_bisection(&session, &catalog, &opts, Box::new(NoPrompt))? {
        BisectResult::Boundary { older, newer, bug_report, .. } => {
            assert_eq!((older.hash, newer.hash), (hashes[2].clone(), hashes[3].clone()));
            let report = bug_report.ok_or_else(|| anyhow::anyhow!("no bug report"))?;
            assert_eq!(report.summary, format!("[12/14 Regression] ICE Segmentation fault since {}", hashes[3]));
        }
        other => panic!("unexpected {:?}", other)
    }
    // Releases older than the oldest branch are left out, then branches and
    // their bases, then the bisection itself
    assert_eq!(read_probed()?[..6], ["rev-B", "branch-12", "branch-13", "rev-E", "rev-B", "rev-C"]);
    assert_eq!(read_probed()?[6..8], ["rev-A", "rev-E"]);

    fs::remove_file(&probed)?;
    let old = BisectOptions { old : true, ..opts };
    run_bisection(&session, &catalog, &old, Box::new(NoPrompt))?;
    assert_eq!(read_probed()?[..3], ["rev-A", "rev-B", "branch-12"]);
    Ok(())
}

#[test_log::test]
fn test_warm_build_falls_back_to_clean() -> anyhow::Result<()> {
    let tdir = tempdir()?;
    let repo = tdir.path().join("src");
    let hashes = common::make_history(&repo, &[
        FakeCommit { build : BUILD_OK, output : "one", exit_code : 0 },
        FakeCommit { build : BUILD_OK, output : "two", exit_code : 0 },
    ])?;
    let counter = tdir.path().join("invocations");
    let recipe = format!(r#"
[build]
configure = ["sh", "-c", "echo configure >> {counter}"]
build = ["sh", "-c", "echo build >> {counter}; if [ -f stale ]; then echo 'error: stale objects' >&2; exit 1; fi"]
install = ["sh", "{{src}}/install.sh", "{{dest}}"]
"#, counter = counter.display());
    let config = common::make_config(tdir.path(), &repo, &recipe)?;
    let session = Session::from_config(config);
    let catalog = session.catalog(false)?;

    let mut builder = Builder::new(&session, false);
    assert!(matches!(builder.build(&catalog.latest[1])?, BuildOutcome::Built(_)));
    assert_eq!(fs::read_to_string(&counter)?, "configure\nbuild\n");

    // Poison the warm tree: the incremental build fails, a clean one works
    let build_dir = &session.config.paths.build_location;
    fs::write(build_dir.join("stale"), "")?;
    assert!(matches!(builder.build(&catalog.latest[0])?, BuildOutcome::Built(_)));
    assert_eq!(fs::read_to_string(&counter)?, "configure\nbuild\nbuild\nconfigure\nbuild\n");
    assert!(!build_dir.join("stale").exists());
    assert!(session.failures.entries()?.is_empty());
    assert!(session.store.exists(&hashes[0]));
    assert!(session.store.exists(&hashes[1]));
    Ok(())
}

#[serial]
#[test_log::test]
fn test_timeouts_are_reported() -> anyhow::Result<()> {
    let tdir = tempdir()?;
    let repo = tdir.path().join("src");
    let hashes = common::make_history(&repo, &[
        FakeCommit { build : BUILD_OK, output : "fast", exit_code : 0 },
        FakeCommit { build : BUILD_OK, output : "slow\"; sleep 30; echo \"", exit_code : 0 },
    ])?;
    let config = common::make_config(tdir.path(), &repo, common::SCRIPT_RECIPE)?;
    let session = Session::from_config(config);
    build_entrypoint(&session, &BuildOptions::default(), false)?;
    let catalog = session.catalog(false)?;

    let opts = BisectOptions { command : "gcc".to_owned(), timeout : Some(1.0), ..bisect_opts(&hashes[0], &hashes[1]) };
    match run_bisection(&session, &catalog, &opts, Box::new(NoPrompt))? {
        BisectResult::Boundary { older, newer, .. } => {
            assert_eq!((older.hash, newer.hash), (hashes[0].clone(), hashes[1].clone()));
        }
        other => panic!("unexpected {:?}", other)
    }
    Ok(())
}

#[test_log::test]
fn test_skip_on_failure() -> anyhow::Result<()> {
    let tdir = tempdir()?;
    let repo = tdir.path().join("src");
    let hashes = common::make_history(&repo, &[FakeCommit { build : BUILD_OK, output : "ok", exit_code : 0 }])?;
    let counter = tdir.path().join("invocations");
    let recipe = format!(r#"
[build]
configure = ["sh", "-c", "echo configure >> {counter}"]
build = ["sh", "-c", "echo build >> {counter}; echo 'error: no space left' >&2; exit 1"]
install = ["sh", "-c", "echo install >> {counter}"]
"#, counter = counter.display());
    let config = common::make_config(tdir.path(), &repo, &recipe)?;
    let session = Session::from_config(config);
    let catalog = session.catalog(false)?;
    let rev = &catalog.latest[0];
    assert_eq!(rev.hash, hashes[0]);

    let mut builder = Builder::new(&session, false);
    assert_eq!(builder.build(rev)?, BuildOutcome::Failed("error: no space left".to_owned()));
    assert_eq!(fs::read_to_string(&counter)?, "configure\nbuild\n");
    assert!(session.failures.contains(&rev.hash)?);
    assert!(!session.store.exists(&rev.hash));

    let mut builder = Builder::new(&session, false);
    assert_eq!(builder.build(rev)?, BuildOutcome::Skipped(SkipReason::PreviouslyFailed));
    assert_eq!(fs::read_to_string(&counter)?, "configure\nbuild\n");
    Ok(())
}

#[test_log::test]
fn test_preserve_and_gc() -> anyhow::Result<()> {
    let tdir = tempdir()?;
    let repo = tdir.path().join("src");
    let hashes = common::make_history(&repo, &[
        FakeCommit { build : BUILD_OK, output : "one", exit_code : 0 },
        FakeCommit { build : BUILD_OK, output : "two", exit_code : 0 },
        FakeCommit { build : BUILD_OK, output : "three", exit_code : 0 },
    ])?;
    let config = common::make_config(tdir.path(), &repo, common::SCRIPT_RECIPE)?;
    let session = Session::from_config(config);
    let catalog = session.catalog(false)?;

    let mut builder = Builder::new(&session, true);
    let oldest = &catalog.latest[2];
    assert!(matches!(builder.build(oldest)?, BuildOutcome::Built(_)));
    assert_eq!(gccbisect::bisect::store::staged_revision(&session.config.paths.extract_location).as_deref(),
               Some(hashes[0].as_str()));
    assert!(session.config.install_path().join("bin/gcc").is_file());
    assert_eq!(builder.build(oldest)?, BuildOutcome::Skipped(SkipReason::AlreadyStored));
    for rev in catalog.latest.iter() {
        builder.build(rev)?;
    }
    assert_eq!(session.store.list()?.len(), 3);

    // Shrink the window so the oldest commit is no longer tracked
    let mut config = session.config.clone();
    config.catalog.latest_window = 2;
    let session = Session::from_config(config);
    let catalog = session.catalog(false)?;
    let summary = collect_garbage(&session, &catalog, &mut Answer("no"))?;
    assert_eq!(summary.candidates, vec![hashes[0].clone()]);
    assert!(summary.removed.is_empty());
    let summary = collect_garbage(&session, &catalog, &mut Answer("yes"))?;
    assert_eq!(summary.removed, vec![hashes[0].clone()]);
    assert!(!session.store.exists(&hashes[0]));
    assert!(session.store.exists(&hashes[2]));
    Ok(())
}
