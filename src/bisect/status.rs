use std::collections::BTreeSet;

use crate::bisect::catalog::Catalog;
use crate::bisect::classify::{Prompt, StdinPrompt};
use crate::bisect::revision::Revision;
use crate::bisect::session::Session;
use crate::bisect::store::GcSummary;

/// Whether binaries exist for a revision, for listings
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum RevisionStatus {
    Ok,
    Missing,
    BuildFailed
}

impl RevisionStatus {
    pub fn of(session : &Session, rev : &Revision) -> anyhow::Result<RevisionStatus> {
        if session.store.exists(&rev.hash) {
            Ok(RevisionStatus::Ok)
        } else if session.failures.contains(&rev.hash)? {
            Ok(RevisionStatus::BuildFailed)
        } else {
            Ok(RevisionStatus::Missing)
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RevisionStatus::Ok => "OK",
            RevisionStatus::Missing => "missing binary",
            RevisionStatus::BuildFailed => "build failed"
        }
    }
}

fn print_status(session : &Session, rev : &Revision) -> anyhow::Result<()> {
    println!("{}: {}", rev.description(None), RevisionStatus::of(session, rev)?.as_str());
    Ok(())
}

/// Size of a maintenance branch relative to mainline
#[derive(Debug,Clone,PartialEq,Eq)]
pub struct BranchInfo {
    /// Commits on the branch since it left mainline
    pub branch_commits : usize,
    /// Mainline commits since the branch point
    pub head_distance : usize,
    /// How many of those mainline commits have binaries
    pub have : usize
}

pub fn branch_info(session : &Session, branch : &Revision, built : &BTreeSet<&str>) -> anyhow::Result<BranchInfo> {
    let history = session.history.as_ref();
    let mainline = &session.config.catalog.mainline;
    let base = history.merge_base(mainline, &branch.hash)?;
    let branch_commits = history.rev_list(&base, &branch.hash)?;
    let head_commits = history.rev_list(&base, mainline)?;
    Ok(BranchInfo { branch_commits : branch_commits.len(),
                    head_distance : head_commits.len(),
                    have : head_commits.iter().filter(|h| built.contains(h.as_str())).count() })
}

pub fn print_catalog(session : &Session, catalog : &Catalog) -> anyhow::Result<()> {
    println!("Releases");
    for r in catalog.releases.iter() {
        print_status(session, r)?;
    }

    let built : BTreeSet<&str> = catalog.latest.iter()
        .filter(|r| session.store.exists(&r.hash))
        .map(|r| r.hash.as_str())
        .collect();
    println!("\nActive branches");
    for r in catalog.branches.iter() {
        let info = branch_info(session, r, &built)?;
        println!("{:>3}-branch: branch commits: {:8}, head distance: {:8} (have: {})",
                 r.label.as_deref().unwrap_or(""), info.branch_commits, info.head_distance, info.have);
        print_status(session, r)?;
    }

    println!("\nActive branch bases");
    for r in catalog.branch_bases.iter() {
        print_status(session, r)?;
    }

    println!("\nLatest {} revisions (have: {}, missing: {}):",
             catalog.latest.len(), built.len(), catalog.latest.len() - built.len());
    for r in catalog.latest.iter() {
        print_status(session, r)?;
    }
    Ok(())
}

pub fn print_entrypoint(session : &Session, pull : bool) -> anyhow::Result<i32> {
    let catalog = session.catalog(pull)?;
    print_catalog(session, &catalog)?;
    Ok(0)
}

/// Remove every artifact the catalog no longer tracks, once the operator
/// answers `yes`
pub fn collect_garbage(session : &Session, catalog : &Catalog, prompt : &mut dyn Prompt) -> anyhow::Result<GcSummary> {
    let keep = catalog.keep_set();
    let summary = session.store.garbage_collect(&keep, |candidates| {
        println!("Builds found: {}, can be removed: {}", keep.len(), candidates.len());
        Ok(prompt.ask("Do you want to remove it (yes/no)?")? == "yes")
    })?;
    for hash in summary.removed.iter() {
        println!("Removed {}", session.store.archive_path(hash).display());
    }
    Ok(summary)
}

pub fn gc_entrypoint(session : &Session, pull : bool) -> anyhow::Result<i32> {
    let catalog = session.catalog(pull)?;
    collect_garbage(session, &catalog, &mut StdinPrompt)?;
    Ok(0)
}
