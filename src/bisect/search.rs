//! Binary search for the first change of verdict over an ordered candidate
//! list.  The search only sees indices; staging binaries and running the test
//! command live behind the `Probe` trait.
//!
//! The verdict is assumed to be monotonic along the list.  When it is not,
//! the reported boundary is still a pair of adjacent tested candidates with
//! different verdicts, just not necessarily the only one.

use std::collections::BTreeSet;

use log::debug;

use crate::bisect::classify::Verdict;

#[derive(thiserror::Error,Debug)]
pub enum SearchError {
    #[error("At least two candidates are needed to bisect (got {0})")]
    TooFewCandidates(usize),
    #[error("Candidate {0} at the end of the range cannot be tested")]
    InconclusiveEndpoint(usize)
}

pub trait Probe {
    /// Test candidate `idx`.  `None` means the candidate cannot be tested
    /// (e.g. its binaries are missing).
    fn probe(&mut self, idx : usize) -> anyhow::Result<Option<Verdict>>;

    /// Called whenever the open range shrinks, with its new size
    fn narrowed(&mut self, _remaining : usize) {}
}

#[derive(Debug,Clone,PartialEq,Eq)]
pub enum SearchOutcome {
    /// Both ends of the range agree
    NoChange { verdict : Verdict, probes : usize },
    /// `older` and `newer` disagree and every candidate strictly between them
    /// is in `skipped`
    Boundary { older : usize, newer : usize, skipped : Vec<usize>, probes : usize }
}

/// The untested index strictly inside `(lo, hi)` closest to the midpoint
fn next_interior(lo : usize, hi : usize, inconclusive : &BTreeSet<usize>) -> Option<usize> {
    let mid = lo + (hi - lo + 1) / 2;
    (lo + 1..hi)
        .filter(|i| !inconclusive.contains(i))
        .min_by_key(|i| (if *i > mid { i - mid } else { mid - i }, *i))
}

pub fn bisect(len : usize, probe : &mut dyn Probe) -> anyhow::Result<SearchOutcome> {
    if len < 2 {
        return Err(anyhow::Error::new(SearchError::TooFewCandidates(len)));
    }
    let mut probes = 0;
    let mut endpoint = |idx : usize, probes : &mut usize| -> anyhow::Result<Verdict> {
        *probes += 1;
        probe.probe(idx)?.ok_or_else(|| anyhow::Error::new(SearchError::InconclusiveEndpoint(idx)))
    };
    let mut lo = 0;
    let mut hi = len - 1;
    let v_lo = endpoint(lo, &mut probes)?;
    let v_hi = endpoint(hi, &mut probes)?;
    if v_lo == v_hi {
        return Ok(SearchOutcome::NoChange { verdict : v_lo, probes });
    }

    let mut inconclusive = BTreeSet::new();
    let mut reported = None;
    while let Some(mid) = next_interior(lo, hi, &inconclusive) {
        if reported != Some(hi - lo) {
            reported = Some(hi - lo);
            probe.narrowed(hi - lo + 1);
        }
        probes += 1;
        match probe.probe(mid)? {
            None => {
                debug!("Candidate {} is inconclusive, trying a neighbour", mid);
                inconclusive.insert(mid);
            }
            Some(v) if v == v_lo => { lo = mid }
            Some(_) => { hi = mid }
        }
    }

    let skipped = inconclusive.into_iter().filter(|i| *i > lo && *i < hi).collect();
    Ok(SearchOutcome::Boundary { older : lo, newer : hi, skipped, probes })
}
