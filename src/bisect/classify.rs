use std::io::{BufRead, Write};
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;

use crate::bisect::subproc::SubProcOutput;

/// Substrings that identify a compiler crash in tool output
pub const ICE_SIGNATURES : &[&str] = &[
    "internal compiler error",
    "Fatal Error",
    "Internal compiler error",
    "Please submit a full bug report",
    "lto-wrapper: fatal error",
    "Internal Error at ",
];

lazy_static! {
    static ref ICE_DETAILS : Regex = Regex::new(r".*internal compiler error: (?P<details>.*)").unwrap();
}

/// Outcome of running the test command against one revision
#[derive(Debug,Clone,Copy,PartialEq,Eq,Hash)]
pub enum Verdict {
    Success,
    Failure,
    /// The command did not finish within the hard timeout
    Timeout
}

/// How a finished test command is turned into a verdict
#[derive(Debug,Clone,Default)]
pub struct Classifier {
    /// Flip success and failure (not timeouts)
    pub negate : bool,
    /// Success means the output shows a compiler crash
    pub ice : bool,
    /// Let the operator decide whenever the exit code says success
    pub ask : bool,
    /// A success slower than this is a failure
    pub soft_timeout : Option<Duration>,
    pub success_exit_code : i32
}

/// Where interactive answers come from
pub trait Prompt {
    fn ask(&mut self, question : &str) -> anyhow::Result<String>;
}

pub struct StdinPrompt;

impl Prompt for StdinPrompt {
    fn ask(&mut self, question : &str) -> anyhow::Result<String> {
        print!("{}", question);
        std::io::stdout().flush()?;
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        Ok(line.trim().to_owned())
    }
}

pub fn contains_ice(output : &str) -> bool {
    ICE_SIGNATURES.iter().any(|m| output.contains(m))
}

/// The text following `internal compiler error: ` on the first line that has it
pub fn ice_details(output : &str) -> Option<String> {
    output.lines()
        .find_map(|l| ICE_DETAILS.captures(l))
        .map(|c| c["details"].to_owned())
}

/// The exit status in the shell's convention: negative signal numbers for
/// killed processes
pub fn return_code(out : &SubProcOutput) -> i32 {
    out.exit_code.or(out.signal.map(|s| -s)).unwrap_or(-1)
}

impl Classifier {
    pub fn classify(&self, out : &SubProcOutput, prompt : &mut dyn Prompt) -> anyhow::Result<Verdict> {
        if out.timed_out {
            return Ok(Verdict::Timeout);
        }
        let mut success = return_code(out) == self.success_exit_code;
        if success && self.ask {
            success = prompt.ask("Retcode: ")? == "0";
        } else if self.ice {
            success = contains_ice(&out.stdout);
        }
        if let Some(limit) = self.soft_timeout {
            if success && out.elapsed > limit {
                success = false;
            }
        }
        if self.negate {
            success = !success;
        }
        Ok(if success { Verdict::Success } else { Verdict::Failure })
    }

    /// Result column of a probe line
    pub fn describe(verdict : Verdict, out : &SubProcOutput) -> String {
        match verdict {
            Verdict::Success => "OK".to_owned(),
            Verdict::Failure => format!("FAILED ({})", return_code(out)),
            Verdict::Timeout => "TIMEOUT".to_owned()
        }
    }
}
