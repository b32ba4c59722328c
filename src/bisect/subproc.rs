/// This module provides the single primitive used to run external tools: git,
/// the project's build system, the archiver, strip, and the user's test
/// command.  Each sub-process operation is specified as the command to run,
/// its argument list, an explicit environment overlay, the directory to run
/// from, and an optional timeout.
///
/// Arguments are never concatenated into a shell string; callers that want a
/// shell (the bisection test command) ask for `sh -c` explicitly.
///
/// Output is always captured.  Standard output and standard error can either
/// be kept apart (build steps, where only the `error:` lines of stderr are
/// interesting) or merged into a single stream in the order the child wrote
/// them (test commands, where crash signatures may land on either stream).
///
/// A command with a timeout runs in its own process group, and on timeout the
/// whole group is killed, since the command is usually a shell with its own
/// children holding the output pipes open.  Leaving the terminal's group
/// means a Ctrl-C no longer reaches it, so while such a child runs SIGINT and
/// SIGTERM are forwarded to its group before we die of them ourselves.
/// Commands without a timeout (builds, installs) stay in our group and are
/// interrupted together with us.

use std::collections::BTreeMap;
use std::env::current_dir;
use std::ffi::OsString;
use std::fmt;
use std::io::Read;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use nix::libc;
use nix::sys::signal::{killpg, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use os_pipe::{pipe, PipeReader};

const POLL_INTERVAL : Duration = Duration::from_millis(20);

/// Process group of the running timed child, or 0
static CHILD_GROUP : AtomicI32 = AtomicI32::new(0);
static FORWARDING : Once = Once::new();

extern "C" fn forward_signal(signum : libc::c_int) {
    let pgid = CHILD_GROUP.load(Ordering::SeqCst);
    // Only async-signal-safe calls in here
    unsafe {
        if pgid > 0 {
            libc::killpg(pgid, signum);
        }
        libc::signal(signum, libc::SIG_DFL);
        libc::raise(signum);
    }
}

fn install_forwarding() {
    FORWARDING.call_once(|| {
        let action = SigAction::new(SigHandler::Handler(forward_signal), SaFlags::empty(), SigSet::empty());
        for sig in [Signal::SIGINT, Signal::SIGTERM] {
            if let Err(e) = unsafe { sigaction(sig, &action) } {
                warn!("Cannot forward {:?} to timed commands: {}", sig, e);
            }
        }
    });
}

/// Registers a child's process group as the target of forwarded signals
/// until dropped
struct ForwardTo(i32);

impl ForwardTo {
    fn new(pgid : i32) -> ForwardTo {
        install_forwarding();
        CHILD_GROUP.store(pgid, Ordering::SeqCst);
        ForwardTo(pgid)
    }
}

impl Drop for ForwardTo {
    fn drop(&mut self) {
        let _ = CHILD_GROUP.compare_exchange(self.0, 0, Ordering::SeqCst, Ordering::SeqCst);
    }
}

#[derive(thiserror::Error,Debug)]
pub enum SubProcError {

    #[error("Error {2:?} running command {0:?} {1:?} in dir {3:?}\n{4:}")]
    ErrorRunningCmd(String, Vec<OsString>, Option<i32>, PathBuf, String),

    #[error("Error {2:?} setting up running command {0:?} {1:?} in dir {3:?}")]
    ErrorCmdSetup(String, Vec<OsString>, std::io::Error, PathBuf),

    #[error("Command {0:?} {1:?} timed out after {2:?}")]
    TimedOut(String, Vec<OsString>, Duration)
}

/// This structure represents a single command to run as a sub-process.  The
/// structure itself is public but the fields are private; the impl section
/// below defines the visible operations that can be performed on it.
#[derive(Clone)]
pub struct SubProcOperation {
    cmd : OsString,
    args : Vec<OsString>,
    env : BTreeMap<OsString, OsString>,
    in_dir : Option<PathBuf>,
    timeout : Option<Duration>,
    merge_output : bool,
}

impl fmt::Debug for SubProcOperation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SubProcOperation")
            .field("cmd", &self.cmd)
            .field("args", &self.args)
            .field("in_dir", &self.in_dir)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Everything we learned from running a sub-process
#[derive(Debug,Clone)]
pub struct SubProcOutput {
    /// Exit code; `None` if the process was killed by a signal (which includes
    /// our own kill on timeout)
    pub exit_code : Option<i32>,
    /// Signal that terminated the process, if any
    pub signal : Option<i32>,
    pub timed_out : bool,
    /// Standard output, or the combined output when streams were merged
    pub stdout : String,
    pub stderr : String,
    pub elapsed : Duration,
}

impl SubProcOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Lines of standard error that carry a compiler or build-system error
    /// message, joined with `;`
    pub fn error_lines(&self) -> String {
        self.stderr.lines()
            .filter(|l| l.contains("error:"))
            .map(|l| l.trim())
            .collect::<Vec<_>>()
            .join(";")
    }
}

impl SubProcOperation {

    /// Creates a new SubProcOperation that will execute the specified command
    pub fn new<T>(cmd : T) -> SubProcOperation
    where OsString: From<T>
    {
        SubProcOperation {
            cmd : OsString::from(cmd),
            args : Vec::new(),
            env : BTreeMap::new(),
            in_dir : None,
            timeout : None,
            merge_output : false,
        }
    }

    /// Creates an operation from an argument vector whose first element is the
    /// program.  Returns `None` for an empty vector.
    pub fn from_argv<T>(argv : &[T]) -> Option<SubProcOperation>
    where T: AsRef<std::ffi::OsStr>
    {
        let (cmd, rest) = argv.split_first()?;
        let mut op = SubProcOperation::new(cmd.as_ref());
        for arg in rest {
            op.push_arg(arg.as_ref());
        }
        Some(op)
    }

    /// Adds a command-line argument to use when executing the command.
    #[inline]
    pub fn push_arg<T>(&mut self, arg: T) -> &mut SubProcOperation
    where OsString: From<T>
    {
        self.args.push(OsString::from(arg));
        self
    }

    /// Sets an environment variable for the child, on top of the inherited
    /// environment.
    #[inline]
    pub fn set_env<K, V>(&mut self, key: K, value: V) -> &mut SubProcOperation
    where OsString: From<K> + From<V>
    {
        self.env.insert(OsString::from(key), OsString::from(value));
        self
    }

    /// Sets the directory from which the operation will be executed.
    #[inline]
    pub fn set_dir<T>(&mut self, in_dir: T) -> &mut SubProcOperation
    where T: AsRef<Path>
    {
        self.in_dir = Some(in_dir.as_ref().to_path_buf());
        self
    }

    #[inline]
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> &mut SubProcOperation
    {
        self.timeout = timeout;
        self
    }

    /// Send standard error into the same pipe as standard output
    #[inline]
    pub fn merge_output(&mut self) -> &mut SubProcOperation
    {
        self.merge_output = true;
        self
    }

    /// Replaces `pat` with `subs` in every argument.  This is how the
    /// `{src}`, `{dest}` and `{jobs}` placeholders of build recipes are filled
    /// in.
    pub fn replace_in_args(&mut self, pat: &str, subs: &OsString) -> &mut SubProcOperation
    {
        let args = std::mem::take(&mut self.args);
        self.args = args.iter().map(|arg| replace(pat, subs, arg)).collect();
        let cmd = std::mem::take(&mut self.cmd);
        self.cmd = replace(pat, subs, &cmd);
        self
    }

    /// A printable rendering of the command line, for logs
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.cmd.to_string_lossy().into_owned()];
        parts.extend(self.args.iter().map(|a| a.to_string_lossy().into_owned()));
        parts.join(" ")
    }

    /// Executes the command and fails unless it exits with status zero.
    pub fn execute_checked(&self) -> anyhow::Result<SubProcOutput>
    {
        let out = self.execute()?;
        if out.timed_out {
            return Err(anyhow::Error::new(
                SubProcError::TimedOut(self.cmd.to_string_lossy().into_owned(),
                                       self.args.clone(),
                                       out.elapsed)));
        }
        if !out.success() {
            let fromdir = self.in_dir.clone().unwrap_or(current_dir()?);
            return Err(anyhow::Error::new(
                SubProcError::ErrorRunningCmd(self.cmd.to_string_lossy().into_owned(),
                                              self.args.clone(),
                                              out.exit_code,
                                              fromdir,
                                              out.stderr)));
        }
        Ok(out)
    }

    /// Executes the command in a subprocess and captures everything about
    /// how it ended.  A non-zero exit is *not* an error here: callers that
    /// classify outcomes need the raw status.
    pub fn execute(&self) -> anyhow::Result<SubProcOutput>
    {
        let fromdir = self.in_dir.clone().unwrap_or(current_dir()?);
        debug!("Running {} (in {:?})", self.command_line(), fromdir);
        let start = Instant::now();

        let (out_reader, out_writer) = pipe()?;
        let err_reader;
        let mut child = {
            // The command holds our copies of the pipe write ends; it must be
            // dropped right after spawning or the readers never see EOF.
            let mut cmd = process::Command::new(&self.cmd);
            cmd.args(&self.args)
                .current_dir(&fromdir)
                .envs(&self.env)
                .stdin(process::Stdio::null());
            if self.timeout.is_some() {
                cmd.process_group(0);
            }
            if self.merge_output {
                cmd.stderr(out_writer.try_clone()?);
                err_reader = None;
            } else {
                let (rd, wr) = pipe()?;
                cmd.stderr(wr);
                err_reader = Some(rd);
            }
            cmd.stdout(out_writer);
            match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    return Err(anyhow::Error::new(
                        SubProcError::ErrorCmdSetup(self.cmd.to_string_lossy().into_owned(),
                                                    self.args.clone(), e,
                                                    fromdir.to_path_buf())))
                }
            }
        };

        let out_thread = thread::spawn(move || { read_stream(out_reader) });
        let err_thread = err_reader.map(|rd| thread::spawn(move || { read_stream(rd) }));

        let mut timed_out = false;
        let status = match self.timeout {
            None => child.wait()?,
            Some(limit) => {
                let _forward = ForwardTo::new(child.id() as i32);
                loop {
                    if let Some(st) = child.try_wait()? {
                        break st;
                    }
                    if start.elapsed() >= limit {
                        timed_out = true;
                        // The child leads its own group (process_group(0)
                        // above), so this reaches the shell's children too.
                        let _ = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
                        break child.wait()?;
                    }
                    thread::sleep(POLL_INTERVAL);
                }
            }
        };

        let stdout = out_thread.join().unwrap_or_default();
        let stderr = match err_thread {
            None => String::new(),
            Some(h) => h.join().unwrap_or_default(),
        };
        let elapsed = start.elapsed();
        debug!("Command {} finished with {:?} after {:?}", self.command_line(), status, elapsed);

        Ok(SubProcOutput {
            exit_code : status.code(),
            signal : status.signal(),
            timed_out,
            stdout,
            stderr,
            elapsed,
        })
    }
}

fn read_stream(mut rdr : PipeReader) -> String {
    let mut bytes = Vec::new();
    let _ = rdr.read_to_end(&mut bytes);
    String::from_utf8_lossy(&bytes).into_owned()
}

fn replace(pat : &str, subs : &OsString, inpstr : &OsString) -> OsString
{
    match subs.clone().into_string() {
        Ok(sub) => match inpstr.clone().into_string() {
            Ok(inps) => OsString::from(inps.replace(pat, &sub)),
            Err(orig) => orig
        }
        Err(_) => inpstr.clone()
    }
}
