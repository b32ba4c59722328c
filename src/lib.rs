pub mod bisect;

use crate::bisect::build::build_entrypoint;
use crate::bisect::driver::{bisect_entrypoint, unpack_entrypoint};
use crate::bisect::options::{BisectCommand, Options};
use crate::bisect::session::Session;
use crate::bisect::status::{gc_entrypoint, print_entrypoint};

pub fn run_bisect(opt : Options) -> anyhow::Result<i32> {
    let session = Session::open(opt.config.as_deref())?;
    match opt.subcommand {
        BisectCommand::Bisect(bisect_opts) => { bisect_entrypoint(&session, &bisect_opts, opt.pull) }
        BisectCommand::Build(build_opts) => { build_entrypoint(&session, &build_opts, opt.pull) }
        BisectCommand::Gc => { gc_entrypoint(&session, opt.pull) }
        BisectCommand::Print => { print_entrypoint(&session, opt.pull) }
        BisectCommand::Unpack(unpack_opts) => { unpack_entrypoint(&session, &unpack_opts, opt.pull) }
    }
}
