use clap::Parser;

use gccbisect::bisect::options::Options;

fn main() {
    let opt = Options::parse();
    let level = match opt.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug
    };
    env_logger::Builder::new().filter_level(level).parse_default_env().init();

    match gccbisect::run_bisect(opt) {
        Ok(ec) => std::process::exit(ec),
        Err(e) => {
            eprintln!("gcc-bisect: {:#}", e);
            std::process::exit(1);
        }
    }
}
