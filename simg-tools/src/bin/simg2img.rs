use std::process::ExitCode;

use clap::Parser;
use simg_tools::simg2img::{run, Opts};

fn main() -> ExitCode {
    simg_tools::init_logging();
    let opts = Opts::parse();
    simg_tools::exit(run(&opts))
}
