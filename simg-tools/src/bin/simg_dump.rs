use clap::Parser;
use simg_tools::dump::{run, Opts};

fn main() -> anyhow::Result<()> {
    simg_tools::init_logging();
    let opts = Opts::parse();
    run(&opts)
}
