use std::process::ExitCode;

use structopt::StructOpt;

use chorus::{server, Opt};

fn main() -> Result<(), ExitCode> {
    env_logger::init();

    let opt = Opt::from_args();

    server::run(opt).map_err(|err| {
        eprintln!("error: {err:?}");
        ExitCode::FAILURE
    })
}
