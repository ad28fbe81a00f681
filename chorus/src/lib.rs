pub mod control;
pub mod routing;
pub mod server;
pub mod socket;
pub mod state;
pub mod stream;
pub mod worker;

use std::path::PathBuf;

use structopt::StructOpt;

#[derive(StructOpt)]
pub struct Opt {
    /// Path of the listening control socket
    #[structopt(long, env = "CHORUS_SOCKET", default_value = "/run/chorus/chorus.sock")]
    pub socket: PathBuf,
}

#[derive(Debug)]
pub enum RunError {
    Listen(socket::ListenError),
}
