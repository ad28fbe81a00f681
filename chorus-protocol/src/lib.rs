pub mod audio;
pub mod msg;
pub mod types;

/// Rev when the control message format changes.
pub const PROTO_VERSION: u32 = 0;

/// Upper bound on a single control message, header included.
pub const MAX_CTL_MSG_SIZE: usize = 256;
