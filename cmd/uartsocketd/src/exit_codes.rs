//! Just a list of all the exit codes in our process.
//!
//! A clean shutdown through the `X` command exits 0. Code 1 is shared by
//! argument parsing and the zero-read watchdog inside the bridge library,
//! which aborts the process directly.

pub const ARGUMENT_PARSING_FAILURE: i32 = 1;
pub const LOGGING_HANDLER_INSTALL_FAILURE: i32 = 2;
pub const SERVER_BIND_FAILURE: i32 = 3;
pub const SERVER_RUNTIME_FAILURE: i32 = 4;
