//! The list of environment variables that influence behavior for
//! `uartsocketd`.

use once_cell::sync::Lazy;
use std::env::var as env_var;

/// Another way of configuring `uartsocketd` to output it's data in JSON.
///
/// Environment Variable Name: `UARTSOCKET_OUTPUT_JSON`
/// Expected Values: ("1" or "0"), and ("true" or "false")
/// Type: Boolean
pub static USE_JSON_OUTPUT: Lazy<bool> = Lazy::new(|| {
	env_var("UARTSOCKET_OUTPUT_JSON").map_or(false, |var| var == "1" || var == "true")
});

/// A way of specifying the address to listen on without positional
/// arguments, in `host:port` form.
///
/// Environment Variable Name: `UARTSOCKET_BIND`
/// Expected Values: Empty, or `host:port`
/// Type: String
pub static BIND_SPEC: Lazy<Option<String>> = Lazy::new(|| env_var("UARTSOCKET_BIND").ok());
