#![doc = include_str!("../README.md")]

use miette::{miette, IntoDiagnostic, Result};
use once_cell::sync::Lazy;
use std::{env::var as env_var, sync::Mutex};
use tracing::debug;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
	fmt::layer as tracing_fmt_layer, prelude::*, registry as subscriber_registry, EnvFilter,
};

/// Check if we have actually initialized logging before.
static HAS_INITIALIZED_LOGGING: Lazy<Mutex<bool>> = Lazy::new(|| Mutex::new(false));

/// Install all the logging configuration needed for an application.
///
/// This should only ever be called as the very first part of `main`, and
/// nowhere else. If you try to call it elsewhere, you'll just get an error.
///
/// Filtering is controlled by the `UARTSOCKET_LOGGING` environment
/// variable, or the standard `RUST_LOG` when that isn't set, defaulting
/// to `info`.
///
/// See the tracing docs for logging for more information:
/// <https://docs.rs/tracing/latest/tracing/#shorthand-macros>
///
/// # Errors
///
/// If we fail to install all of the logging handlers.
pub fn install_logging_handlers(use_json: bool) -> Result<()> {
	{
		let mut locked_init = HAS_INITIALIZED_LOGGING
			.lock()
			.expect("Intall logging handlers called with poisioned mutex?");
		if *locked_init {
			return Err(miette!("Logging has already been initialized!"));
		}
		*locked_init = true;
	}
	let explicit_level = env_var("UARTSOCKET_LOGGING").ok();

	let filter_layer = EnvFilter::try_from_default_env().or_else(|_| {
		EnvFilter::try_new(if let Some(el) = explicit_level {
			el
		} else {
			"info".to_owned()
		})
		.into_diagnostic()
	})?;
	let registry = subscriber_registry().with(filter_layer);

	if use_json {
		registry
			.with(tracing_fmt_layer().with_target(true).json())
			.with(ErrorLayer::default())
			.init();
	} else {
		registry
			.with(tracing_fmt_layer().with_target(true))
			.with(ErrorLayer::default())
			.init();
	}

	debug!(json = use_json, "logging-initialized");
	Ok(())
}

#[cfg(test)]
mod unit_tests {
	use super::*;

	#[test]
	pub fn cant_install_twice() {
		assert!(
			install_logging_handlers(true).is_ok(),
			"Failed to perform initial install of logging handlers, this should ALWAYS succeed.",
		);
		assert!(
			install_logging_handlers(false).is_err(),
			"Second call to install of logging handlers somehow failed?",
		);
		assert!(
			install_logging_handlers(true).is_err(),
			"Third call to install of logging handlers somehow failed?",
		);
	}
}
