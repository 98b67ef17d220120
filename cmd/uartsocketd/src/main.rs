#![allow(
	// I've always disliked this rule, most of the time imports are used WITHOUT
	// the module name, and the module name is only used in the top level import.
	//
	// Where this becomes significantly more helpful to read as it's out of
	// context.
	clippy::module_name_repetitions,
)]

pub mod exit_codes;
pub mod knobs;

use crate::{
	exit_codes::{
		ARGUMENT_PARSING_FAILURE, LOGGING_HANDLER_INSTALL_FAILURE, SERVER_BIND_FAILURE,
		SERVER_RUNTIME_FAILURE,
	},
	knobs::{cli::CliArguments, env::USE_JSON_OUTPUT, resolve_bind, resolve_tuning},
};
use clap::Parser;
use log::install_logging_handlers;
use miette::miette;
use tracing::error;
use uartsocket::Server;

fn main() {
	let (argv, use_json) = bootstrap_cli();
	let (host, port) = resolve_bind(&argv);
	let tuning = resolve_tuning(&argv);

	let bound = match Server::new(tuning).bind(&host, port) {
		Ok(bound) => bound,
		Err(cause) => {
			if use_json {
				error!(
					id = "uartsocketd::bind_failure",
					?cause,
					host = %host,
					port = port,
					"failed to bind the control listener",
				);
			} else {
				error!(
					"\n{:?}",
					miette!(
						help = "Is another instance (or another program) already listening there?",
						"Failed to bind the control listener on {host}:{port}!",
					)
					.wrap_err(cause),
				);
			}
			std::process::exit(SERVER_BIND_FAILURE);
		}
	};

	// Blocks until a control channel issues the broadcast shutdown command.
	if let Err(cause) = bound.serve() {
		if use_json {
			error!(
				id = "uartsocketd::accept_failure",
				?cause,
				"server accept loop failed",
			);
		} else {
			error!(
				"\n{:?}",
				miette!("The server accept loop failed!").wrap_err(cause),
			);
		}
		std::process::exit(SERVER_RUNTIME_FAILURE);
	}
}

fn bootstrap_cli() -> (CliArguments, bool) {
	let args_opt = CliArguments::try_parse();

	let use_json_cli = args_opt.as_ref().map_or_else(
		|_error| {
			let mut use_json = false;

			// Try to identify if the user is wanting to use JSON, even when argument
			// parsing itself fails.
			for arg in std::env::args() {
				if arg.as_str() == "-j" || arg.as_str() == "--json" {
					use_json = true;
					break;
				}
			}

			use_json
		},
		|args| args.json,
	);
	let use_json = *USE_JSON_OUTPUT || use_json_cli;

	if let Err(cause) = install_logging_handlers(use_json) {
		// We have to use a custom print here, because logging isn't setup yet.
		if use_json {
			println!(
				r#"{{"id": "uartsocketd::logging::install_failure", "inner_display_error": "{}", "message": "Failed to install the logging handlers!"}}"#,
				format!("{cause:?}").replace('"', "\\\"")
			);
		} else {
			println!("Failed to install the logging handler to setup logging:\n{cause:?}");
		}
		std::process::exit(LOGGING_HANDLER_INSTALL_FAILURE);
	}

	match args_opt {
		Ok(args) => (args, use_json),
		Err(cause) => {
			if matches!(
				cause.kind(),
				clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
			) {
				let _ = cause.print();
				std::process::exit(0);
			}
			if use_json {
				error!(
					id = "uartsocketd::cli::arg_parse_failure",
					error.kind = %cause.kind(),
					error.rendered = %cause.render(),
					"Failed parsing CLI arguments"
				);
			} else {
				error!(
					"\n{:?}",
					miette!("Failed parsing CLI arguments!").wrap_err(cause),
				);
			}

			std::process::exit(ARGUMENT_PARSING_FAILURE);
		}
	}
}
