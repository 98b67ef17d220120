//! Defines the command line interface a.k.a. all the arguments & flags.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(about, author, name = "uartsocketd", version)]
pub struct CliArguments {
	#[arg(
		index = 1,
		help = "The address to bind, or the port when it's the only positional argument.",
		long_help = "The address to bind the control listener on. When this is the only positional argument and it parses as a port number it is used as the port instead, with the host staying at `localhost`."
	)]
	pub host_or_port: Option<String>,
	#[arg(
		index = 2,
		help = "The port to bind the control listener on (defaults to 5001).",
		long_help = "The port to bind the control listener on; only meaningful together with the host positional. Defaults to 5001."
	)]
	pub port: Option<u16>,
	#[arg(
		short = 'e',
		long = "eth-recv-size",
		alias = "eth_recv_size",
		help = "Ethernet receive size (defaults to 8 bytes).",
		long_help = "How many bytes to read from a TCP socket per ingress read. Smaller values keep command handling snappy, larger values help raw data throughput."
	)]
	pub eth_recv_size: Option<usize>,
	#[arg(
		short = 'p',
		long = "eth-poll",
		alias = "eth_poll",
		help = "Ethernet client poll interval in seconds (defaults to 1).",
		long_help = "The TCP read timeout in seconds. This only bounds how quickly a channel notices it has been asked to terminate, it is not a wire-visible setting."
	)]
	pub eth_poll: Option<u64>,
	#[arg(
		short = 's',
		long = "ser-recv-size",
		alias = "ser_recv_size",
		help = "Serial receive size (defaults to 1 byte).",
		long_help = "How many bytes to read from a serial device per read. The default of a single byte gives sniffers the lowest latency; bulk transfers may want more."
	)]
	pub ser_recv_size: Option<usize>,
	#[arg(
		short = 'j',
		long = "json",
		help = "Ensures all logging comes out in JSON instead of text.",
		long_help = "Switch all logging to JSON for machine parsable output. NOTE: there is no necissarily guaranteed structure, though we will not break it unnecissarily."
	)]
	pub json: bool,
}
