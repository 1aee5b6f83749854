use std::path::PathBuf;

use clap::{App, Arg};
use log::info;
use tokio::sync::mpsc;

use ecmp_controller::p4info::PipelineConfig;
use ecmp_controller::p4runtime::GrpcConnector;
use ecmp_controller::supervisor;
use ecmp_controller::topology::Config;

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() {
	env_logger::init();

	let app = App::new("ecmp-controller")
		.version("1.0")
		.about("P4Runtime controller installing ECMP load balancing rules")
		.arg(
			Arg::new("config")
				.long("config")
				.default_value("config.yaml")
				.help("topology and policy config"),
		)
		.arg(
			Arg::new("p4info")
				.long("p4info")
				.default_value("./build/load_balance.p4.p4info.json")
				.help("p4info JSON from p4c"),
		)
		.arg(
			Arg::new("bmv2-json")
				.long("bmv2-json")
				.default_value("./build/load_balance.json")
				.help("BMv2 JSON from p4c"),
		);
	let mut usage = app.clone();
	let matches = app.get_matches();

	let config_path = PathBuf::from(matches.value_of("config").unwrap());
	let p4info_path = PathBuf::from(matches.value_of("p4info").unwrap());
	let bmv2_path = PathBuf::from(matches.value_of("bmv2-json").unwrap());

	// pre-flight file checks, before any device is contacted
	for (label, path) in [
		("config", &config_path),
		("p4info", &p4info_path),
		("BMv2 JSON", &bmv2_path),
	] {
		if !path.exists() {
			let _ = usage.print_help();
			eprintln!("\n{} file not found: {}\nHave you run 'make'?", label, path.display());
			std::process::exit(1);
		}
	}

	let config = match Config::load(&config_path) {
		Ok(config) => config,
		Err(err) => {
			eprintln!("{}", err);
			std::process::exit(1);
		}
	};
	let pipeline = match PipelineConfig::load(&p4info_path, &bmv2_path) {
		Ok(pipeline) => pipeline,
		Err(err) => {
			eprintln!("{}", err);
			std::process::exit(1);
		}
	};

	let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
	let mut signals = signal_hook::iterator::Signals::new(&[
		signal_hook::consts::SIGINT,
		signal_hook::consts::SIGTERM,
	])
	.unwrap();
	std::thread::spawn(move || {
		for sig in signals.forever() {
			info!("received signal {:?}, shutting down", sig);
			let _ = shutdown_tx.blocking_send(());
			return;
		}
	});

	let code = supervisor::run(&config, &pipeline, &GrpcConnector, &mut shutdown_rx).await;
	std::process::exit(code);
}
