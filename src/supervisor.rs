use log::{error, info, warn};
use tokio::sync::mpsc;

use crate::p4info::PipelineConfig;
use crate::p4runtime::TransportFactory;
use crate::session::DeviceSession;
use crate::topology::{program_topology, Config};

/// Owns every session the topology program opened, failed ones included.
/// Teardown closes each exactly once; `DeviceSession::close` is idempotent
/// and swallows secondary errors, so no transport handle can leak.
#[derive(Default)]
pub struct SessionRegistry {
	sessions: Vec<DeviceSession>,
}

impl SessionRegistry {
	pub fn new() -> SessionRegistry {
		SessionRegistry { sessions: Vec::new() }
	}

	pub fn register(&mut self, session: DeviceSession) {
		self.sessions.push(session);
	}

	pub fn len(&self) -> usize {
		self.sessions.len()
	}

	pub fn is_empty(&self) -> bool {
		self.sessions.is_empty()
	}

	pub async fn close_all(&mut self) {
		for session in self.sessions.iter_mut() {
			session.close().await;
		}
	}
}

/// Runs the topology program once, then parks until interrupted.
///
/// Exit codes: 0 after a clean run and interrupt, 1 when one or more devices
/// could not be fully programmed, 2 when the policy does not resolve against
/// the loaded pipeline (nothing was sent anywhere in that case).
pub async fn run(
	config: &Config,
	pipeline: &PipelineConfig,
	factory: &dyn TransportFactory,
	shutdown: &mut mpsc::Receiver<()>,
) -> i32 {
	let mut registry = SessionRegistry::new();
	let outcomes = match program_topology(config, pipeline, factory, &mut registry).await {
		Ok(outcomes) => outcomes,
		Err(err) => {
			error!("rule construction failed: {}", err);
			registry.close_all().await;
			return 2;
		}
	};

	let mut failed = 0;
	for outcome in &outcomes {
		match &outcome.error {
			None => info!("{}: programmed ({} writes)", outcome.name, outcome.writes),
			Some(err) => {
				failed += 1;
				error!(
					"{}: partially programmed, {} writes committed: {}",
					outcome.name, outcome.writes, err
				);
			}
		}
	}
	if failed > 0 {
		warn!("{}/{} devices failed, shutting down", failed, outcomes.len());
		registry.close_all().await;
		return 1;
	}

	// idle until interrupted; counter polling would hang off this loop
	info!("all {} devices programmed, waiting for interrupt", outcomes.len());
	let _ = shutdown.recv().await;

	info!("shutting down {} sessions", registry.len());
	registry.close_all().await;
	0
}
