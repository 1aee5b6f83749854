use std::path::PathBuf;

use log::{info, warn};

use crate::p4info::PipelineConfig;
use crate::p4runtime::{p4rt, DeviceTransport, TransportError, TransportFactory};

/// Static addressing for one device, from the topology config.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
	pub name: String,
	pub address: String,
	pub device_id: u64,
	pub dump_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	Connected,
	Mastered,
	Piped,
	Programmed,
	Failed,
	Closed,
}

#[derive(Debug)]
pub enum SessionError {
	Connection(TransportError),
	Arbitration(TransportError),
	PipelineInstall(TransportError),
	Write(TransportError),
	InvalidState { op: &'static str, state: SessionState },
}

impl std::fmt::Display for SessionError {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			SessionError::Connection(err) => write!(f, "connection error: {}", err),
			SessionError::Arbitration(err) => write!(f, "arbitration error: {}", err),
			SessionError::PipelineInstall(err) => write!(f, "pipeline install error: {}", err),
			SessionError::Write(err) => write!(f, "table write error: {}", err),
			SessionError::InvalidState { op, state } => {
				write!(f, "{} is not valid in session state {:?}", op, state)
			}
		}
	}
}

impl std::error::Error for SessionError {}

/// One controlled device. Operations are only accepted in the states the
/// device-side protocol allows:
///
/// Connected -> Mastered -> Piped -> Programmed, any transport failure moves
/// the session to Failed, and Closed is terminal.
pub struct DeviceSession {
	identity: DeviceIdentity,
	transport: Box<dyn DeviceTransport>,
	state: SessionState,
}

impl DeviceSession {
	pub async fn connect(
		identity: DeviceIdentity,
		factory: &dyn TransportFactory,
	) -> Result<DeviceSession, SessionError> {
		let transport = factory.connect(&identity).await.map_err(SessionError::Connection)?;
		info!(
			"{}: connected to {} (device id {})",
			identity.name, identity.address, identity.device_id
		);
		Ok(DeviceSession::with_transport(identity, transport))
	}

	pub fn with_transport(identity: DeviceIdentity, transport: Box<dyn DeviceTransport>) -> DeviceSession {
		DeviceSession { identity, transport, state: SessionState::Connected }
	}

	pub fn name(&self) -> &str {
		&self.identity.name
	}

	pub fn identity(&self) -> &DeviceIdentity {
		&self.identity
	}

	pub fn state(&self) -> SessionState {
		self.state
	}

	/// Claims exclusive write authority. Exactly once per session, before
	/// any pipeline install or write.
	pub async fn become_master(&mut self) -> Result<(), SessionError> {
		if self.state != SessionState::Connected {
			return Err(SessionError::InvalidState { op: "become_master", state: self.state });
		}
		match self.transport.master_arbitration().await {
			Ok(()) => {
				self.state = SessionState::Mastered;
				info!("{}: mastership granted", self.identity.name);
				Ok(())
			}
			Err(err) => {
				self.state = SessionState::Failed;
				Err(SessionError::Arbitration(err))
			}
		}
	}

	/// Safe to repeat with the same config; requires mastership.
	pub async fn install_pipeline(&mut self, config: &PipelineConfig) -> Result<(), SessionError> {
		match self.state {
			SessionState::Mastered | SessionState::Piped => {}
			state => return Err(SessionError::InvalidState { op: "install_pipeline", state }),
		}
		match self.transport.install_pipeline(config).await {
			Ok(()) => {
				self.state = SessionState::Piped;
				Ok(())
			}
			Err(err) => {
				self.state = SessionState::Failed;
				Err(SessionError::PipelineInstall(err))
			}
		}
	}

	/// One independent insert; no transaction spans multiple calls.
	pub async fn write_table_entry(&mut self, entry: p4rt::TableEntry) -> Result<(), SessionError> {
		match self.state {
			SessionState::Piped | SessionState::Programmed => {}
			state => return Err(SessionError::InvalidState { op: "write_table_entry", state }),
		}
		match self.transport.write_table_entry(entry).await {
			Ok(()) => {
				self.state = SessionState::Programmed;
				Ok(())
			}
			Err(err) => {
				self.state = SessionState::Failed;
				Err(SessionError::Write(err))
			}
		}
	}

	/// Valid in every state and idempotent. Secondary failures while closing
	/// are logged, never propagated.
	pub async fn close(&mut self) {
		if self.state == SessionState::Closed {
			return;
		}
		if let Err(err) = self.transport.close().await {
			warn!("{}: error while closing session: {}", self.identity.name, err);
		}
		self.state = SessionState::Closed;
		info!("{}: session closed", self.identity.name);
	}
}
