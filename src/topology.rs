use std::path::{Path, PathBuf};

use log::{error, info};
use serde::Deserialize;

use crate::p4info::PipelineConfig;
use crate::p4runtime::{p4rt, TransportFactory};
use crate::rules::{EcmpGroup, RuleBuilder, RuleError, SourceMacRewrite};
use crate::session::{DeviceIdentity, DeviceSession, SessionError};
use crate::supervisor::SessionRegistry;

#[derive(Debug, Deserialize)]
pub struct Config {
	pub devices: Vec<DeviceConfig>,
}

/// One device plus the ECMP policy to install on it.
#[derive(Debug, Deserialize)]
pub struct DeviceConfig {
	pub name: String,
	pub address: String,
	pub device_id: u64,
	#[serde(default)]
	pub dump_file: Option<PathBuf>,
	#[serde(default)]
	pub groups: Vec<EcmpGroup>,
	#[serde(default)]
	pub source_macs: Vec<SourceMacRewrite>,
}

impl DeviceConfig {
	pub fn identity(&self) -> DeviceIdentity {
		DeviceIdentity {
			name: self.name.clone(),
			address: self.address.clone(),
			device_id: self.device_id,
			dump_file: self.dump_file.clone(),
		}
	}
}

#[derive(Debug)]
pub enum ConfigError {
	Io(PathBuf, std::io::Error),
	Parse(serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			ConfigError::Io(path, err) => write!(f, "cannot read {}: {}", path.display(), err),
			ConfigError::Parse(err) => write!(f, "malformed topology config: {}", err),
		}
	}
}

impl std::error::Error for ConfigError {}

impl Config {
	pub fn load(path: &Path) -> Result<Config, ConfigError> {
		let file = std::fs::File::open(path).map_err(|e| ConfigError::Io(path.to_owned(), e))?;
		serde_yaml::from_reader(file).map_err(ConfigError::Parse)
	}
}

/// Terminal result of one device's programming sequence. `writes` counts
/// entries committed before any failure; there is no rollback.
#[derive(Debug)]
pub struct DeviceOutcome {
	pub name: String,
	pub writes: usize,
	pub error: Option<SessionError>,
}

impl DeviceOutcome {
	pub fn ok(&self) -> bool {
		self.error.is_none()
	}
}

/// Full rule list for one device: group rules first, each followed by its
/// next-hop rules, then the per-port source MAC rewrites.
pub fn build_device_rules(
	builder: &RuleBuilder,
	device: &DeviceConfig,
) -> Result<Vec<p4rt::TableEntry>, RuleError> {
	let mut entries = Vec::new();
	for group in &device.groups {
		entries.extend(builder.group_rules(group)?);
	}
	for rewrite in &device.source_macs {
		entries.push(builder.send_frame_rule(rewrite.port, rewrite.smac)?);
	}
	Ok(entries)
}

/// Programs every device in the topology: connect, claim mastership, install
/// the pipeline, then write the device's rules in order.
///
/// All rules are resolved against the pipeline metadata up front, so a name
/// that does not exist in the loaded p4info aborts before any device is
/// contacted. A transport failure on one device ends that device's sequence
/// only; the remaining devices still get programmed.
pub async fn program_topology(
	config: &Config,
	pipeline: &PipelineConfig,
	factory: &dyn TransportFactory,
	registry: &mut SessionRegistry,
) -> Result<Vec<DeviceOutcome>, RuleError> {
	let builder = RuleBuilder::new(pipeline.p4info());
	let mut plans = Vec::with_capacity(config.devices.len());
	for device in &config.devices {
		plans.push(build_device_rules(&builder, device)?);
	}

	let mut outcomes = Vec::with_capacity(config.devices.len());
	for (device, entries) in config.devices.iter().zip(plans) {
		outcomes.push(program_device(device, entries, pipeline, factory, registry).await);
	}
	Ok(outcomes)
}

async fn program_device(
	device: &DeviceConfig,
	entries: Vec<p4rt::TableEntry>,
	pipeline: &PipelineConfig,
	factory: &dyn TransportFactory,
	registry: &mut SessionRegistry,
) -> DeviceOutcome {
	let mut outcome = DeviceOutcome { name: device.name.clone(), writes: 0, error: None };
	let mut session = match DeviceSession::connect(device.identity(), factory).await {
		Ok(session) => session,
		Err(err) => {
			error!("{}: {}", device.name, err);
			outcome.error = Some(err);
			return outcome;
		}
	};
	let result = program_session(&mut session, entries, pipeline, &mut outcome.writes).await;
	// failed sessions are registered too; teardown closes them all
	registry.register(session);
	if let Err(err) = result {
		error!("{}: {}", device.name, err);
		outcome.error = Some(err);
	}
	outcome
}

async fn program_session(
	session: &mut DeviceSession,
	entries: Vec<p4rt::TableEntry>,
	pipeline: &PipelineConfig,
	writes: &mut usize,
) -> Result<(), SessionError> {
	session.become_master().await?;
	session.install_pipeline(pipeline).await?;
	info!("{}: pipeline installed", session.name());
	for (index, entry) in entries.into_iter().enumerate() {
		session.write_table_entry(entry).await.map_err(|err| {
			error!("{}: table write #{} rejected", session.name(), index);
			err
		})?;
		*writes += 1;
	}
	info!("{}: {} table entries installed", session.name(), writes);
	Ok(())
}
