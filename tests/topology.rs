use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use ecmp_controller::p4info::PipelineConfig;
use ecmp_controller::p4runtime::{p4rt, DeviceTransport, TransportError, TransportFactory};
use ecmp_controller::session::{DeviceIdentity, SessionError};
use ecmp_controller::supervisor::{self, SessionRegistry};
use ecmp_controller::topology::{program_topology, Config};

const P4INFO: &str = include_str!("data/load_balance.p4info.json");
const DEMO_CONFIG: &str = include_str!("../config.yaml");

#[derive(Default, Debug)]
struct DeviceLog {
	arbitrations: usize,
	installs: usize,
	writes: Vec<p4rt::TableEntry>,
	closes: usize,
}

#[derive(Default)]
struct FakeSwitches {
	logs: Mutex<HashMap<String, DeviceLog>>,
	reject_arbitration: Mutex<HashSet<String>>,
	connects: Mutex<usize>,
}

impl FakeSwitches {
	fn log<R>(&self, name: &str, f: impl FnOnce(&mut DeviceLog) -> R) -> R {
		let mut logs = self.logs.lock().unwrap();
		f(logs.entry(name.to_owned()).or_default())
	}
}

struct FakeTransport {
	name: String,
	switches: Arc<FakeSwitches>,
}

#[async_trait]
impl DeviceTransport for FakeTransport {
	async fn master_arbitration(&mut self) -> Result<(), TransportError> {
		self.switches.log(&self.name, |log| log.arbitrations += 1);
		if self.switches.reject_arbitration.lock().unwrap().contains(&self.name) {
			return Err(TransportError::ArbitrationRejected {
				code: 6,
				message: "another master is active".to_owned(),
			});
		}
		Ok(())
	}

	async fn install_pipeline(&mut self, _config: &PipelineConfig) -> Result<(), TransportError> {
		self.switches.log(&self.name, |log| log.installs += 1);
		Ok(())
	}

	async fn write_table_entry(&mut self, entry: p4rt::TableEntry) -> Result<(), TransportError> {
		self.switches.log(&self.name, |log| log.writes.push(entry));
		Ok(())
	}

	async fn close(&mut self) -> Result<(), TransportError> {
		self.switches.log(&self.name, |log| log.closes += 1);
		Ok(())
	}
}

struct FakeFactory {
	switches: Arc<FakeSwitches>,
}

#[async_trait]
impl TransportFactory for FakeFactory {
	async fn connect(&self, identity: &DeviceIdentity) -> Result<Box<dyn DeviceTransport>, TransportError> {
		*self.switches.connects.lock().unwrap() += 1;
		Ok(Box::new(FakeTransport {
			name: identity.name.clone(),
			switches: self.switches.clone(),
		}))
	}
}

fn demo_config() -> Config {
	serde_yaml::from_str(DEMO_CONFIG).unwrap()
}

fn pipeline() -> PipelineConfig {
	PipelineConfig::from_bytes(P4INFO.as_bytes().to_vec(), b"{}".to_vec()).unwrap()
}

#[tokio::test]
async fn three_switch_demo_installs_nine_entries() {
	let switches = Arc::new(FakeSwitches::default());
	let factory = FakeFactory { switches: switches.clone() };
	let config = demo_config();
	let pipeline = pipeline();
	let mut registry = SessionRegistry::new();

	let outcomes = program_topology(&config, &pipeline, &factory, &mut registry)
		.await
		.unwrap();

	assert!(outcomes.iter().all(|o| o.ok()));
	let writes: HashMap<&str, usize> = outcomes.iter().map(|o| (o.name.as_str(), o.writes)).collect();
	assert_eq!(writes["s1"], 5);
	assert_eq!(writes["s2"], 2);
	assert_eq!(writes["s3"], 2);
	assert_eq!(outcomes.iter().map(|o| o.writes).sum::<usize>(), 9);

	let logs = switches.logs.lock().unwrap();
	for name in ["s1", "s2", "s3"] {
		let log = &logs[name];
		assert_eq!(log.arbitrations, 1, "{} arbitrations", name);
		assert_eq!(log.installs, 1, "{} pipeline installs", name);
		// no two entries on one device may share (table, match key)
		let keys: HashSet<String> = log
			.writes
			.iter()
			.map(|entry| format!("{}/{:?}", entry.table_id, entry.r#match))
			.collect();
		assert_eq!(keys.len(), log.writes.len(), "{} has duplicate match keys", name);
	}
}

#[tokio::test]
async fn rejected_arbitration_skips_device_but_not_siblings() {
	let switches = Arc::new(FakeSwitches::default());
	switches.reject_arbitration.lock().unwrap().insert("s2".to_owned());
	let factory = FakeFactory { switches: switches.clone() };
	let config = demo_config();
	let pipeline = pipeline();
	let mut registry = SessionRegistry::new();

	let outcomes = program_topology(&config, &pipeline, &factory, &mut registry)
		.await
		.unwrap();

	let s2 = outcomes.iter().find(|o| o.name == "s2").unwrap();
	assert!(matches!(s2.error, Some(SessionError::Arbitration(_))));
	assert_eq!(s2.writes, 0);
	for name in ["s1", "s3"] {
		let outcome = outcomes.iter().find(|o| o.name == name).unwrap();
		assert!(outcome.ok(), "{} should still be programmed", name);
	}

	{
		let logs = switches.logs.lock().unwrap();
		assert_eq!(logs["s2"].installs, 0, "no pipeline install after lost arbitration");
		assert!(logs["s2"].writes.is_empty());
		assert_eq!(logs["s1"].writes.len(), 5);
		assert_eq!(logs["s3"].writes.len(), 2);
	}

	// teardown still closes every session, the failed one included
	assert_eq!(registry.len(), 3);
	registry.close_all().await;
	let logs = switches.logs.lock().unwrap();
	for name in ["s1", "s2", "s3"] {
		assert_eq!(logs[name].closes, 1, "{} closes", name);
	}
}

#[tokio::test]
async fn interrupt_tears_down_every_session_once() {
	let switches = Arc::new(FakeSwitches::default());
	let factory = FakeFactory { switches: switches.clone() };
	let config = demo_config();
	let pipeline = pipeline();

	let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
	shutdown_tx.send(()).await.unwrap();

	let code = supervisor::run(&config, &pipeline, &factory, &mut shutdown_rx).await;
	assert_eq!(code, 0);

	let logs = switches.logs.lock().unwrap();
	for name in ["s1", "s2", "s3"] {
		assert_eq!(logs[name].closes, 1, "{} closes", name);
	}
}

#[tokio::test]
async fn unresolvable_policy_aborts_before_any_connection() {
	// drop the egress table from the pipeline so send_frame rules cannot resolve
	let mut p4info: serde_json::Value = serde_json::from_str(P4INFO).unwrap();
	let tables = p4info["tables"].as_array_mut().unwrap();
	tables.retain(|t| t["preamble"]["name"] != "MyEgress.send_frame");
	let pipeline =
		PipelineConfig::from_bytes(serde_json::to_vec(&p4info).unwrap(), b"{}".to_vec()).unwrap();

	let switches = Arc::new(FakeSwitches::default());
	let factory = FakeFactory { switches: switches.clone() };
	let config = demo_config();
	let mut registry = SessionRegistry::new();

	let result = program_topology(&config, &pipeline, &factory, &mut registry).await;
	assert!(result.is_err());
	assert_eq!(*switches.connects.lock().unwrap(), 0, "no device may be contacted");
	assert!(registry.is_empty());

	let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
	shutdown_tx.send(()).await.unwrap();
	let code = supervisor::run(&config, &pipeline, &factory, &mut shutdown_rx).await;
	assert_eq!(code, 2);
}
