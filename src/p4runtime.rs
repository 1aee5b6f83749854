use std::io::Write;

use async_trait::async_trait;
use log::{info, warn};
use tokio::sync::mpsc;
use tonic::transport::Channel;

use crate::p4info::PipelineConfig;
use crate::session::DeviceIdentity;

use self::p4rt::p4_runtime_client::P4RuntimeClient;
use self::p4rt::{
	entity, set_forwarding_pipeline_config_request, stream_message_request, stream_message_response,
	update, Entity, ForwardingPipelineConfig, MasterArbitrationUpdate,
	SetForwardingPipelineConfigRequest, StreamMessageRequest, StreamMessageResponse, TableEntry,
	Uint128, Update, WriteRequest,
};

pub mod p4rt {
	tonic::include_proto!("p4rt"); // The string specified here must match the proto package name
}

// single-writer arbitration; one controller instance, one election id
const ELECTION_ID_LOW: u64 = 1;

#[derive(Debug)]
pub enum TransportError {
	Connect(tonic::transport::Error),
	Rpc(tonic::Status),
	ArbitrationRejected { code: i32, message: String },
	StreamClosed,
}

impl std::fmt::Display for TransportError {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			TransportError::Connect(err) => write!(f, "connect failed: {}", err),
			TransportError::Rpc(status) => {
				write!(f, "rpc failed: {} ({})", status.code(), status.message())
			}
			TransportError::ArbitrationRejected { code, message } => {
				write!(f, "arbitration rejected: code {} ({})", code, message)
			}
			TransportError::StreamClosed => write!(f, "stream channel closed by device"),
		}
	}
}

impl std::error::Error for TransportError {}

impl From<tonic::Status> for TransportError {
	fn from(status: tonic::Status) -> TransportError {
		TransportError::Rpc(status)
	}
}

/// Control channel to one device. The gRPC implementation below is the real
/// one; tests drive sessions through in-memory implementations.
#[async_trait]
pub trait DeviceTransport: Send {
	async fn master_arbitration(&mut self) -> Result<(), TransportError>;
	async fn install_pipeline(&mut self, config: &PipelineConfig) -> Result<(), TransportError>;
	async fn write_table_entry(&mut self, entry: TableEntry) -> Result<(), TransportError>;
	async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
	async fn connect(&self, identity: &DeviceIdentity) -> Result<Box<dyn DeviceTransport>, TransportError>;
}

pub struct GrpcTransport {
	client: P4RuntimeClient<Channel>,
	stream_tx: mpsc::Sender<StreamMessageRequest>,
	stream_rx: tonic::Streaming<StreamMessageResponse>,
	device_id: u64,
	dump: Option<std::fs::File>,
}

impl GrpcTransport {
	pub async fn connect(identity: &DeviceIdentity) -> Result<GrpcTransport, TransportError> {
		let endpoint = format!("http://{}", identity.address);
		let mut client = P4RuntimeClient::connect(endpoint)
			.await
			.map_err(TransportError::Connect)?;
		let (tx, mut rx) = mpsc::channel(16);
		let outbound = async_stream::stream! {
			while let Some(req) = rx.recv().await {
				yield req;
			}
		};
		let stream_rx = client
			.stream_channel(tonic::Request::new(outbound))
			.await?
			.into_inner();
		let dump = match &identity.dump_file {
			Some(path) => open_dump_file(path),
			None => None,
		};
		Ok(GrpcTransport {
			client,
			stream_tx: tx,
			stream_rx,
			device_id: identity.device_id,
			dump,
		})
	}

	fn election_id(&self) -> Uint128 {
		Uint128 { high: 0, low: ELECTION_ID_LOW }
	}

	fn dump_request<T: std::fmt::Debug>(&mut self, what: &str, request: &T) {
		if let Some(file) = &mut self.dump {
			let _ = writeln!(file, "{}\n{:#?}\n", what, request);
		}
	}
}

#[async_trait]
impl DeviceTransport for GrpcTransport {
	async fn master_arbitration(&mut self) -> Result<(), TransportError> {
		let arbitration = MasterArbitrationUpdate {
			device_id: self.device_id,
			election_id: Some(self.election_id()),
			status: None,
		};
		self.dump_request("MasterArbitrationUpdate", &arbitration);
		let request = StreamMessageRequest {
			update: Some(stream_message_request::Update::Arbitration(arbitration)),
		};
		self.stream_tx
			.send(request)
			.await
			.map_err(|_| TransportError::StreamClosed)?;
		let response = self
			.stream_rx
			.message()
			.await?
			.ok_or(TransportError::StreamClosed)?;
		match response.update {
			Some(stream_message_response::Update::Arbitration(arbitration)) => {
				let status = arbitration.status.unwrap_or_default();
				if status.code == 0 {
					Ok(())
				} else {
					Err(TransportError::ArbitrationRejected {
						code: status.code,
						message: status.message,
					})
				}
			}
			None => Err(TransportError::StreamClosed),
		}
	}

	async fn install_pipeline(&mut self, config: &PipelineConfig) -> Result<(), TransportError> {
		let request = SetForwardingPipelineConfigRequest {
			device_id: self.device_id,
			election_id: Some(self.election_id()),
			action: set_forwarding_pipeline_config_request::Action::VerifyAndCommit as i32,
			config: Some(ForwardingPipelineConfig {
				p4info: config.p4info_bytes().to_vec(),
				p4_device_config: config.device_config().to_vec(),
			}),
		};
		self.dump_request("SetForwardingPipelineConfigRequest", &request);
		self.client.set_forwarding_pipeline_config(request).await?;
		Ok(())
	}

	async fn write_table_entry(&mut self, entry: TableEntry) -> Result<(), TransportError> {
		let update = Update {
			r#type: update::Type::Insert as i32,
			entity: Some(Entity {
				entity: Some(entity::Entity::TableEntry(entry)),
			}),
		};
		let request = WriteRequest {
			device_id: self.device_id,
			election_id: Some(self.election_id()),
			updates: vec![update],
		};
		self.dump_request("WriteRequest", &request);
		self.client.write(request).await?;
		Ok(())
	}

	async fn close(&mut self) -> Result<(), TransportError> {
		// dropping the sender ends the stream channel on the device side
		if let Some(file) = &mut self.dump {
			let _ = file.flush();
		}
		Ok(())
	}
}

fn open_dump_file(path: &std::path::Path) -> Option<std::fs::File> {
	if let Some(parent) = path.parent() {
		if !parent.as_os_str().is_empty() {
			let _ = std::fs::create_dir_all(parent);
		}
	}
	match std::fs::OpenOptions::new().create(true).append(true).open(path) {
		Ok(file) => {
			info!("dumping outbound requests to {}", path.display());
			Some(file)
		}
		Err(err) => {
			// the dump is observability only, never fatal
			warn!("cannot open dump file {}: {}", path.display(), err);
			None
		}
	}
}

pub struct GrpcConnector;

#[async_trait]
impl TransportFactory for GrpcConnector {
	async fn connect(&self, identity: &DeviceIdentity) -> Result<Box<dyn DeviceTransport>, TransportError> {
		let transport = GrpcTransport::connect(identity).await?;
		Ok(Box::new(transport))
	}
}
