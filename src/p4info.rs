use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;

// serde models of the p4info JSON emitted by p4c (--p4runtime-files *.p4info.json)

#[derive(Debug, Deserialize)]
pub struct P4InfoFile {
	#[serde(default)]
	pub tables: Vec<TableDef>,
	#[serde(default)]
	pub actions: Vec<ActionDef>,
}

#[derive(Debug, Deserialize)]
pub struct Preamble {
	pub id: u32,
	pub name: String,
	#[serde(default)]
	pub alias: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDef {
	pub preamble: Preamble,
	#[serde(default)]
	pub match_fields: Vec<MatchFieldDef>,
	#[serde(default)]
	pub action_refs: Vec<ActionRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchFieldDef {
	pub id: u32,
	pub name: String,
	#[serde(default)]
	pub bitwidth: u32,
	#[serde(default)]
	pub match_type: String,
}

#[derive(Debug, Deserialize)]
pub struct ActionRef {
	pub id: u32,
}

#[derive(Debug, Deserialize)]
pub struct ActionDef {
	pub preamble: Preamble,
	#[serde(default)]
	pub params: Vec<ParamDef>,
}

#[derive(Debug, Deserialize)]
pub struct ParamDef {
	pub id: u32,
	pub name: String,
	#[serde(default)]
	pub bitwidth: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
	Table(String),
	Action(String),
	MatchField { table: String, field: String },
	ActionParam { action: String, param: String },
	ActionNotInTable { table: String, action: String },
	MatchTypeMismatch { table: String, field: String, declared: String, requested: String },
}

impl std::fmt::Display for LookupError {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			LookupError::Table(name) => write!(f, "table {} not found in p4info", name),
			LookupError::Action(name) => write!(f, "action {} not found in p4info", name),
			LookupError::MatchField { table, field } => {
				write!(f, "match field {}::{} not found in p4info", table, field)
			}
			LookupError::ActionParam { action, param } => {
				write!(f, "action param {}::{} not found in p4info", action, param)
			}
			LookupError::ActionNotInTable { table, action } => {
				write!(f, "action {} is not referenced by table {}", action, table)
			}
			LookupError::MatchTypeMismatch { table, field, declared, requested } => {
				write!(
					f,
					"match field {}::{} is declared {} but the rule uses {}",
					table, field, declared, requested
				)
			}
		}
	}
}

impl std::error::Error for LookupError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMeta {
	pub id: u32,
	pub bitwidth: u32,
	pub match_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamMeta {
	pub id: u32,
	pub bitwidth: u32,
}

#[derive(Debug)]
struct TableMeta {
	id: u32,
	fields: HashMap<String, FieldMeta>,
	action_ids: HashSet<u32>,
}

#[derive(Debug)]
struct ActionMeta {
	id: u32,
	params: HashMap<String, ParamMeta>,
}

/// Name to id resolution for one loaded pipeline. Read-only after parse;
/// tables and actions resolve by full name or by their p4info alias.
#[derive(Debug)]
pub struct P4Info {
	tables: Vec<TableMeta>,
	table_index: HashMap<String, usize>,
	actions: Vec<ActionMeta>,
	action_index: HashMap<String, usize>,
}

impl P4Info {
	pub fn parse(bytes: &[u8]) -> Result<P4Info, serde_json::Error> {
		let file: P4InfoFile = serde_json::from_slice(bytes)?;
		Ok(P4Info::from_file(file))
	}

	pub fn from_file(file: P4InfoFile) -> P4Info {
		let mut tables = Vec::with_capacity(file.tables.len());
		let mut table_index = HashMap::new();
		for table in file.tables {
			let mut fields = HashMap::new();
			for field in table.match_fields {
				fields.insert(
					field.name,
					FieldMeta {
						id: field.id,
						bitwidth: field.bitwidth,
						match_type: field.match_type,
					},
				);
			}
			let action_ids = table.action_refs.iter().map(|r| r.id).collect();
			let idx = tables.len();
			table_index.insert(table.preamble.name, idx);
			if !table.preamble.alias.is_empty() {
				table_index.entry(table.preamble.alias).or_insert(idx);
			}
			tables.push(TableMeta { id: table.preamble.id, fields, action_ids });
		}
		let mut actions = Vec::with_capacity(file.actions.len());
		let mut action_index = HashMap::new();
		for action in file.actions {
			let mut params = HashMap::new();
			for param in action.params {
				params.insert(param.name, ParamMeta { id: param.id, bitwidth: param.bitwidth });
			}
			let idx = actions.len();
			action_index.insert(action.preamble.name, idx);
			if !action.preamble.alias.is_empty() {
				action_index.entry(action.preamble.alias).or_insert(idx);
			}
			actions.push(ActionMeta { id: action.preamble.id, params });
		}
		P4Info { tables, table_index, actions, action_index }
	}

	fn table(&self, name: &str) -> Result<&TableMeta, LookupError> {
		self.table_index
			.get(name)
			.map(|idx| &self.tables[*idx])
			.ok_or_else(|| LookupError::Table(name.to_owned()))
	}

	fn action(&self, name: &str) -> Result<&ActionMeta, LookupError> {
		self.action_index
			.get(name)
			.map(|idx| &self.actions[*idx])
			.ok_or_else(|| LookupError::Action(name.to_owned()))
	}

	pub fn table_id(&self, name: &str) -> Result<u32, LookupError> {
		Ok(self.table(name)?.id)
	}

	pub fn match_field(&self, table: &str, field: &str) -> Result<&FieldMeta, LookupError> {
		self.table(table)?.fields.get(field).ok_or_else(|| LookupError::MatchField {
			table: table.to_owned(),
			field: field.to_owned(),
		})
	}

	pub fn action_id(&self, name: &str) -> Result<u32, LookupError> {
		Ok(self.action(name)?.id)
	}

	pub fn action_param(&self, action: &str, param: &str) -> Result<&ParamMeta, LookupError> {
		self.action(action)?.params.get(param).ok_or_else(|| LookupError::ActionParam {
			action: action.to_owned(),
			param: param.to_owned(),
		})
	}

	/// Resolves an action id and checks the table actually references it.
	pub fn table_action_id(&self, table: &str, action: &str) -> Result<u32, LookupError> {
		let action_id = self.action_id(action)?;
		if !self.table(table)?.action_ids.contains(&action_id) {
			return Err(LookupError::ActionNotInTable {
				table: table.to_owned(),
				action: action.to_owned(),
			});
		}
		Ok(action_id)
	}
}

#[derive(Debug)]
pub enum PipelineLoadError {
	Io(PathBuf, std::io::Error),
	Parse(serde_json::Error),
}

impl std::fmt::Display for PipelineLoadError {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			PipelineLoadError::Io(path, err) => write!(f, "cannot read {}: {}", path.display(), err),
			PipelineLoadError::Parse(err) => write!(f, "malformed p4info JSON: {}", err),
		}
	}
}

impl std::error::Error for PipelineLoadError {}

/// Compiled pipeline plus its parsed metadata. Loaded once at startup and
/// shared read-only by every device session that installs it.
#[derive(Debug)]
pub struct PipelineConfig {
	p4info: P4Info,
	p4info_bytes: Vec<u8>,
	device_config: Vec<u8>,
}

impl PipelineConfig {
	pub fn load(p4info_path: &Path, device_config_path: &Path) -> Result<PipelineConfig, PipelineLoadError> {
		let p4info_bytes = std::fs::read(p4info_path)
			.map_err(|e| PipelineLoadError::Io(p4info_path.to_owned(), e))?;
		let device_config = std::fs::read(device_config_path)
			.map_err(|e| PipelineLoadError::Io(device_config_path.to_owned(), e))?;
		Self::from_bytes(p4info_bytes, device_config).map_err(PipelineLoadError::Parse)
	}

	pub fn from_bytes(p4info_bytes: Vec<u8>, device_config: Vec<u8>) -> Result<PipelineConfig, serde_json::Error> {
		let p4info = P4Info::parse(&p4info_bytes)?;
		Ok(PipelineConfig { p4info, p4info_bytes, device_config })
	}

	pub fn p4info(&self) -> &P4Info {
		&self.p4info
	}

	pub fn p4info_bytes(&self) -> &[u8] {
		&self.p4info_bytes
	}

	pub fn device_config(&self) -> &[u8] {
		&self.device_config
	}
}
