use std::net::Ipv4Addr;

use pnet::util::MacAddr;
use serde::Deserialize;

use crate::p4info::{LookupError, P4Info};
use crate::p4runtime::p4rt::{action, field_match, table_action, Action, FieldMatch, TableAction, TableEntry};

pub const TABLE_ECMP_GROUP: &str = "MyIngress.ecmp_group";
pub const TABLE_ECMP_NHOP: &str = "MyIngress.ecmp_nhop";
pub const TABLE_SEND_FRAME: &str = "MyEgress.send_frame";

const ACTION_SET_ECMP_SELECT: &str = "MyIngress.set_ecmp_select";
const ACTION_SET_NHOP: &str = "MyIngress.set_nhop";
const ACTION_REWRITE_MAC: &str = "MyEgress.rewrite_mac";

const FIELD_IPV4_DST: &str = "hdr.ipv4.dstAddr";
const FIELD_ECMP_SELECT: &str = "meta.ecmp_select";
const FIELD_EGRESS_PORT: &str = "standard_metadata.egress_port";

const PARAM_ECMP_BASE: &str = "ecmp_base";
const PARAM_ECMP_COUNT: &str = "ecmp_count";
const PARAM_NHOP_DMAC: &str = "nhop_dmac";
const PARAM_NHOP_IPV4: &str = "nhop_ipv4";
const PARAM_PORT: &str = "port";
const PARAM_SMAC: &str = "smac";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchValue {
	Exact(Vec<u8>),
	Lpm { value: Vec<u8>, prefix_len: i32 },
}

impl MatchValue {
	fn kind(&self) -> &'static str {
		match self {
			MatchValue::Exact(_) => "EXACT",
			MatchValue::Lpm { .. } => "LPM",
		}
	}
}

/// Semantic description of one table entry, all fields by name. Consumed by
/// [`RuleBuilder::table_entry`] which resolves it against the loaded p4info.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntrySpec {
	pub table_name: String,
	pub match_fields: Vec<(String, MatchValue)>,
	pub action_name: String,
	pub action_params: Vec<(String, Vec<u8>)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
	Lookup(LookupError),
	EmptyGroup(String),
}

impl std::fmt::Display for RuleError {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			RuleError::Lookup(err) => write!(f, "{}", err),
			RuleError::EmptyGroup(dst) => write!(f, "ECMP group for {} has no members", dst),
		}
	}
}

impl std::error::Error for RuleError {}

impl From<LookupError> for RuleError {
	fn from(err: LookupError) -> RuleError {
		RuleError::Lookup(err)
	}
}

/// One equal-cost group: every member gets a contiguous selector starting at
/// `ecmp_base`, and the installed member count is always `members.len()`.
#[derive(Debug, Clone, Deserialize)]
pub struct EcmpGroup {
	pub dst_addr: Ipv4Addr,
	#[serde(default = "default_prefix_len")]
	pub prefix_len: u8,
	#[serde(default)]
	pub ecmp_base: u16,
	pub members: Vec<NextHop>,
}

fn default_prefix_len() -> u8 {
	32
}

#[derive(Debug, Clone, Deserialize)]
pub struct NextHop {
	pub nhop_ip: Ipv4Addr,
	pub nhop_mac: MacAddr,
	pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceMacRewrite {
	pub port: u16,
	pub smac: MacAddr,
}

/// Big-endian, sized to the declared bitwidth rounded up to whole bytes.
/// Unknown width (0) keeps the caller's bytes untouched.
fn fit_width(bytes: &[u8], bitwidth: u32) -> Vec<u8> {
	if bitwidth == 0 {
		return bytes.to_vec();
	}
	let nbytes = ((bitwidth + 7) / 8) as usize;
	if bytes.len() >= nbytes {
		bytes[bytes.len() - nbytes..].to_vec()
	} else {
		let mut out = vec![0u8; nbytes - bytes.len()];
		out.extend_from_slice(bytes);
		out
	}
}

fn mac_bytes(mac: MacAddr) -> Vec<u8> {
	vec![mac.0, mac.1, mac.2, mac.3, mac.4, mac.5]
}

/// Pure translation of rule specs into transport-ready table entries.
/// No device interaction happens here; unresolvable names fail the build.
pub struct RuleBuilder<'a> {
	info: &'a P4Info,
}

impl<'a> RuleBuilder<'a> {
	pub fn new(info: &'a P4Info) -> RuleBuilder<'a> {
		RuleBuilder { info }
	}

	pub fn table_entry(&self, spec: &TableEntrySpec) -> Result<TableEntry, LookupError> {
		let table_id = self.info.table_id(&spec.table_name)?;
		let mut matches = Vec::with_capacity(spec.match_fields.len());
		for (field_name, value) in &spec.match_fields {
			let meta = self.info.match_field(&spec.table_name, field_name)?;
			if !meta.match_type.is_empty() && meta.match_type != value.kind() {
				return Err(LookupError::MatchTypeMismatch {
					table: spec.table_name.clone(),
					field: field_name.clone(),
					declared: meta.match_type.clone(),
					requested: value.kind().to_owned(),
				});
			}
			let field_match_type = match value {
				MatchValue::Exact(bytes) => field_match::FieldMatchType::Exact(field_match::Exact {
					value: fit_width(bytes, meta.bitwidth),
				}),
				MatchValue::Lpm { value, prefix_len } => {
					field_match::FieldMatchType::Lpm(field_match::Lpm {
						value: fit_width(value, meta.bitwidth),
						prefix_len: *prefix_len,
					})
				}
			};
			matches.push(FieldMatch {
				field_id: meta.id,
				field_match_type: Some(field_match_type),
			});
		}
		let action_id = self.info.table_action_id(&spec.table_name, &spec.action_name)?;
		let mut params = Vec::with_capacity(spec.action_params.len());
		for (param_name, value) in &spec.action_params {
			let meta = self.info.action_param(&spec.action_name, param_name)?;
			params.push(action::Param {
				param_id: meta.id,
				value: fit_width(value, meta.bitwidth),
			});
		}
		Ok(TableEntry {
			table_id,
			r#match: matches,
			action: Some(TableAction {
				r#type: Some(table_action::Type::Action(Action { action_id, params })),
			}),
			priority: 0,
		})
	}

	pub fn ecmp_group_rule(
		&self,
		dst_addr: Ipv4Addr,
		prefix_len: u8,
		ecmp_base: u16,
		ecmp_count: u32,
	) -> Result<TableEntry, LookupError> {
		let spec = TableEntrySpec {
			table_name: TABLE_ECMP_GROUP.to_owned(),
			match_fields: vec![(
				FIELD_IPV4_DST.to_owned(),
				MatchValue::Lpm {
					value: dst_addr.octets().to_vec(),
					prefix_len: prefix_len as i32,
				},
			)],
			action_name: ACTION_SET_ECMP_SELECT.to_owned(),
			action_params: vec![
				(PARAM_ECMP_BASE.to_owned(), ecmp_base.to_be_bytes().to_vec()),
				(PARAM_ECMP_COUNT.to_owned(), ecmp_count.to_be_bytes().to_vec()),
			],
		};
		self.table_entry(&spec)
	}

	pub fn ecmp_nhop_rule(
		&self,
		ecmp_select: u16,
		nhop_ip: Ipv4Addr,
		nhop_mac: MacAddr,
		port: u16,
	) -> Result<TableEntry, LookupError> {
		let spec = TableEntrySpec {
			table_name: TABLE_ECMP_NHOP.to_owned(),
			match_fields: vec![(
				FIELD_ECMP_SELECT.to_owned(),
				MatchValue::Exact(ecmp_select.to_be_bytes().to_vec()),
			)],
			action_name: ACTION_SET_NHOP.to_owned(),
			action_params: vec![
				(PARAM_NHOP_DMAC.to_owned(), mac_bytes(nhop_mac)),
				(PARAM_NHOP_IPV4.to_owned(), nhop_ip.octets().to_vec()),
				(PARAM_PORT.to_owned(), port.to_be_bytes().to_vec()),
			],
		};
		self.table_entry(&spec)
	}

	pub fn send_frame_rule(&self, egress_port: u16, smac: MacAddr) -> Result<TableEntry, LookupError> {
		let spec = TableEntrySpec {
			table_name: TABLE_SEND_FRAME.to_owned(),
			match_fields: vec![(
				FIELD_EGRESS_PORT.to_owned(),
				MatchValue::Exact(egress_port.to_be_bytes().to_vec()),
			)],
			action_name: ACTION_REWRITE_MAC.to_owned(),
			action_params: vec![(PARAM_SMAC.to_owned(), mac_bytes(smac))],
		};
		self.table_entry(&spec)
	}

	/// Emits the group rule followed by one next-hop rule per member at
	/// contiguous selectors. The group's member count is derived from the
	/// member list, so it cannot drift from the rules actually installed.
	pub fn group_rules(&self, group: &EcmpGroup) -> Result<Vec<TableEntry>, RuleError> {
		if group.members.is_empty() {
			return Err(RuleError::EmptyGroup(group.dst_addr.to_string()));
		}
		let mut entries = Vec::with_capacity(group.members.len() + 1);
		entries.push(self.ecmp_group_rule(
			group.dst_addr,
			group.prefix_len,
			group.ecmp_base,
			group.members.len() as u32,
		)?);
		for (offset, hop) in group.members.iter().enumerate() {
			entries.push(self.ecmp_nhop_rule(
				group.ecmp_base + offset as u16,
				hop.nhop_ip,
				hop.nhop_mac,
				hop.port,
			)?);
		}
		Ok(entries)
	}
}
