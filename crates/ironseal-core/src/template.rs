//! Device-format templates and their resolution into a concrete plan.
//!
//! A template is a JSON document with a `parameters` map and a `dev-format`
//! skeleton. String values in the skeleton may reference parameters with
//! `{name}`, carry an inline fallback with `{name=value}`, or escape a literal
//! brace pair with `{!name}`. Resolution is pure: it never touches a device.

use crate::error::{IronsealError, IronsealResult};
use chrono::{NaiveDate, NaiveDateTime};
use ironseal_provider::{EncryptionKind, FilesystemKind, PartitionSlot, PartitionType, TableKind};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const AUTO_DEVICE: &str = "_dev";
pub const AUTO_MODEL: &str = "_model";
pub const AUTO_SERIAL: &str = "_serial";
const AUTO_PARAMETERS: [&str; 3] = [AUTO_DEVICE, AUTO_MODEL, AUTO_SERIAL];

/// Key under which attested parameter values land in the unprotected metadata.
pub const ATTESTED_KEY: &str = "attested";

const MAX_HYBRID_MEMBERS: usize = 3;
const MAX_DOS_SLOTS: usize = 4;
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DATE_FORMAT: &str = "%Y-%m-%d";

fn placeholder_re() -> &'static Regex {
    static PLACEHOLDER_RE: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER_RE.get_or_init(|| {
        Regex::new(r"\{(!?)([A-Za-z_][A-Za-z0-9_.\-]*)(?:=([^{}]*))?\}")
            .expect("valid placeholder regex")
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterType {
    #[serde(rename = "filesystem")]
    Filesystem,
    #[serde(rename = "encryptiontype")]
    EncryptionType,
    #[serde(rename = "password")]
    Password,
    #[serde(rename = "string", alias = "str")]
    Text,
    #[serde(rename = "timestamp")]
    Timestamp,
    #[serde(rename = "date")]
    Date,
    #[serde(rename = "integer", alias = "int")]
    Integer,
    #[serde(rename = "file-path", alias = "file")]
    FilePath,
    #[serde(rename = "size-in-MB", alias = "size-mb")]
    SizeMb,
}

impl ParameterType {
    fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::SizeMb)
    }

    fn check(self, name: &str, value: &str) -> IronsealResult<()> {
        let reason = match self {
            Self::Filesystem => value.parse::<FilesystemKind>().err().map(|e| e.to_string()),
            Self::EncryptionType => value.parse::<EncryptionKind>().err().map(|e| e.to_string()),
            Self::Timestamp => NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
                .err()
                .map(|_| format!("`{value}` is not a `YYYY-MM-DD HH:MM:SS` timestamp")),
            Self::Date => NaiveDate::parse_from_str(value, DATE_FORMAT)
                .err()
                .map(|_| format!("`{value}` is not a `YYYY-MM-DD` date")),
            Self::Integer | Self::SizeMb => value
                .trim()
                .parse::<u64>()
                .err()
                .map(|_| format!("`{value}` is not an unsigned integer")),
            Self::Password if value.is_empty() => Some("password must not be empty".to_string()),
            Self::Password | Self::Text | Self::FilePath => None,
        };
        match reason {
            Some(reason) => Err(IronsealError::InvalidParameter {
                name: name.to_string(),
                reason,
            }),
            None => Ok(()),
        }
    }
}

/// One declared template parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    #[serde(default)]
    pub descr: String,
    #[serde(rename = "type")]
    pub kind: ParameterType,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub attest: bool,
}

/// Parameterised device format as authored by the image builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatTemplate {
    #[serde(default)]
    pub parameters: BTreeMap<String, Parameter>,
    #[serde(rename = "dev-format")]
    pub dev_format: Value,
}

impl FormatTemplate {
    pub fn from_json(text: &str) -> IronsealResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> IronsealResult<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }
}

/// Which per-partition secret an `@id/field` key refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretField {
    Password,
    Header,
}

/// Parsed `@<partition-id>/<field>` protected-payload key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    pub partition: String,
    pub field: SecretField,
}

impl SecretRef {
    /// Returns `None` for keys that are not `@`-references at all.
    pub fn parse(key: &str) -> Option<IronsealResult<Self>> {
        let body = key.strip_prefix('@')?;
        let parsed = match body.split_once('/') {
            Some((partition, "password")) if !partition.is_empty() => {
                Ok((partition, SecretField::Password))
            }
            Some((partition, "header")) if !partition.is_empty() => {
                Ok((partition, SecretField::Header))
            }
            _ => Err(IronsealError::InvalidLayout(format!(
                "`{key}` must have the form @<partition>/password or @<partition>/header"
            ))),
        };
        Some(parsed.map(|(partition, field)| SecretRef {
            partition: partition.to_string(),
            field,
        }))
    }
}

/// Fully resolved partition entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPlan {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: PartitionType,
    pub label: String,
    pub encryption: Option<EncryptionKind>,
    pub immutable: bool,
    pub filesystem: FilesystemKind,
    /// `None` on an encrypted partition means "generate a random password".
    pub password: Option<String>,
    #[serde(rename = "size-mb")]
    pub size_mb: Option<u64>,
}

/// Credential source for one protected payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DecryptorSpec {
    Password {
        password: String,
    },
    Key {
        #[serde(rename = "key-file")]
        key_file: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignatureSpec {
    Key {
        #[serde(rename = "private-key-file")]
        private_key_file: PathBuf,
    },
}

/// One physical table slot and the partitions sharing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAssignment {
    pub slot: PartitionSlot,
    /// Index into `DeviceFormatPlan::partitions` of the partition written to the slot.
    pub live: usize,
    /// Hybrid members parked behind `live`; never formatted.
    pub dormant: Vec<usize>,
}

/// Output of [`resolve`]: everything the provisioner needs, nothing left symbolic
/// except `@id/field` references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceFormatPlan {
    pub device: String,
    #[serde(rename = "type")]
    pub table: TableKind,
    #[serde(rename = "hybrid-partitions", default)]
    pub hybrid_partitions: Vec<String>,
    pub partitions: Vec<PartitionPlan>,
    pub unprotected: Map<String, Value>,
    pub protected: BTreeMap<String, Map<String, Value>>,
    pub decryptors: BTreeMap<String, DecryptorSpec>,
    pub signatures: BTreeMap<String, SignatureSpec>,
}

impl DeviceFormatPlan {
    pub fn partition(&self, id: &str) -> Option<&PartitionPlan> {
        self.partitions.iter().find(|part| part.id == id)
    }

    /// Hybrid members other than the first listed one stay unmaterialised.
    pub fn is_dormant(&self, id: &str) -> bool {
        self.hybrid_partitions
            .iter()
            .skip(1)
            .any(|member| member == id)
    }

    /// Map partitions onto physical table slots. Hybrid members share one slot
    /// placed where the first of them appears, sized to the largest member.
    pub fn slots(&self) -> Vec<SlotAssignment> {
        let mut assignments: Vec<SlotAssignment> = Vec::new();
        let mut hybrid_slot: Option<usize> = None;

        for (index, part) in self.partitions.iter().enumerate() {
            let is_member = self.hybrid_partitions.iter().any(|m| m == &part.id);
            if is_member {
                if let Some(slot_index) = hybrid_slot {
                    let entry = &mut assignments[slot_index];
                    entry.slot.size_mb = max_size(entry.slot.size_mb, part.size_mb);
                    if self.is_dormant(&part.id) {
                        entry.dormant.push(index);
                    } else {
                        entry.dormant.push(entry.live);
                        entry.live = index;
                        entry.slot.kind = Some(part.kind);
                    }
                    continue;
                }
                hybrid_slot = Some(assignments.len());
            }

            assignments.push(SlotAssignment {
                slot: PartitionSlot {
                    number: assignments.len() as u32 + 1,
                    kind: Some(part.kind),
                    size_mb: part.size_mb,
                },
                live: index,
                dormant: Vec::new(),
            });
        }

        for entry in &mut assignments {
            entry.dormant.sort_unstable();
        }
        assignments
    }

    /// Sum of fixed-size slots, the floor for an unsized slot, and the metadata tail.
    pub fn required_mb(&self, unsized_minimum_mb: u64, metadata_reserved_mb: u64) -> IronsealResult<u64> {
        self.slots()
            .iter()
            .map(|entry| entry.slot.size_mb.unwrap_or(unsized_minimum_mb))
            .try_fold(metadata_reserved_mb, u64::checked_add)
            .ok_or_else(|| IronsealError::InvalidLayout("total partition size overflows".into()))
    }
}

fn max_size(current: Option<u64>, candidate: Option<u64>) -> Option<u64> {
    match (current, candidate) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// Expand `template` with `values` into a validated [`DeviceFormatPlan`].
///
/// Fails with `MissingParameter`, `InvalidParameter`, `CyclicReference` or
/// `InvalidLayout`. Output is deterministic for identical input.
pub fn resolve(
    template: &FormatTemplate,
    values: &BTreeMap<String, String>,
) -> IronsealResult<DeviceFormatPlan> {
    let mut resolver = Resolver {
        template,
        supplied: values,
        resolved: BTreeMap::new(),
        stack: Vec::new(),
    };

    for name in values.keys() {
        if !template.parameters.contains_key(name) && !AUTO_PARAMETERS.contains(&name.as_str()) {
            return Err(IronsealError::InvalidParameter {
                name: name.clone(),
                reason: "not declared by the template".to_string(),
            });
        }
        resolver.lookup(name, None)?;
    }

    let expanded = resolver.expand_value(&template.dev_format)?;
    let raw: RawDevFormat = serde_json::from_value(expanded)
        .map_err(|err| IronsealError::InvalidLayout(format!("dev-format: {err}")))?;

    let mut attested = Map::new();
    for (name, param) in &template.parameters {
        if param.attest {
            attested.insert(name.clone(), Value::String(resolver.lookup(name, None)?));
        }
    }

    build_plan(raw, attested)
}

struct Resolver<'a> {
    template: &'a FormatTemplate,
    supplied: &'a BTreeMap<String, String>,
    resolved: BTreeMap<String, String>,
    stack: Vec<String>,
}

impl Resolver<'_> {
    fn parameter_type(&self, name: &str) -> ParameterType {
        self.template
            .parameters
            .get(name)
            .map(|param| param.kind)
            .unwrap_or(ParameterType::Text)
    }

    fn lookup(&mut self, name: &str, inline_default: Option<&str>) -> IronsealResult<String> {
        if let Some(value) = self.resolved.get(name) {
            return Ok(value.clone());
        }

        let declared = self.template.parameters.get(name);
        let is_auto = AUTO_PARAMETERS.contains(&name);
        if declared.is_none() && !is_auto {
            return Err(IronsealError::MissingParameter(name.to_string()));
        }

        if let Some(pos) = self.stack.iter().position(|entry| entry == name) {
            let mut chain = self.stack[pos..].to_vec();
            chain.push(name.to_string());
            return Err(IronsealError::CyclicReference(chain.join(" -> ")));
        }

        let mut cacheable = true;
        let raw = if let Some(value) = self.supplied.get(name) {
            value.clone()
        } else if let Some(default) = declared.and_then(|param| param.default.as_ref()) {
            default_text(name, default)?
        } else if let Some(inline) = inline_default {
            cacheable = false;
            inline.to_string()
        } else if is_auto && name != AUTO_DEVICE {
            String::new()
        } else {
            return Err(IronsealError::MissingParameter(name.to_string()));
        };

        self.stack.push(name.to_string());
        let expanded = self.expand_text(&raw);
        self.stack.pop();
        let expanded = expanded?;

        self.parameter_type(name).check(name, &expanded)?;
        if cacheable {
            self.resolved.insert(name.to_string(), expanded.clone());
        }
        Ok(expanded)
    }

    fn expand_text(&mut self, text: &str) -> IronsealResult<String> {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in placeholder_re().captures_iter(text) {
            let whole = caps.get(0).map(|m| (m.start(), m.end())).unwrap_or((0, 0));
            out.push_str(&text[last..whole.0]);
            out.push_str(&self.substitute(&caps)?);
            last = whole.1;
        }
        out.push_str(&text[last..]);
        Ok(out)
    }

    fn substitute(&mut self, caps: &Captures<'_>) -> IronsealResult<String> {
        let name = &caps[2];
        if !caps[1].is_empty() {
            return Ok(match caps.get(3) {
                Some(default) => format!("{{{name}={}}}", default.as_str()),
                None => format!("{{{name}}}"),
            });
        }
        self.lookup(name, caps.get(3).map(|m| m.as_str()))
    }

    fn expand_value(&mut self, value: &Value) -> IronsealResult<Value> {
        match value {
            Value::String(text) => self.expand_string(text),
            Value::Array(items) => items
                .iter()
                .map(|item| self.expand_value(item))
                .collect::<IronsealResult<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = Map::new();
                for (key, item) in map {
                    out.insert(key.clone(), self.expand_value(item)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// A string that is exactly one numeric placeholder becomes a JSON number.
    fn expand_string(&mut self, text: &str) -> IronsealResult<Value> {
        if let Some(caps) = placeholder_re().captures(text) {
            let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
            if whole == text && caps[1].is_empty() && self.parameter_type(&caps[2]).is_numeric() {
                let name = caps[2].to_string();
                let resolved = self.substitute(&caps)?;
                let number = resolved.trim().parse::<u64>().map_err(|_| {
                    IronsealError::InvalidParameter {
                        name,
                        reason: format!("`{resolved}` is not an unsigned integer"),
                    }
                })?;
                return Ok(Value::from(number));
            }
        }
        self.expand_text(text).map(Value::String)
    }
}

fn default_text(name: &str, value: &Value) -> IronsealResult<String> {
    match value {
        Value::String(text) => Ok(text.clone()),
        Value::Number(number) => Ok(number.to_string()),
        Value::Bool(flag) => Ok(flag.to_string()),
        _ => Err(IronsealError::InvalidParameter {
            name: name.to_string(),
            reason: "default must be a string, number or boolean".to_string(),
        }),
    }
}

#[derive(Deserialize)]
struct RawDevFormat {
    device: String,
    #[serde(rename = "type")]
    table: String,
    #[serde(rename = "hybrid-partitions", default)]
    hybrid_partitions: Option<Vec<String>>,
    partitions: Vec<RawPartition>,
    #[serde(default)]
    unprotected: Map<String, Value>,
    #[serde(default)]
    protected: BTreeMap<String, Map<String, Value>>,
    #[serde(default)]
    decryptors: BTreeMap<String, DecryptorSpec>,
    #[serde(default)]
    signatures: BTreeMap<String, SignatureSpec>,
}

#[derive(Deserialize)]
struct RawPartition {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    encryption: Option<String>,
    #[serde(default)]
    immutable: bool,
    filesystem: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(rename = "size-mb", default)]
    size_mb: Option<Value>,
}

impl RawPartition {
    fn into_plan(self) -> IronsealResult<PartitionPlan> {
        let encryption = match self.encryption.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(kind) => Some(kind.parse::<EncryptionKind>()?),
        };
        let size_mb = match &self.size_mb {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => Some(n.as_u64().ok_or_else(|| bad_size(&self.id, n))?),
            Some(Value::String(s)) => Some(s.trim().parse().map_err(|_| bad_size(&self.id, s))?),
            Some(other) => return Err(bad_size(&self.id, other)),
        };
        if let Some(size) = size_mb.filter(|size| *size > MAX_SIZE_MB) {
            return Err(bad_size(&self.id, size));
        }
        if encryption.is_none() && self.password.is_some() {
            return Err(IronsealError::InvalidLayout(format!(
                "partition `{}` has a password but no encryption",
                self.id
            )));
        }

        Ok(PartitionPlan {
            kind: self.kind.parse()?,
            filesystem: self.filesystem.parse()?,
            id: self.id,
            label: self.label,
            encryption,
            immutable: self.immutable,
            password: self.password,
            size_mb,
        })
    }
}

/// Upper bound for `size-mb`: one exabyte keeps byte offsets well inside u64.
pub const MAX_SIZE_MB: u64 = 1_000_000_000_000;

fn bad_size(id: &str, value: impl std::fmt::Display) -> IronsealError {
    IronsealError::InvalidLayout(format!("partition `{id}` has invalid size-mb {value}"))
}

fn build_plan(raw: RawDevFormat, attested: Map<String, Value>) -> IronsealResult<DeviceFormatPlan> {
    let table: TableKind = raw.table.parse()?;
    let partitions = raw
        .partitions
        .into_iter()
        .map(RawPartition::into_plan)
        .collect::<IronsealResult<Vec<_>>>()?;

    let mut unprotected = raw.unprotected;
    if !attested.is_empty() {
        match unprotected.get_mut(ATTESTED_KEY) {
            None => {
                unprotected.insert(ATTESTED_KEY.to_string(), Value::Object(attested));
            }
            Some(Value::Object(existing)) => existing.extend(attested),
            Some(_) => {
                return Err(IronsealError::InvalidLayout(format!(
                    "unprotected `{ATTESTED_KEY}` must be an object"
                )))
            }
        }
    }

    let plan = DeviceFormatPlan {
        device: raw.device,
        table,
        hybrid_partitions: raw.hybrid_partitions.clone().unwrap_or_default(),
        partitions,
        unprotected,
        protected: raw.protected,
        decryptors: raw.decryptors,
        signatures: raw.signatures,
    };
    validate_layout(&plan, raw.hybrid_partitions.is_some())?;
    Ok(plan)
}

fn layout_err(message: impl Into<String>) -> IronsealError {
    IronsealError::InvalidLayout(message.into())
}

fn validate_layout(plan: &DeviceFormatPlan, hybrid_declared: bool) -> IronsealResult<()> {
    if plan.device.trim().is_empty() {
        return Err(layout_err("device target is empty"));
    }
    if plan.partitions.is_empty() {
        return Err(layout_err("no partitions declared"));
    }

    let mut ids = BTreeSet::new();
    for part in &plan.partitions {
        if !ids.insert(part.id.as_str()) {
            return Err(layout_err(format!("duplicate partition id `{}`", part.id)));
        }
    }

    let boot = plan.partitions.iter().filter(|p| p.kind.is_boot()).count();
    if boot > 1 {
        return Err(layout_err(format!("{boot} boot-type partitions, at most one allowed")));
    }

    let unsized_parts: Vec<usize> = plan
        .partitions
        .iter()
        .enumerate()
        .filter(|(_, p)| p.size_mb.is_none())
        .map(|(index, _)| index)
        .collect();
    if unsized_parts.len() > 1 {
        return Err(layout_err("more than one partition without size-mb"));
    }
    if let Some(&index) = unsized_parts.first() {
        if index + 1 != plan.partitions.len() {
            return Err(layout_err(format!(
                "unsized partition `{}` must be the last one",
                plan.partitions[index].id
            )));
        }
    }

    match plan.table {
        TableKind::Hybrid => {
            if !hybrid_declared {
                return Err(layout_err("hybrid table requires hybrid-partitions"));
            }
            let members = &plan.hybrid_partitions;
            if members.is_empty() || members.len() > MAX_HYBRID_MEMBERS {
                return Err(layout_err(format!(
                    "hybrid-partitions must list 1 to {MAX_HYBRID_MEMBERS} ids"
                )));
            }
            let mut seen = BTreeSet::new();
            for member in members {
                let part = plan.partition(member).ok_or_else(|| {
                    layout_err(format!("hybrid member `{member}` is not a declared partition"))
                })?;
                if !seen.insert(member.as_str()) {
                    return Err(layout_err(format!("hybrid member `{member}` listed twice")));
                }
                if part.size_mb.is_none() {
                    return Err(layout_err(format!("hybrid member `{member}` must have a size")));
                }
            }
        }
        TableKind::Dos | TableKind::Gpt => {
            if hybrid_declared {
                return Err(layout_err("hybrid-partitions is only valid with a hybrid table"));
            }
        }
    }

    if plan.table == TableKind::Dos && plan.slots().len() > MAX_DOS_SLOTS {
        return Err(layout_err(format!(
            "dos tables hold at most {MAX_DOS_SLOTS} partitions"
        )));
    }

    if plan.decryptors.is_empty() {
        return Err(layout_err("at least one decryptor is required"));
    }
    if plan.signatures.is_empty() {
        return Err(layout_err("at least one signature is required"));
    }
    for name in plan.decryptors.keys() {
        if !plan.protected.contains_key(name) {
            return Err(layout_err(format!("decryptor `{name}` has no protected payload")));
        }
    }

    let mut opened = BTreeSet::new();
    for (name, payload) in &plan.protected {
        if !plan.decryptors.contains_key(name) {
            return Err(layout_err(format!(
                "protected payload `{name}` has no matching decryptor"
            )));
        }
        for (key, value) in payload {
            let Some(reference) = SecretRef::parse(key) else {
                continue;
            };
            let reference = reference?;
            if !value.is_null() {
                return Err(layout_err(format!("`{key}` in `{name}` must have a null value")));
            }
            let part = plan.partition(&reference.partition).ok_or_else(|| {
                layout_err(format!("`{key}` refers to an undeclared partition"))
            })?;
            if part.encryption.is_none() {
                return Err(layout_err(format!(
                    "`{key}` refers to unencrypted partition `{}`",
                    part.id
                )));
            }
            if plan.is_dormant(&part.id) {
                return Err(layout_err(format!(
                    "`{key}` refers to dormant hybrid member `{}`",
                    part.id
                )));
            }
            if reference.field == SecretField::Password {
                opened.insert(part.id.as_str());
            }
        }
    }

    for part in &plan.partitions {
        if part.encryption.is_some() && !plan.is_dormant(&part.id) && !opened.contains(part.id.as_str())
        {
            return Err(layout_err(format!(
                "no decryptor can open encrypted partition `{}`",
                part.id
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn template(parameters: Value, dev_format: Value) -> FormatTemplate {
        serde_json::from_value(json!({ "parameters": parameters, "dev-format": dev_format }))
            .unwrap()
    }

    fn sample() -> FormatTemplate {
        template(
            json!({
                "pw": { "descr": "user password", "type": "password" },
                "size": { "descr": "boot size", "type": "size-in-MB", "default": 256 },
                "created": { "descr": "build date", "type": "timestamp", "attest": true },
                "fs": { "descr": "data filesystem", "type": "filesystem", "default": "ext4" }
            }),
            json!({
                "device": "{_dev}",
                "type": "gpt",
                "partitions": [
                    { "id": "boot", "type": "EFI", "label": "EFI", "filesystem": "fat",
                      "size-mb": "{size}" },
                    { "id": "data", "type": "Linux", "label": "data-{_serial=none}",
                      "encryption": "luks", "filesystem": "{fs}", "password": "{pw}",
                      "size-mb": null }
                ],
                "unprotected": { "config": "{!literal}" },
                "protected": { "user": { "@data/password": null, "note": "hello" } },
                "decryptors": { "user": { "type": "password", "password": "{pw}" } },
                "signatures": { "build": { "type": "key", "private-key-file": "/keys/sign" } }
            }),
        )
    }

    fn sample_values() -> BTreeMap<String, String> {
        values(&[
            ("_dev", "/dev/sdz"),
            ("pw", "abc123"),
            ("created", "2024-02-01 10:00:00"),
        ])
    }

    #[test]
    fn password_scenario() {
        let tpl = sample();
        let mut missing = sample_values();
        missing.remove("pw");
        match resolve(&tpl, &missing) {
            Err(IronsealError::MissingParameter(name)) => assert_eq!(name, "pw"),
            other => panic!("expected missing pw, got {other:?}"),
        }

        let plan = resolve(&tpl, &sample_values()).unwrap();
        let data = plan.partition("data").unwrap();
        assert_eq!(data.password.as_deref(), Some("abc123"));
        assert_eq!(data.filesystem, FilesystemKind::Ext4);
        assert_eq!(
            plan.decryptors["user"],
            DecryptorSpec::Password {
                password: "abc123".into()
            }
        );
    }

    #[test]
    fn resolution_is_deterministic() {
        let tpl = sample();
        let first = serde_json::to_vec(&resolve(&tpl, &sample_values()).unwrap()).unwrap();
        let second = serde_json::to_vec(&resolve(&tpl, &sample_values()).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn numeric_placeholders_escapes_and_inline_defaults() {
        let plan = resolve(&sample(), &sample_values()).unwrap();
        assert_eq!(plan.partition("boot").unwrap().size_mb, Some(256));
        assert_eq!(plan.partition("data").unwrap().label, "data-none");
        assert_eq!(plan.unprotected["config"], json!("{literal}"));
        assert_eq!(
            plan.unprotected[ATTESTED_KEY]["created"],
            json!("2024-02-01 10:00:00")
        );
    }

    #[test]
    fn oversized_partitions_are_layout_errors() {
        let mut huge = sample_values();
        huge.insert("size".into(), u64::MAX.to_string());
        assert!(matches!(
            resolve(&sample(), &huge),
            Err(IronsealError::InvalidLayout(message)) if message.contains("boot")
        ));

        let mut largest = sample_values();
        largest.insert("size".into(), MAX_SIZE_MB.to_string());
        let plan = resolve(&sample(), &largest).unwrap();
        assert_eq!(plan.required_mb(1, 5).unwrap(), MAX_SIZE_MB + 1 + 5);
        assert!(matches!(
            plan.required_mb(1, u64::MAX),
            Err(IronsealError::InvalidLayout(_))
        ));
    }

    #[test]
    fn parameter_types_are_checked() {
        let mut bad = sample_values();
        bad.insert("created".into(), "yesterday".into());
        assert!(matches!(
            resolve(&sample(), &bad),
            Err(IronsealError::InvalidParameter { name, .. }) if name == "created"
        ));

        let mut bad_fs = sample_values();
        bad_fs.insert("fs".into(), "zfs".into());
        assert!(matches!(
            resolve(&sample(), &bad_fs),
            Err(IronsealError::InvalidParameter { .. })
        ));

        let mut unknown = sample_values();
        unknown.insert("typo".into(), "x".into());
        assert!(matches!(
            resolve(&sample(), &unknown),
            Err(IronsealError::InvalidParameter { name, .. }) if name == "typo"
        ));
    }

    #[test]
    fn cycles_are_detected() {
        let tpl = template(
            json!({
                "a": { "type": "string", "default": "x{b}" },
                "b": { "type": "string", "default": "{a}" }
            }),
            json!({ "device": "{a}", "type": "gpt", "partitions": [] }),
        );
        match resolve(&tpl, &BTreeMap::new()) {
            Err(IronsealError::CyclicReference(chain)) => assert_eq!(chain, "a -> b -> a"),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    fn layout_with(partitions: Value, extra: Value) -> FormatTemplate {
        let mut dev = json!({
            "device": "/dev/sdz",
            "type": "dos",
            "partitions": partitions,
            "protected": { "user": { "@data/password": null } },
            "decryptors": { "user": { "type": "password", "password": "pw" } },
            "signatures": { "build": { "type": "key", "private-key-file": "/k" } }
        });
        if let (Value::Object(base), Value::Object(more)) = (&mut dev, extra) {
            base.extend(more);
        }
        template(json!({}), dev)
    }

    fn data_part() -> Value {
        json!({ "id": "data", "type": "LINUX", "encryption": "luks", "filesystem": "ext4" })
    }

    #[test]
    fn rejects_structural_violations() {
        let two_boot = layout_with(
            json!([
                { "id": "a", "type": "EFI", "filesystem": "fat", "size-mb": 10 },
                { "id": "b", "type": "BIOS", "filesystem": "fat", "size-mb": 10 },
                data_part()
            ]),
            json!({}),
        );
        assert!(matches!(
            resolve(&two_boot, &BTreeMap::new()),
            Err(IronsealError::InvalidLayout(_))
        ));

        let two_unsized = layout_with(
            json!([
                { "id": "a", "type": "LINUX", "filesystem": "ext4" },
                data_part()
            ]),
            json!({}),
        );
        assert!(matches!(
            resolve(&two_unsized, &BTreeMap::new()),
            Err(IronsealError::InvalidLayout(_))
        ));

        let undeclared_member = layout_with(
            json!([
                { "id": "a", "type": "LINUX", "filesystem": "ext4", "size-mb": 10 },
                data_part()
            ]),
            json!({ "type": "hybrid", "hybrid-partitions": ["a", "ghost"] }),
        );
        match resolve(&undeclared_member, &BTreeMap::new()) {
            Err(IronsealError::InvalidLayout(msg)) => assert!(msg.contains("ghost")),
            other => panic!("expected layout error, got {other:?}"),
        }
    }

    #[test]
    fn secret_references_must_target_encrypted_partitions() {
        let tpl = layout_with(
            json!([
                { "id": "plain", "type": "LINUX", "filesystem": "ext4", "size-mb": 10 },
                data_part()
            ]),
            json!({ "protected": { "user": { "@data/password": null, "@plain/header": null } } }),
        );
        match resolve(&tpl, &BTreeMap::new()) {
            Err(IronsealError::InvalidLayout(msg)) => assert!(msg.contains("unencrypted")),
            other => panic!("expected layout error, got {other:?}"),
        }

        let orphan = layout_with(json!([data_part()]), json!({ "protected": { "user": {} } }));
        assert!(matches!(
            resolve(&orphan, &BTreeMap::new()),
            Err(IronsealError::InvalidLayout(msg)) if msg.contains("no decryptor can open")
        ));
    }

    #[test]
    fn hybrid_members_share_one_slot() {
        let tpl = layout_with(
            json!([
                { "id": "efi", "type": "EFI", "filesystem": "fat", "size-mb": 100 },
                { "id": "decoy", "type": "LINUX", "filesystem": "exfat", "size-mb": 500 },
                { "id": "real", "type": "LINUX", "filesystem": "ext4", "size-mb": 800 },
                data_part()
            ]),
            json!({ "type": "hybrid", "hybrid-partitions": ["decoy", "real"] }),
        );
        let plan = resolve(&tpl, &BTreeMap::new()).unwrap();
        let slots = plan.slots();
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[1].slot.size_mb, Some(800));
        assert_eq!(slots[1].live, 1);
        assert_eq!(slots[1].dormant, vec![2]);
        assert!(plan.is_dormant("real"));
        assert!(!plan.is_dormant("decoy"));
        assert_eq!(slots[2].slot.number, 3);
        assert_eq!(plan.required_mb(1, 5).unwrap(), 100 + 800 + 1 + 5);
    }

    #[test]
    fn secret_ref_parsing() {
        assert!(SecretRef::parse("plain").is_none());
        let parsed = SecretRef::parse("@data/header").unwrap().unwrap();
        assert_eq!(parsed.partition, "data");
        assert_eq!(parsed.field, SecretField::Header);
        assert!(SecretRef::parse("@data/key").unwrap().is_err());
    }
}
