//! VM operation vocabulary and validation
//!
//! Everything the Intent Resolver extracts from model output arrives here as a
//! [`RawIntent`] and is checked by [`validate`] before the backend sees it.
//! Nothing downstream of this module re-checks names or resource sizes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest VM name Multipass accepts (it must also be a valid hostname)
pub const MAX_NAME_LEN: usize = 63;

/// A validated request to query or mutate VM state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    ListVms,
    CreateVm {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cpus: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        memory_mb: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        disk_gb: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        image: Option<String>,
    },
    StartVm {
        name: String,
    },
    StopVm {
        name: String,
    },
    DeleteVm {
        name: String,
        purge: bool,
    },
    Converse {
        text: String,
    },
}

impl Operation {
    /// Target VM of the operation, if it has one
    pub fn vm_name(&self) -> Option<&str> {
        match self {
            Operation::CreateVm { name, .. }
            | Operation::StartVm { name }
            | Operation::StopVm { name }
            | Operation::DeleteVm { name, .. } => Some(name),
            Operation::ListVms | Operation::Converse { .. } => None,
        }
    }

    /// Whether the operation changes VM state on the backend
    pub fn is_mutating(&self) -> bool {
        self.vm_name().is_some()
    }

    /// Short label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::ListVms => "list_vms",
            Operation::CreateVm { .. } => "create_vm",
            Operation::StartVm { .. } => "start_vm",
            Operation::StopVm { .. } => "stop_vm",
            Operation::DeleteVm { .. } => "delete_vm",
            Operation::Converse { .. } => "converse",
        }
    }
}

/// A numeric field as it may appear in model output: `4096`, `"4096"`, `"4G"`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Quantity {
    Number(f64),
    Text(String),
}

impl From<u64> for Quantity {
    fn from(value: u64) -> Self {
        Quantity::Number(value as f64)
    }
}

impl From<&str> for Quantity {
    fn from(value: &str) -> Self {
        Quantity::Text(value.to_string())
    }
}

impl std::fmt::Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Quantity::Number(n) => write!(f, "{}", n),
            Quantity::Text(s) => f.write_str(s),
        }
    }
}

/// Untrusted structured command, as extracted from model output
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawIntent {
    #[serde(alias = "op", alias = "action", alias = "command")]
    pub operation: String,
    #[serde(default, alias = "vm", alias = "vm_name")]
    pub name: Option<String>,
    #[serde(default, alias = "cpu")]
    pub cpus: Option<Quantity>,
    #[serde(default, alias = "memory", alias = "mem", alias = "memoryMB")]
    pub memory_mb: Option<Quantity>,
    #[serde(default, alias = "disk", alias = "diskGB")]
    pub disk_gb: Option<Quantity>,
    #[serde(default, alias = "release")]
    pub image: Option<String>,
    #[serde(default)]
    pub purge: Option<bool>,
    #[serde(default, alias = "message", alias = "reply")]
    pub text: Option<String>,
}

impl RawIntent {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Self::default()
        }
    }

    pub fn named(operation: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            name: Some(name.into()),
            ..Self::default()
        }
    }
}

/// Why a [`RawIntent`] was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),
    #[error("{operation} requires a VM name")]
    MissingName { operation: &'static str },
    #[error("invalid VM name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
    #[error("{field} has an unreadable value '{value}'")]
    InvalidQuantity { field: &'static str, value: String },
    #[error("invalid image '{0}'")]
    InvalidImage(String),
}

/// Backend-imposed ceilings applied during validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationLimits {
    pub max_cpus: u32,
    /// Multipass refuses instances with less than 128M of memory
    pub min_memory_mb: u64,
    pub max_memory_mb: u64,
    pub max_disk_gb: u64,
}

impl Default for OperationLimits {
    fn default() -> Self {
        Self {
            max_cpus: 16,
            min_memory_mb: 128,
            max_memory_mb: 65536,
            max_disk_gb: 1024,
        }
    }
}

/// Validate against the default limits
pub fn validate(raw: &RawIntent) -> Result<Operation, ValidationError> {
    OperationLimits::default().validate(raw)
}

impl OperationLimits {
    /// Turn an untrusted intent into an [`Operation`], or say why not.
    pub fn validate(&self, raw: &RawIntent) -> Result<Operation, ValidationError> {
        let tag = normalize_tag(&raw.operation);
        match tag.as_str() {
            "list" | "list_vms" | "ls" => Ok(Operation::ListVms),
            "create" | "create_vm" | "launch" => {
                let name = required_name(raw, "create_vm")?;
                let cpus = match &raw.cpus {
                    Some(q) => Some(self.check_cpus(q)?),
                    None => None,
                };
                let memory_mb = match &raw.memory_mb {
                    Some(q) => Some(self.check_memory(q)?),
                    None => None,
                };
                let disk_gb = match &raw.disk_gb {
                    Some(q) => Some(self.check_disk(q)?),
                    None => None,
                };
                let image = match raw.image.as_deref().map(str::trim) {
                    Some(image) if !image.is_empty() => Some(normalize_image(image)?),
                    _ => None,
                };
                Ok(Operation::CreateVm {
                    name,
                    cpus,
                    memory_mb,
                    disk_gb,
                    image,
                })
            }
            "start" | "start_vm" => Ok(Operation::StartVm {
                name: required_name(raw, "start_vm")?,
            }),
            "stop" | "stop_vm" => Ok(Operation::StopVm {
                name: required_name(raw, "stop_vm")?,
            }),
            "delete" | "delete_vm" | "remove" | "rm" => Ok(Operation::DeleteVm {
                name: required_name(raw, "delete_vm")?,
                purge: raw.purge.unwrap_or(true),
            }),
            "converse" | "reply" | "chat" => Ok(Operation::Converse {
                text: raw.text.clone().unwrap_or_default(),
            }),
            _ => Err(ValidationError::UnknownOperation(raw.operation.clone())),
        }
    }

    fn check_cpus(&self, q: &Quantity) -> Result<u32, ValidationError> {
        let value = parse_count(q).ok_or_else(|| ValidationError::InvalidQuantity {
            field: "cpus",
            value: q.to_string(),
        })?;
        in_range("cpus", value, 1, u64::from(self.max_cpus)).map(|v| v as u32)
    }

    fn check_memory(&self, q: &Quantity) -> Result<u64, ValidationError> {
        let value = parse_sized(q, Unit::Mega).ok_or_else(|| ValidationError::InvalidQuantity {
            field: "memory_mb",
            value: q.to_string(),
        })?;
        in_range("memory_mb", value, self.min_memory_mb, self.max_memory_mb)
    }

    fn check_disk(&self, q: &Quantity) -> Result<u64, ValidationError> {
        let value = parse_sized(q, Unit::Giga).ok_or_else(|| ValidationError::InvalidQuantity {
            field: "disk_gb",
            value: q.to_string(),
        })?;
        in_range("disk_gb", value, 1, self.max_disk_gb)
    }
}

fn normalize_tag(tag: &str) -> String {
    tag.trim().to_ascii_lowercase().replace(['-', ' '], "_")
}

fn required_name(raw: &RawIntent, operation: &'static str) -> Result<String, ValidationError> {
    let name = raw
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or(ValidationError::MissingName { operation })?;
    check_name(name)?;
    Ok(name.to_string())
}

/// Names must be usable as a hostname: a leading letter, then letters,
/// digits, `-` or `_`.
pub fn check_name(name: &str) -> Result<(), ValidationError> {
    let invalid = |reason| ValidationError::InvalidName {
        name: name.to_string(),
        reason,
    };
    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("name is longer than 63 characters"));
    }
    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(invalid("name must start with a letter"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(invalid("only letters, digits, '-' and '_' are allowed"));
    }
    if name.ends_with('-') {
        return Err(invalid("name must not end with '-'"));
    }
    Ok(())
}

fn normalize_image(image: &str) -> Result<String, ValidationError> {
    if !image
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-'))
    {
        return Err(ValidationError::InvalidImage(image.to_string()));
    }
    // "ubuntu-22.04" is not an alias Multipass knows; "22.04" is.
    let lowered = image.to_ascii_lowercase();
    match lowered.strip_prefix("ubuntu-") {
        Some(rest) if rest.starts_with(|c: char| c.is_ascii_digit()) => Ok(rest.to_string()),
        _ => Ok(image.to_string()),
    }
}

fn in_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<u64, ValidationError> {
    if value < min || value > max {
        return Err(ValidationError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(value)
}

fn parse_count(q: &Quantity) -> Option<u64> {
    let n = match q {
        Quantity::Number(n) => *n,
        Quantity::Text(s) => s.trim().parse::<f64>().ok()?,
    };
    whole(n)
}

#[derive(Clone, Copy)]
enum Unit {
    Mega,
    Giga,
}

/// Parse `4096`, `"4G"`, `"1.5GB"`, `"512MiB"` into `target` units.
/// Bare numbers are already in `target` units.
fn parse_sized(q: &Quantity, target: Unit) -> Option<u64> {
    let text = match q {
        Quantity::Number(n) => return whole(*n),
        Quantity::Text(s) => s.trim().to_ascii_uppercase(),
    };
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, suffix) = text.split_at(split);
    let number: f64 = number.parse().ok()?;
    let mebibytes = match suffix.trim() {
        "" => {
            return whole(number);
        }
        "M" | "MB" | "MIB" => number,
        "G" | "GB" | "GIB" => number * 1024.0,
        "T" | "TB" | "TIB" => number * 1024.0 * 1024.0,
        _ => return None,
    };
    match target {
        Unit::Mega => whole(mebibytes),
        Unit::Giga => whole(mebibytes / 1024.0),
    }
}

fn whole(n: f64) -> Option<u64> {
    if n.is_finite() && n >= 0.0 && n.fract() == 0.0 && n <= u64::MAX as f64 {
        Some(n as u64)
    } else {
        None
    }
}
