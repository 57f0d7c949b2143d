//! VM record - the inventory's view of a single instance
//!
//! Each VmRecord tracks one VM throughout its lifecycle:
//! Provisioning -> Running <-> Stopped -> Deleting (removed)

use serde::{Deserialize, Serialize};

/// Lifecycle status of a VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    /// Create accepted, backend has not confirmed the instance yet
    Provisioning,
    /// Backend reports the instance as running
    Running,
    /// Backend reports the instance as stopped (or suspended)
    Stopped,
    /// Delete in progress or instance marked deleted
    Deleting,
    /// Backend reported a state we do not model
    Unknown,
}

impl VmStatus {
    /// Map a Multipass state string ("Running", "Stopped", ...) to a status
    pub fn from_backend(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "running" => VmStatus::Running,
            "stopped" | "suspended" | "suspending" | "off" => VmStatus::Stopped,
            "starting" | "restarting" | "creating" | "provisioning" => VmStatus::Provisioning,
            "deleted" | "deleting" => VmStatus::Deleting,
            _ => VmStatus::Unknown,
        }
    }

    /// Settled states are the ones a VM rests in between operations
    pub fn is_settled(self) -> bool {
        matches!(self, VmStatus::Running | VmStatus::Stopped)
    }
}

/// One VM as known to the inventory
///
/// Resource fields are `0` when the backend did not report them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    pub name: String,
    pub status: VmStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    pub cpus: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
}

impl VmRecord {
    /// Create a record with only a name and status
    pub fn new(name: impl Into<String>, status: VmStatus) -> Self {
        Self {
            name: name.into(),
            status,
            ip_address: None,
            cpus: 0,
            memory_mb: 0,
            disk_gb: 0,
            release: None,
        }
    }

    pub fn with_resources(mut self, cpus: u32, memory_mb: u64, disk_gb: u64) -> Self {
        self.cpus = cpus;
        self.memory_mb = memory_mb;
        self.disk_gb = disk_gb;
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    /// Fill fields this record does not know from an older record of the same VM
    pub fn merge_missing(mut self, previous: &VmRecord) -> Self {
        if self.cpus == 0 {
            self.cpus = previous.cpus;
        }
        if self.memory_mb == 0 {
            self.memory_mb = previous.memory_mb;
        }
        if self.disk_gb == 0 {
            self.disk_gb = previous.disk_gb;
        }
        if self.release.is_none() {
            self.release = previous.release.clone();
        }
        // A stopped VM has no address; don't resurrect the old one.
        if self.ip_address.is_none() && self.status == VmStatus::Running {
            self.ip_address = previous.ip_address.clone();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(VmStatus::from_backend("Running"), VmStatus::Running);
        assert_eq!(VmStatus::from_backend("Suspended"), VmStatus::Stopped);
        assert_eq!(VmStatus::from_backend("Starting"), VmStatus::Provisioning);
        assert_eq!(VmStatus::from_backend("Deleted"), VmStatus::Deleting);
        assert_eq!(VmStatus::from_backend("Frobnicating"), VmStatus::Unknown);
    }

    #[test]
    fn test_merge_missing() {
        let old = VmRecord::new("a", VmStatus::Running)
            .with_resources(2, 4096, 20)
            .with_ip("10.0.0.2");
        let stopped = VmRecord::new("a", VmStatus::Stopped).merge_missing(&old);
        assert_eq!(stopped.cpus, 2);
        assert_eq!(stopped.memory_mb, 4096);
        assert!(stopped.ip_address.is_none());

        let running = VmRecord::new("a", VmStatus::Running).merge_missing(&old);
        assert_eq!(running.ip_address.as_deref(), Some("10.0.0.2"));
    }
}
