use virt::connect::Connect;
use virt::domain::Domain;
use virt::domain_snapshot::DomainSnapshot;
use virt::error as virt_error;

use crate::machine::{Machine, MachineError, PowerState, SnapshotInfo};

const GUEST_AGENT_CHANNEL: &str = "org.qemu.guest_agent.0";

/// A libvirt domain resolved once over a single authenticated connection.
pub struct LibvirtMachine {
    conn: Option<Connect>,
    domain: Domain,
    name: String,
    uri: String,
}

impl LibvirtMachine {
    /// Open `uri` and resolve `name`. Authentication is whatever the URI
    /// implies (ssh agent, polkit, SASL client config).
    pub fn connect(uri: &str, name: &str) -> Result<Self, MachineError> {
        // Keep libvirt from printing its own errors to stderr.
        virt_error::clear_error_callback();

        let mut conn = Connect::open(Some(uri)).map_err(|e| MachineError::Connect {
            uri: uri.to_string(),
            message: e.to_string(),
        })?;

        let domain = match Domain::lookup_by_name(&conn, name) {
            Ok(domain) => domain,
            Err(_) => {
                conn.close().ok();
                return Err(MachineError::DomainNotFound {
                    name: name.to_string(),
                    uri: uri.to_string(),
                });
            }
        };

        tracing::info!(uri, domain = name, "domain resolved");
        Ok(Self {
            conn: Some(conn),
            domain,
            name: name.to_string(),
            uri: uri.to_string(),
        })
    }

    fn lookup_snapshot(&self, name: &str) -> Result<DomainSnapshot, MachineError> {
        DomainSnapshot::lookup_by_name(&self.domain, name, 0).map_err(|_| {
            MachineError::SnapshotNotFound {
                name: name.to_string(),
            }
        })
    }

    fn ip_addresses(&self) -> Vec<String> {
        let Ok(ifaces) = self
            .domain
            .interface_addresses(virt::sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE, 0)
        else {
            return Vec::new();
        };
        ifaces
            .iter()
            .flat_map(|iface| iface.addrs.iter().map(|a| a.addr.clone()))
            .collect()
    }
}

impl Machine for LibvirtMachine {
    fn name(&self) -> &str {
        &self.name
    }

    fn power_state(&self) -> Result<PowerState, MachineError> {
        let info = self
            .domain
            .get_info()
            .map_err(|e| MachineError::operation("power state query", e))?;
        Ok(power_state_from_raw(info.state))
    }

    fn start(&mut self) -> Result<(), MachineError> {
        self.domain
            .create()
            .map(|_| ())
            .map_err(|e| MachineError::operation("power on", e))
    }

    fn stop(&mut self) -> Result<(), MachineError> {
        self.domain
            .destroy()
            .map(|_| ())
            .map_err(|e| MachineError::operation("power off", e))
    }

    fn reset(&mut self) -> Result<(), MachineError> {
        self.domain
            .reset()
            .map(|_| ())
            .map_err(|e| MachineError::operation("reset", e))
    }

    fn has_guest_agent(&self) -> Result<bool, MachineError> {
        let xml = self
            .domain
            .get_xml_desc(0)
            .map_err(|e| MachineError::operation("domain XML query", e))?;
        Ok(guest_agent_connected(&xml))
    }

    fn guest_shutdown(&mut self) -> Result<(), MachineError> {
        self.domain
            .shutdown_flags(virt::sys::VIR_DOMAIN_SHUTDOWN_GUEST_AGENT)
            .map(|_| ())
            .map_err(|e| MachineError::operation("guest shutdown", e))
    }

    fn guest_reboot(&mut self) -> Result<(), MachineError> {
        self.domain
            .reboot(virt::sys::VIR_DOMAIN_REBOOT_GUEST_AGENT)
            .map(|_| ())
            .map_err(|e| MachineError::operation("guest reboot", e))
    }

    fn snapshots(&self) -> Result<Vec<SnapshotInfo>, MachineError> {
        let snapshots = self
            .domain
            .list_all_snapshots(0)
            .map_err(|e| MachineError::operation("snapshot listing", e))?;

        let mut out = Vec::with_capacity(snapshots.len());
        for snap in snapshots {
            let name = snap
                .get_name()
                .map_err(|e| MachineError::operation("snapshot listing", e))?;
            let created = snap
                .get_xml_desc(0)
                .ok()
                .and_then(|xml| creation_time(&xml));
            out.push(SnapshotInfo { name, created });
        }
        out.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.name.cmp(&b.name)));
        Ok(out)
    }

    fn create_snapshot(&mut self, name: &str) -> Result<(), MachineError> {
        let xml = format!(
            "<domainsnapshot><name>{name}</name><description>Created by vmctl</description></domainsnapshot>"
        );
        DomainSnapshot::create_xml(&self.domain, &xml, 0)
            .map(|_| ())
            .map_err(|e| MachineError::operation("snapshot creation", e))
    }

    fn delete_snapshot(&mut self, name: &str) -> Result<(), MachineError> {
        let snap = self.lookup_snapshot(name)?;
        // Synchronous: libvirt returns once the snapshot is merged away.
        snap.delete(0)
            .map(|_| ())
            .map_err(|e| MachineError::operation("snapshot deletion", e))
    }

    fn details(&self) -> Result<Vec<(String, String)>, MachineError> {
        let info = self
            .domain
            .get_info()
            .map_err(|e| MachineError::operation("details query", e))?;
        let state = power_state_from_raw(info.state);

        let mut out = vec![
            ("name".to_string(), self.name.clone()),
            ("endpoint".to_string(), self.uri.clone()),
            ("state".to_string(), state.to_string()),
            ("vcpus".to_string(), info.nr_virt_cpu.to_string()),
            ("memory".to_string(), format!("{} MiB", info.memory / 1024)),
            ("max memory".to_string(), format!("{} MiB", info.max_mem / 1024)),
        ];

        if let Ok(uuid) = self.domain.get_uuid_string() {
            out.push(("uuid".into(), uuid));
        }
        if let Ok(os) = self.domain.get_os_type() {
            out.push(("os type".into(), os));
        }
        if let Ok(autostart) = self.domain.get_autostart() {
            out.push(("autostart".into(), autostart.to_string()));
        }
        if let Ok(snapshots) = self.domain.list_all_snapshots(0) {
            out.push(("snapshots".into(), snapshots.len().to_string()));
        }
        if state.is_on() {
            let agent = self.has_guest_agent().unwrap_or(false);
            out.push(("guest agent".into(), if agent { "connected" } else { "unavailable" }.into()));
            let ips = self.ip_addresses();
            if !ips.is_empty() {
                out.push(("addresses".into(), ips.join(", ")));
            }
        }

        Ok(out)
    }

    fn release(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.close() {
                tracing::warn!(uri = %self.uri, error = %e, "failed to close libvirt connection");
            }
        }
    }
}

impl Drop for LibvirtMachine {
    fn drop(&mut self) {
        self.release();
    }
}

/// Map libvirt's raw domain state onto [`PowerState`].
pub fn power_state_from_raw(state: virt::sys::virDomainState) -> PowerState {
    match state {
        virt::sys::VIR_DOMAIN_RUNNING => PowerState::Running,
        virt::sys::VIR_DOMAIN_BLOCKED => PowerState::Running,
        virt::sys::VIR_DOMAIN_PAUSED => PowerState::Paused,
        virt::sys::VIR_DOMAIN_SHUTDOWN => PowerState::ShuttingDown,
        virt::sys::VIR_DOMAIN_SHUTOFF => PowerState::Off,
        virt::sys::VIR_DOMAIN_CRASHED => PowerState::Crashed,
        virt::sys::VIR_DOMAIN_PMSUSPENDED => PowerState::Suspended,
        _ => PowerState::Unknown,
    }
}

/// True when the domain XML declares a guest agent channel whose target
/// reports `state='connected'`.
fn guest_agent_connected(xml: &str) -> bool {
    let Some(pos) = xml.find(GUEST_AGENT_CHANNEL) else {
        return false;
    };
    let start = xml[..pos].rfind('<').unwrap_or(0);
    let end = xml[pos..].find('>').map_or(xml.len(), |i| pos + i);
    let tag = &xml[start..end];
    tag.contains("state='connected'") || tag.contains("state=\"connected\"")
}

/// Extract `<creationTime>` (seconds since epoch) and render it.
fn creation_time(xml: &str) -> Option<String> {
    let start = xml.find("<creationTime>")? + "<creationTime>".len();
    let end = start + xml[start..].find("</creationTime>")?;
    let secs: u64 = xml[start..end].trim().parse().ok()?;
    Some(crate::clock::format_timestamp(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_connected_guest_agent() {
        let xml = r#"<channel type='unix'>
  <source mode='bind'/>
  <target type='virtio' name='org.qemu.guest_agent.0' state='connected'/>
</channel>"#;
        assert!(guest_agent_connected(xml));
    }

    #[test]
    fn disconnected_or_missing_guest_agent() {
        let xml = r#"<target type='virtio' name='org.qemu.guest_agent.0' state='disconnected'/>"#;
        assert!(!guest_agent_connected(xml));
        assert!(!guest_agent_connected("<domain><name>x</name></domain>"));
    }

    #[test]
    fn parses_snapshot_creation_time() {
        let xml = "<domainsnapshot><name>a</name><creationTime>0</creationTime></domainsnapshot>";
        assert_eq!(creation_time(xml), Some("1970-01-01T00-00-00".into()));
        assert_eq!(creation_time("<domainsnapshot/>"), None);
    }

    #[test]
    fn maps_raw_states() {
        assert_eq!(power_state_from_raw(virt::sys::VIR_DOMAIN_RUNNING), PowerState::Running);
        assert_eq!(power_state_from_raw(virt::sys::VIR_DOMAIN_SHUTOFF), PowerState::Off);
        assert!(!power_state_from_raw(virt::sys::VIR_DOMAIN_SHUTOFF).is_on());
    }
}
