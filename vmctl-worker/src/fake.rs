//! In-memory `Machine` for exercising the dispatch table and the session
//! loop without a hypervisor.

use crate::machine::{Machine, MachineError, PowerState, SnapshotInfo};

#[derive(Debug, Clone)]
pub struct FakeMachine {
    pub name: String,
    pub power: PowerState,
    pub guest_agent: bool,
    pub snapshots: Vec<SnapshotInfo>,
    /// Number of calls that actually changed power state or snapshots.
    pub state_changes: usize,
    /// When set, every hypervisor call fails with this message.
    pub fail_with: Option<String>,
    /// When set, `details()` panics.
    pub panic_on_details: bool,
    pub released: bool,
}

impl FakeMachine {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            power: PowerState::Running,
            guest_agent: false,
            snapshots: Vec::new(),
            state_changes: 0,
            fail_with: None,
            panic_on_details: false,
            released: false,
        }
    }

    pub fn powered_off(mut self) -> Self {
        self.power = PowerState::Off;
        self
    }

    pub fn with_guest_agent(mut self) -> Self {
        self.guest_agent = true;
        self
    }

    pub fn with_snapshots<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.snapshots.extend(names.into_iter().map(|name| SnapshotInfo {
            name: name.into(),
            created: Some("2026-01-01T00-00-00".into()),
        }));
        self
    }

    fn check(&self, action: &'static str) -> Result<(), MachineError> {
        match &self.fail_with {
            Some(message) => Err(MachineError::Operation {
                action,
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    fn set_power(&mut self, action: &'static str, power: PowerState) -> Result<(), MachineError> {
        self.check(action)?;
        self.power = power;
        self.state_changes += 1;
        Ok(())
    }
}

impl Machine for FakeMachine {
    fn name(&self) -> &str {
        &self.name
    }

    fn power_state(&self) -> Result<PowerState, MachineError> {
        self.check("power state query")?;
        Ok(self.power)
    }

    fn start(&mut self) -> Result<(), MachineError> {
        self.set_power("power on", PowerState::Running)
    }

    fn stop(&mut self) -> Result<(), MachineError> {
        self.set_power("power off", PowerState::Off)
    }

    fn reset(&mut self) -> Result<(), MachineError> {
        self.set_power("reset", PowerState::Running)
    }

    fn has_guest_agent(&self) -> Result<bool, MachineError> {
        self.check("guest agent query")?;
        Ok(self.guest_agent && self.power.is_on())
    }

    fn guest_shutdown(&mut self) -> Result<(), MachineError> {
        self.set_power("guest shutdown", PowerState::Off)
    }

    fn guest_reboot(&mut self) -> Result<(), MachineError> {
        self.set_power("guest reboot", PowerState::Running)
    }

    fn snapshots(&self) -> Result<Vec<SnapshotInfo>, MachineError> {
        self.check("snapshot listing")?;
        Ok(self.snapshots.clone())
    }

    fn create_snapshot(&mut self, name: &str) -> Result<(), MachineError> {
        self.check("snapshot creation")?;
        self.snapshots.push(SnapshotInfo {
            name: name.to_string(),
            created: None,
        });
        self.state_changes += 1;
        Ok(())
    }

    fn delete_snapshot(&mut self, name: &str) -> Result<(), MachineError> {
        self.check("snapshot deletion")?;
        let before = self.snapshots.len();
        self.snapshots.retain(|s| s.name != name);
        if self.snapshots.len() == before {
            return Err(MachineError::SnapshotNotFound {
                name: name.to_string(),
            });
        }
        self.state_changes += 1;
        Ok(())
    }

    fn details(&self) -> Result<Vec<(String, String)>, MachineError> {
        if self.panic_on_details {
            panic!("simulated fault in details");
        }
        self.check("details query")?;
        Ok(vec![
            ("name".into(), self.name.clone()),
            ("state".into(), self.power.to_string()),
            ("snapshots".into(), self.snapshots.len().to_string()),
            ("guest agent".into(), self.guest_agent.to_string()),
        ])
    }

    fn release(&mut self) {
        self.released = true;
    }
}
