// ABOUTME: Record of one supervised worker: identity, control address, liveness, readiness.
// ABOUTME: Keeps readiness false whenever the worker is not alive.

use pipewise_core::ControlAddress;

use crate::container::ContainerHandle;

#[derive(Debug, Clone)]
pub struct WorkerProcess {
    name: String,
    control_address: ControlAddress,
    alive: bool,
    ready: bool,
    isolation: Option<ContainerHandle>,
}

impl WorkerProcess {
    pub fn new(name: impl Into<String>, control_address: ControlAddress) -> Self {
        Self {
            name: name.into(),
            control_address,
            alive: false,
            ready: false,
            isolation: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn control_address(&self) -> &ControlAddress {
        &self.control_address
    }

    pub fn set_control_address(&mut self, address: ControlAddress) {
        self.control_address = address;
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Record liveness. A dead worker is never ready.
    pub fn set_alive(&mut self, alive: bool) {
        self.alive = alive;
        if !alive {
            self.ready = false;
        }
    }

    /// Record a readiness probe. Ignored unless the worker is alive.
    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready && self.alive;
    }

    /// Handle of the sandbox hosting this worker, if it is isolated.
    pub fn isolation(&self) -> Option<&ContainerHandle> {
        self.isolation.as_ref()
    }

    pub fn attach_isolation(&mut self, handle: ContainerHandle) {
        self.isolation = Some(handle);
    }
}
