// ABOUTME: Container-hosted worker supervisor.
// ABOUTME: Resolves networking and images, translates mounts and ports, and launches the worker container.

mod api;
mod docker;
pub mod network;

pub use api::{
    merge_json, ContainerApi, ContainerApiError, ContainerHandle, ContainerSpec, MountSpec,
    HOST_ALIAS,
};
pub use docker::DockerApi;

use std::sync::Arc;

use pipewise_control::ControlChannel;
use pipewise_core::{forwarded_args, slugify, ControlAddress, WorkerArgs};

use crate::error::RuntimeError;
use crate::supervisor::{RuntimeSupervisor, SpawnMode, Stopper, SupervisorSettings};
use crate::worker::WorkerProcess;

/// Preferred artifact reference scheme.
pub const IMAGE_SCHEME: &str = "docker://";

/// Strip the `docker://` scheme from an artifact reference. Bare references are
/// accepted with a deprecation warning.
pub fn resolve_image(uses: &str) -> String {
    match uses.strip_prefix(IMAGE_SCHEME) {
        Some(image) => {
            tracing::debug!(image = %image, "Using Docker image");
            image.to_string()
        }
        None => {
            tracing::warn!(
                uses = %uses,
                "Legacy image reference is ambiguous, use \"{IMAGE_SCHEME}{uses}\" instead"
            );
            uses.to_string()
        }
    }
}

/// Ports the worker listens on that must be published: control always,
/// data ports only when the worker binds them.
pub fn exposed_ports(args: &WorkerArgs) -> Vec<u16> {
    let mut ports = vec![args.port_ctrl];
    if args.socket_in.is_bind() {
        ports.push(args.port_in);
    }
    if args.socket_out.is_bind() {
        ports.push(args.port_out);
    }
    ports
}

/// Supervisor for a worker running inside a container.
pub struct ContainerRuntime {
    args: WorkerArgs,
    settings: SupervisorSettings,
    worker: WorkerProcess,
    api: Arc<dyn ContainerApi>,
    control: Arc<dyn ControlChannel>,
    host_network: bool,
    network_mode: Option<String>,
}

impl ContainerRuntime {
    /// Prepare a supervisor without spawning anything.
    pub fn new(
        args: WorkerArgs,
        api: Arc<dyn ContainerApi>,
        control: Arc<dyn ControlChannel>,
    ) -> Self {
        let worker = WorkerProcess::new(args.display_name(), args.control_address());
        Self {
            settings: SupervisorSettings::from_args(&args),
            args,
            worker,
            api,
            control,
            host_network: network::host_needs_host_network(),
            network_mode: None,
        }
    }

    /// Build, spawn, and wait for readiness in one step.
    pub fn launch(
        args: WorkerArgs,
        api: Arc<dyn ContainerApi>,
        control: Arc<dyn ControlChannel>,
    ) -> Result<Self, RuntimeError> {
        Self::new(args, api, control).start()
    }

    pub fn with_settings(mut self, settings: SupervisorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Override host-network detection.
    pub fn with_host_network(mut self, host_network: bool) -> Self {
        self.host_network = host_network;
        self
    }

    /// Resolve networking, spawn the worker, and block until it is ready.
    pub fn start(mut self) -> Result<Self, RuntimeError> {
        self.resolve_network();
        self.boot()?;
        Ok(self)
    }

    pub fn args(&self) -> &WorkerArgs {
        &self.args
    }

    pub fn network_mode(&self) -> Option<&str> {
        self.network_mode.as_deref()
    }

    /// Switch to host networking and dial the bridge gateway, when the host needs it.
    /// Discovery failures keep the configured control address.
    fn resolve_network(&mut self) {
        self.network_mode = None;
        if !self.host_network {
            return;
        }
        self.network_mode = Some(network::HOST_NETWORK_MODE.to_string());

        match self.api.bridge_gateway() {
            Ok(Some(gateway)) => {
                let address =
                    ControlAddress::for_worker(&gateway, self.args.port_ctrl, self.args.ctrl_with_ipc);
                tracing::debug!(address = %address, "Using bridge gateway for control address");
                self.worker.set_control_address(address);
            }
            Ok(None) => tracing::warn!(
                address = %self.worker.control_address(),
                "Bridge network has no gateway, keeping control address"
            ),
            Err(e) => tracing::warn!(
                error = %e,
                address = %self.worker.control_address(),
                "Unable to set control address from bridge network"
            ),
        }
    }

    /// Make sure the image is available, pulling it when missing or when
    /// `pull_latest` is set.
    fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        let mut missing = match self.api.inspect_image(image) {
            Ok(()) => false,
            Err(e) if e.is_not_found() => {
                tracing::error!(image = %image, "Can not find local image");
                true
            }
            Err(e) => return Err(e.into()),
        };

        if self.args.pull_latest || missing {
            tracing::warn!(
                image = %image,
                "Pulling image, this could take a while; raise the ready timeout if startup times out"
            );
            match self.api.pull_image(image) {
                Ok(()) => missing = false,
                Err(e) if e.is_not_found() => {
                    tracing::error!(image = %image, "Can not find remote image");
                    missing = true;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if missing {
            return Err(RuntimeError::ImageNotFound {
                image: image.to_string(),
            });
        }
        Ok(())
    }

    /// Build the launch spec for the current configuration.
    pub fn container_spec(&self) -> Result<ContainerSpec, RuntimeError> {
        let uses = self
            .args
            .uses
            .as_deref()
            .ok_or_else(|| RuntimeError::MissingImage(self.worker.name().to_string()))?;
        let image = resolve_image(uses);

        let mut spec = ContainerSpec::new(image, slugify(self.worker.name()));

        let mut forwarded = self.args.clone();
        forwarded.runs_in_docker = true;
        spec.args = forwarded_args(&forwarded);

        spec.mounts = self
            .args
            .volumes
            .iter()
            .map(|volume| MountSpec::parse(volume))
            .collect::<Result<_, _>>()?;

        spec.network_mode = self.network_mode.clone();
        spec.ports = if spec.network_mode.is_some() {
            None
        } else {
            Some(exposed_ports(&self.args))
        };
        spec.entrypoint = self.args.entrypoint.clone();
        spec.backend_options = self.args.docker_kwargs.clone();
        Ok(spec)
    }
}

impl RuntimeSupervisor for ContainerRuntime {
    fn worker(&self) -> &WorkerProcess {
        &self.worker
    }

    fn worker_mut(&mut self) -> &mut WorkerProcess {
        &mut self.worker
    }

    fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    fn control(&self) -> &dyn ControlChannel {
        self.control.as_ref()
    }

    fn spawn(&mut self, mode: SpawnMode) -> Result<(), RuntimeError> {
        let spec = self.container_spec()?;
        self.ensure_image(&spec.image)?;
        for mount in &spec.mounts {
            mount.ensure_source()?;
        }

        let handle = self.api.run(&spec)?;
        tracing::info!(
            worker = %self.worker.name(),
            container = %handle.name,
            image = %spec.image,
            replay = mode == SpawnMode::Replay,
            "Started worker container"
        );
        self.worker.attach_isolation(handle);
        self.worker.set_alive(true);
        Ok(())
    }

    fn is_alive(&mut self) -> Result<bool, RuntimeError> {
        let Some(handle) = self.worker.isolation() else {
            return Ok(false);
        };
        // Any container the engine still knows about counts, whatever its state.
        match self.api.inspect(&handle.id) {
            Ok(status) => {
                tracing::trace!(container = %handle.name, status = %status, "Container inspected");
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn stop_worker(&mut self) -> Result<(), RuntimeError> {
        match self.worker.isolation() {
            Some(handle) => stop_container(self.api.as_ref(), &handle.id),
            None => Ok(()),
        }
    }

    fn stream_output(&mut self, sink: &mut dyn FnMut(&str)) -> Result<(), RuntimeError> {
        let Some(handle) = self.worker.isolation() else {
            return Ok(());
        };
        match self.api.stream_logs(&handle.id, sink) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn stopper(&self) -> Arc<dyn Stopper> {
        Arc::new(ContainerStopper {
            api: Arc::clone(&self.api),
            container: self.worker.isolation().map(|handle| handle.id.clone()),
        })
    }
}

fn stop_container(api: &dyn ContainerApi, container: &str) -> Result<(), RuntimeError> {
    match api.stop(container) {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => {
            tracing::debug!(container = %container, "Container already gone");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

struct ContainerStopper {
    api: Arc<dyn ContainerApi>,
    container: Option<String>,
}

impl Stopper for ContainerStopper {
    fn stop(&self) -> Result<(), RuntimeError> {
        match &self.container {
            Some(container) => stop_container(self.api.as_ref(), container),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewise_core::SocketKind;

    #[test]
    fn test_resolve_image_strips_scheme() {
        assert_eq!(resolve_image("docker://encoder:1.0"), "encoder:1.0");
    }

    #[test]
    fn test_resolve_image_accepts_legacy_reference() {
        assert_eq!(resolve_image("encoder:1.0"), "encoder:1.0");
    }

    #[test]
    fn test_exposed_ports_follow_bind_sockets() {
        let args = WorkerArgs {
            port_ctrl: 6000,
            port_in: 6001,
            port_out: 6002,
            socket_in: SocketKind::PullBind,
            socket_out: SocketKind::PushConnect,
            ..WorkerArgs::default()
        };
        assert_eq!(exposed_ports(&args), vec![6000, 6001]);

        let args = WorkerArgs {
            socket_in: SocketKind::DealerConnect,
            socket_out: SocketKind::PushConnect,
            ..args
        };
        assert_eq!(exposed_ports(&args), vec![6000]);
    }
}
