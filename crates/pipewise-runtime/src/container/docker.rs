// ABOUTME: ContainerApi implementation backed by the Docker Engine API via bollard.
// ABOUTME: Connects a fresh client per call so no engine handle outlives an operation.

use bollard::errors::Error as BollardError;
use bollard::models::ContainerCreateBody;
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
    InspectNetworkOptions, LogsOptionsBuilder, StartContainerOptions, StopContainerOptionsBuilder,
};
use bollard::Docker;
use futures::{StreamExt, TryStreamExt};
use pipewise_core::run_blocking;

use super::api::{ContainerApi, ContainerApiError, ContainerHandle, ContainerSpec};

/// Seconds Docker waits after SIGTERM before killing a stopped worker.
const STOP_GRACE_SECS: i32 = 10;

const BRIDGE_NETWORK: &str = "bridge";

#[derive(Debug, Clone, Copy, Default)]
pub struct DockerApi;

impl DockerApi {
    pub fn new() -> Self {
        Self
    }
}

fn docker_client() -> Result<Docker, ContainerApiError> {
    Docker::connect_with_local_defaults().map_err(|e| ContainerApiError::Connect(e.to_string()))
}

fn is_not_found_error(error: &BollardError) -> bool {
    match error {
        BollardError::DockerResponseServerError { status_code, .. } => *status_code == 404,
        BollardError::DockerStreamError { error } => {
            let lower = error.to_lowercase();
            lower.contains("not found")
                || lower.contains("manifest unknown")
                || lower.contains("pull access denied")
        }
        _ => false,
    }
}

fn is_not_modified_error(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

fn operation_error(operation: &'static str, target: &str, source: BollardError) -> ContainerApiError {
    if is_not_found_error(&source) {
        ContainerApiError::NotFound(target.to_string())
    } else {
        ContainerApiError::Operation {
            operation,
            target: target.to_string(),
            message: source.to_string(),
        }
    }
}

/// Split `repo[:tag]` without mistaking a registry port for a tag.
fn split_image_tag(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (image, "latest"),
    }
}

/// Append a log frame to `pending` and emit every line it completes.
/// Frames split lines (and UTF-8 sequences) anywhere, so the tail waits for the next frame.
fn drain_lines(pending: &mut Vec<u8>, frame: &[u8], sink: &mut dyn FnMut(&str)) {
    pending.extend_from_slice(frame);
    let mut start = 0;
    while let Some(offset) = pending[start..].iter().position(|&b| b == b'\n') {
        emit_line(&pending[start..start + offset], sink);
        start += offset + 1;
    }
    pending.drain(..start);
}

fn emit_line(line: &[u8], sink: &mut dyn FnMut(&str)) {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    sink(&String::from_utf8_lossy(line));
}

impl ContainerApi for DockerApi {
    fn bridge_gateway(&self) -> Result<Option<String>, ContainerApiError> {
        run_blocking(async {
            let docker = docker_client()?;
            let network = docker
                .inspect_network(BRIDGE_NETWORK, None::<InspectNetworkOptions>)
                .await
                .map_err(|e| operation_error("inspect_network", BRIDGE_NETWORK, e))?;
            Ok(network
                .ipam
                .and_then(|ipam| ipam.config)
                .and_then(|configs| configs.into_iter().find_map(|config| config.gateway)))
        })?
    }

    fn inspect_image(&self, image: &str) -> Result<(), ContainerApiError> {
        run_blocking(async {
            let docker = docker_client()?;
            docker
                .inspect_image(image)
                .await
                .map_err(|e| operation_error("inspect_image", image, e))?;
            Ok(())
        })?
    }

    fn pull_image(&self, image: &str) -> Result<(), ContainerApiError> {
        let (repo, tag) = split_image_tag(image);
        run_blocking(async {
            let docker = docker_client()?;
            docker
                .create_image(
                    Some(
                        CreateImageOptionsBuilder::new()
                            .from_image(repo)
                            .tag(tag)
                            .build(),
                    ),
                    None,
                    None,
                )
                .try_collect::<Vec<_>>()
                .await
                .map_err(|e| operation_error("pull_image", image, e))?;
            Ok(())
        })?
    }

    fn run(&self, spec: &ContainerSpec) -> Result<ContainerHandle, ContainerApiError> {
        let body: ContainerCreateBody =
            serde_json::from_value(spec.create_body()).map_err(|e| ContainerApiError::Operation {
                operation: "create_container",
                target: spec.name.clone(),
                message: format!("invalid create options: {e}"),
            })?;

        run_blocking(async {
            let docker = docker_client()?;
            let created = docker
                .create_container(
                    Some(CreateContainerOptionsBuilder::new().name(&spec.name).build()),
                    body,
                )
                .await
                .map_err(|e| operation_error("create_container", &spec.name, e))?;
            for warning in &created.warnings {
                tracing::warn!(container = %spec.name, warning = %warning, "Docker create warning");
            }

            docker
                .start_container(&spec.name, None::<StartContainerOptions>)
                .await
                .map_err(|e| operation_error("start_container", &spec.name, e))?;

            Ok(ContainerHandle {
                id: created.id,
                name: spec.name.clone(),
            })
        })?
    }

    fn inspect(&self, container: &str) -> Result<String, ContainerApiError> {
        run_blocking(async {
            let docker = docker_client()?;
            let details = docker
                .inspect_container(container, None::<InspectContainerOptions>)
                .await
                .map_err(|e| operation_error("inspect_container", container, e))?;
            Ok(details
                .state
                .and_then(|state| state.status)
                .map(|status| format!("{status:?}").to_lowercase())
                .unwrap_or_else(|| "unknown".to_string()))
        })?
    }

    fn stream_logs(
        &self,
        container: &str,
        sink: &mut dyn FnMut(&str),
    ) -> Result<(), ContainerApiError> {
        run_blocking(async {
            let docker = docker_client()?;
            let options = LogsOptionsBuilder::new()
                .follow(true)
                .stdout(true)
                .stderr(true)
                .build();
            let mut logs = docker.logs(container, Some(options));
            let mut pending = Vec::new();
            while let Some(chunk) = logs.next().await {
                let output = chunk.map_err(|e| operation_error("logs", container, e))?;
                drain_lines(&mut pending, &output.into_bytes(), sink);
            }
            if !pending.is_empty() {
                emit_line(&pending, sink);
            }
            Ok(())
        })?
    }

    fn stop(&self, container: &str) -> Result<(), ContainerApiError> {
        run_blocking(async {
            let docker = docker_client()?;
            match docker
                .stop_container(
                    container,
                    Some(StopContainerOptionsBuilder::new().t(STOP_GRACE_SECS).build()),
                )
                .await
            {
                Ok(()) => Ok(()),
                Err(e) if is_not_modified_error(&e) => Ok(()),
                Err(e) => Err(operation_error("stop_container", container, e)),
            }
        })?
    }
}
