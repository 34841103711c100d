// ABOUTME: Container orchestration API seen by the container supervisor.
// ABOUTME: Defines the ContainerApi trait, launch spec, mount parsing, and Docker create-body rendering.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::error::RuntimeError;

/// Host alias that lets a sandboxed worker reach the managing host.
pub const HOST_ALIAS: &str = "host.docker.internal";
const HOST_GATEWAY: &str = "host-gateway";

/// Errors from the orchestration backend. `NotFound` drives normal control
/// flow (pull decisions, liveness) rather than aborting.
#[derive(Error, Debug)]
pub enum ContainerApiError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("failed to connect to container engine: {0}")]
    Connect(String),

    #[error("container engine operation '{operation}' on '{target}' failed: {message}")]
    Operation {
        operation: &'static str,
        target: String,
        message: String,
    },

    #[error("container engine runtime error: {0}")]
    Runtime(#[from] std::io::Error),
}

impl ContainerApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// A launched container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
}

/// One bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub source: PathBuf,
    pub target: String,
    pub mode: String,
}

impl MountSpec {
    /// Parse `source[:target[:mode]]`. Without a target the mount lands at
    /// `/` + the source's base name. Relative sources resolve against the
    /// current directory and `~` is expanded.
    pub fn parse(spec: &str) -> Result<Self, RuntimeError> {
        let mut parts = spec.splitn(3, ':');
        let raw_source = parts
            .next()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| RuntimeError::InvalidMount(spec.to_string()))?;

        let expanded = pipewise_core::expand_tilde(raw_source);
        let source = if expanded.is_absolute() {
            expanded
        } else {
            std::env::current_dir()?.join(expanded)
        };

        let target = match parts.next().filter(|t| !t.is_empty()) {
            Some(target) => target.to_string(),
            None => {
                let base = Path::new(raw_source)
                    .file_name()
                    .ok_or_else(|| RuntimeError::InvalidMount(spec.to_string()))?;
                format!("/{}", base.to_string_lossy())
            }
        };

        let mode = parts
            .next()
            .filter(|m| !m.is_empty())
            .unwrap_or("rw")
            .to_string();

        Ok(Self {
            source,
            target,
            mode,
        })
    }

    /// Create the source directory if it does not exist yet.
    pub fn ensure_source(&self) -> Result<(), RuntimeError> {
        std::fs::create_dir_all(&self.source)?;
        Ok(())
    }

    /// Docker bind string.
    pub fn bind(&self) -> String {
        format!("{}:{}:{}", self.source.display(), self.target, self.mode)
    }
}

/// Everything needed to launch one worker container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    pub args: Vec<String>,
    pub name: String,
    pub mounts: Vec<MountSpec>,
    /// Ports published on the host; `None` under host networking.
    pub ports: Option<Vec<u16>>,
    pub network_mode: Option<String>,
    pub entrypoint: Option<String>,
    pub extra_hosts: BTreeMap<String, String>,
    pub auto_remove: bool,
    /// Extra create options in Docker API field names, merged last.
    pub backend_options: Map<String, Value>,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>, name: impl Into<String>) -> Self {
        let mut extra_hosts = BTreeMap::new();
        extra_hosts.insert(HOST_ALIAS.to_string(), HOST_GATEWAY.to_string());
        Self {
            image: image.into(),
            args: Vec::new(),
            name: name.into(),
            mounts: Vec::new(),
            ports: None,
            network_mode: None,
            entrypoint: None,
            extra_hosts,
            auto_remove: true,
            backend_options: Map::new(),
        }
    }

    /// Render the Docker Engine create-container body.
    pub fn create_body(&self) -> Value {
        let mut host_config = json!({
            "AutoRemove": self.auto_remove,
            "Binds": self.mounts.iter().map(MountSpec::bind).collect::<Vec<_>>(),
            "ExtraHosts": self
                .extra_hosts
                .iter()
                .map(|(host, addr)| format!("{host}:{addr}"))
                .collect::<Vec<_>>(),
        });
        if let Some(mode) = &self.network_mode {
            host_config["NetworkMode"] = json!(mode);
        }

        let mut body = json!({
            "Image": self.image,
            "Cmd": self.args,
        });

        if let Some(ports) = &self.ports {
            let mut exposed = Map::new();
            let mut bindings = Map::new();
            for port in ports {
                let key = format!("{port}/tcp");
                exposed.insert(key.clone(), json!({}));
                bindings.insert(key, json!([{ "HostPort": port.to_string() }]));
            }
            body["ExposedPorts"] = Value::Object(exposed);
            host_config["PortBindings"] = Value::Object(bindings);
        }

        if let Some(entrypoint) = &self.entrypoint {
            body["Entrypoint"] = json!(entrypoint.split_whitespace().collect::<Vec<_>>());
        }

        body["HostConfig"] = host_config;
        merge_json(&mut body, &Value::Object(self.backend_options.clone()));
        body
    }
}

/// Merge `overlay` into `base`, recursing into objects present on both sides.
pub fn merge_json(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let nested = value.is_object() && base.get(key).is_some_and(Value::is_object);
                if nested {
                    if let Some(existing) = base.get_mut(key) {
                        merge_json(existing, value);
                    }
                } else {
                    base.insert(key.clone(), value.clone());
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Container orchestration operations used by the container supervisor.
///
/// Calls block. Implementations must not keep a client handle alive between
/// calls, so a supervisor can move across threads or processes safely.
pub trait ContainerApi: Send + Sync {
    /// Gateway address of the engine's default bridge network.
    fn bridge_gateway(&self) -> Result<Option<String>, ContainerApiError>;

    /// Check that an image exists locally. `NotFound` when it does not.
    fn inspect_image(&self, image: &str) -> Result<(), ContainerApiError>;

    /// Pull an image. `NotFound` when the registry does not have it.
    fn pull_image(&self, image: &str) -> Result<(), ContainerApiError>;

    /// Create and start a detached container.
    fn run(&self, spec: &ContainerSpec) -> Result<ContainerHandle, ContainerApiError>;

    /// Current state of a container. `NotFound` once it is gone.
    fn inspect(&self, container: &str) -> Result<String, ContainerApiError>;

    /// Follow container output, one line per `sink` call, until it ends.
    fn stream_logs(
        &self,
        container: &str,
        sink: &mut dyn FnMut(&str),
    ) -> Result<(), ContainerApiError>;

    fn stop(&self, container: &str) -> Result<(), ContainerApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_default_target_is_base_name() {
        let mount = MountSpec::parse("/data").unwrap();
        assert_eq!(mount.source, PathBuf::from("/data"));
        assert_eq!(mount.target, "/data");
        assert_eq!(mount.mode, "rw");
    }

    #[test]
    fn test_mount_explicit_target() {
        let mount = MountSpec::parse("/data:/in").unwrap();
        assert_eq!(mount.target, "/in");
        assert_eq!(mount.bind(), "/data:/in:rw");

        let mount = MountSpec::parse("/models/bert:/weights:ro").unwrap();
        assert_eq!(mount.target, "/weights");
        assert_eq!(mount.bind(), "/models/bert:/weights:ro");
    }

    #[test]
    fn test_mount_relative_source_is_absolutized() {
        let mount = MountSpec::parse("cache/dir").unwrap();
        assert!(mount.source.is_absolute());
        assert!(mount.source.ends_with("cache/dir"));
        assert_eq!(mount.target, "/dir");
    }

    #[test]
    fn test_mount_rejects_empty_source() {
        assert!(matches!(
            MountSpec::parse(":/in"),
            Err(RuntimeError::InvalidMount(_))
        ));
    }

    #[test]
    fn test_ensure_source_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a").join("b");
        let mount = MountSpec::parse(&source.to_string_lossy()).unwrap();
        mount.ensure_source().unwrap();
        assert!(source.is_dir());
    }

    #[test]
    fn test_create_body_publishes_ports() {
        let mut spec = ContainerSpec::new("encoder:latest", "encoder");
        spec.args = vec!["--port-ctrl".to_string(), "6000".to_string()];
        spec.ports = Some(vec![6000, 6001]);
        spec.mounts = vec![MountSpec::parse("/data:/in").unwrap()];

        let body = spec.create_body();
        assert_eq!(body["Image"], "encoder:latest");
        assert_eq!(body["Cmd"], json!(["--port-ctrl", "6000"]));
        assert_eq!(body["ExposedPorts"]["6001/tcp"], json!({}));
        assert_eq!(
            body["HostConfig"]["PortBindings"]["6000/tcp"],
            json!([{"HostPort": "6000"}])
        );
        assert_eq!(body["HostConfig"]["Binds"], json!(["/data:/in:rw"]));
        assert_eq!(body["HostConfig"]["AutoRemove"], json!(true));
        assert_eq!(
            body["HostConfig"]["ExtraHosts"],
            json!(["host.docker.internal:host-gateway"])
        );
        assert!(body["HostConfig"].get("NetworkMode").is_none());
    }

    #[test]
    fn test_create_body_host_network_skips_ports() {
        let mut spec = ContainerSpec::new("encoder", "encoder");
        spec.network_mode = Some("host".to_string());
        spec.entrypoint = Some("python -m worker".to_string());

        let body = spec.create_body();
        assert!(body.get("ExposedPorts").is_none());
        assert!(body["HostConfig"].get("PortBindings").is_none());
        assert_eq!(body["HostConfig"]["NetworkMode"], "host");
        assert_eq!(body["Entrypoint"], json!(["python", "-m", "worker"]));
    }

    #[test]
    fn test_backend_options_merge_into_body() {
        let mut spec = ContainerSpec::new("encoder", "encoder");
        spec.backend_options = json!({
            "Env": ["MODEL=small"],
            "HostConfig": {"Memory": 1024, "AutoRemove": false}
        })
        .as_object()
        .unwrap()
        .clone();

        let body = spec.create_body();
        assert_eq!(body["Env"], json!(["MODEL=small"]));
        assert_eq!(body["HostConfig"]["Memory"], json!(1024));
        assert_eq!(body["HostConfig"]["AutoRemove"], json!(false));
        assert_eq!(
            body["HostConfig"]["ExtraHosts"],
            json!(["host.docker.internal:host-gateway"])
        );
    }
}
