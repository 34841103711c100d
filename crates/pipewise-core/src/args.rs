// ABOUTME: Worker arguments shared by supervisors and the workers they launch.
// ABOUTME: Forwards non-default settings to a worker entry point as CLI tokens.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::address::ControlAddress;

/// Keys that configure the supervisor itself and must never reach the worker,
/// otherwise the worker would try to supervise itself again.
pub const SUPERVISOR_ONLY_KEYS: &[&str] = &[
    "uses",
    "entrypoint",
    "volumes",
    "pull_latest",
    "runtime_cls",
    "docker_kwargs",
];

/// Kind and direction of a worker data socket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SocketKind {
    PullBind,
    PullConnect,
    PushBind,
    PushConnect,
    RouterBind,
    DealerConnect,
    PubBind,
    SubConnect,
}

impl SocketKind {
    /// True when the worker side of the socket listens.
    pub fn is_bind(self) -> bool {
        matches!(
            self,
            Self::PullBind | Self::PushBind | Self::RouterBind | Self::PubBind
        )
    }
}

/// Worker-hosting strategy a supervisor should use.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    #[default]
    Process,
    Container,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerArgs {
    /// Logical worker name; also the source of the container name.
    pub name: Option<String>,

    /// Host the worker binds its sockets on.
    pub host: String,

    pub port_ctrl: u16,
    pub port_in: u16,
    pub port_out: u16,

    pub socket_in: SocketKind,
    pub socket_out: SocketKind,

    /// Serve the control endpoint on a unix socket instead of TCP.
    pub ctrl_with_ipc: bool,

    /// Timeout for one control request, in milliseconds.
    pub timeout_ctrl_ms: u64,

    /// Artifact reference, `docker://image[:tag]` (bare `image` is deprecated).
    pub uses: Option<String>,

    /// Entry point override. For process workers this is the program to run.
    pub entrypoint: Option<String>,

    /// Mount specs in `source[:target]` form.
    pub volumes: Vec<String>,

    /// Pull the image even when it exists locally.
    pub pull_latest: bool,

    pub runtime_cls: RuntimeKind,

    /// Extra Docker create options, in Docker API field names.
    pub docker_kwargs: Map<String, Value>,

    /// Set by the container supervisor on the arguments it forwards.
    pub runs_in_docker: bool,

    /// Worker-specific settings forwarded verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for WorkerArgs {
    fn default() -> Self {
        Self {
            name: None,
            host: crate::address::WILDCARD_HOST.to_string(),
            port_ctrl: 55555,
            port_in: 55556,
            port_out: 55557,
            socket_in: SocketKind::PullBind,
            socket_out: SocketKind::PushBind,
            ctrl_with_ipc: false,
            timeout_ctrl_ms: 5000,
            uses: None,
            entrypoint: None,
            volumes: Vec::new(),
            pull_latest: false,
            runtime_cls: RuntimeKind::default(),
            docker_kwargs: Map::new(),
            runs_in_docker: false,
            extra: BTreeMap::new(),
        }
    }
}

impl WorkerArgs {
    /// Display name, falling back to the runtime kind.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => match self.runtime_cls {
                RuntimeKind::Process => "ProcessRuntime".to_string(),
                RuntimeKind::Container => "ContainerRuntime".to_string(),
            },
        }
    }

    pub fn control_address(&self) -> ControlAddress {
        ControlAddress::for_worker(&self.host, self.port_ctrl, self.ctrl_with_ipc)
    }

    pub fn timeout_ctrl(&self) -> Duration {
        Duration::from_millis(self.timeout_ctrl_ms)
    }
}

/// Render the settings of `args` that differ from the defaults as CLI tokens,
/// skipping [`SUPERVISOR_ONLY_KEYS`]. Output is sorted by key.
pub fn forwarded_args(args: &WorkerArgs) -> Vec<String> {
    let current = to_object(args);
    let defaults = to_object(&WorkerArgs::default());

    let mut entries: Vec<(String, Value)> = current.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut tokens = Vec::new();
    for (key, value) in entries {
        if SUPERVISOR_ONLY_KEYS.contains(&key.as_str()) {
            continue;
        }
        if defaults.get(&key) == Some(&value) {
            continue;
        }
        push_tokens(&mut tokens, &key, value);
    }
    tokens
}

fn to_object(args: &WorkerArgs) -> Map<String, Value> {
    match serde_json::to_value(args) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

fn push_tokens(tokens: &mut Vec<String>, key: &str, value: Value) {
    let flag = format!("--{}", key.replace('_', "-"));
    match value {
        Value::Null | Value::Bool(false) => {}
        Value::Bool(true) => tokens.push(flag),
        Value::Array(items) => {
            tokens.push(flag);
            tokens.extend(items.into_iter().map(scalar_token));
        }
        Value::Object(_) => {
            tokens.push(flag);
            tokens.push(value.to_string());
        }
        other => {
            tokens.push(flag);
            tokens.push(scalar_token(other));
        }
    }
}

fn scalar_token(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_forward_nothing() {
        assert!(forwarded_args(&WorkerArgs::default()).is_empty());
    }

    #[test]
    fn test_supervisor_only_keys_are_dropped() {
        let args = WorkerArgs {
            uses: Some("docker://encoder:latest".to_string()),
            entrypoint: Some("/bin/worker".to_string()),
            volumes: vec!["/data".to_string()],
            pull_latest: true,
            runtime_cls: RuntimeKind::Container,
            docker_kwargs: json!({"Env": ["A=1"]}).as_object().unwrap().clone(),
            ..WorkerArgs::default()
        };
        assert!(forwarded_args(&args).is_empty());
    }

    #[test]
    fn test_non_defaults_render_as_flags() {
        let mut args = WorkerArgs {
            name: Some("encoder".to_string()),
            port_ctrl: 6000,
            socket_in: SocketKind::DealerConnect,
            runs_in_docker: true,
            ..WorkerArgs::default()
        };
        args.extra.insert("replicas".to_string(), json!(3));
        args.extra.insert("uses_with".to_string(), json!({"dim": 128}));
        args.extra.insert("tags".to_string(), json!(["a", "b"]));

        let tokens = forwarded_args(&args);
        assert_eq!(
            tokens,
            vec![
                "--name",
                "encoder",
                "--port-ctrl",
                "6000",
                "--replicas",
                "3",
                "--runs-in-docker",
                "--socket-in",
                "DEALER_CONNECT",
                "--tags",
                "a",
                "b",
                "--uses-with",
                r#"{"dim":128}"#,
            ]
        );
    }

    #[test]
    fn test_false_flags_are_omitted() {
        let mut args = WorkerArgs::default();
        args.extra.insert("quiet".to_string(), json!(false));
        assert!(forwarded_args(&args).is_empty());
    }

    #[test]
    fn test_socket_kind_bind() {
        assert!(SocketKind::PullBind.is_bind());
        assert!(SocketKind::RouterBind.is_bind());
        assert!(!SocketKind::PushConnect.is_bind());
        assert!(!SocketKind::DealerConnect.is_bind());
    }

    #[test]
    fn test_display_name_fallback() {
        let args = WorkerArgs {
            runtime_cls: RuntimeKind::Container,
            ..WorkerArgs::default()
        };
        assert_eq!(args.display_name(), "ContainerRuntime");
    }
}
