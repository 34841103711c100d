// ABOUTME: Worker runtime supervision: spawn, readiness polling, replay, and teardown.
// ABOUTME: One RuntimeSupervisor implementation per worker-hosting strategy.

pub mod container;
pub mod error;
pub mod process;
pub mod supervisor;
pub mod worker;

pub use container::{
    ContainerApi, ContainerApiError, ContainerHandle, ContainerRuntime, ContainerSpec, DockerApi,
    MountSpec,
};
pub use error::RuntimeError;
pub use process::ProcessRuntime;
pub use supervisor::{RuntimeSupervisor, SpawnMode, Stopper, SupervisorSettings};
pub use worker::WorkerProcess;
