//! VAP dispatcher core.
//!
//! Orchestrates a pool of marketplace identities: polls for requested jobs,
//! admits them under rate and capacity limits, runs one sandbox container
//! per active job, routes buyer chat turns into the sandbox and back, and
//! produces signed creation/deletion attestations for every container.

pub mod chat;
pub mod container;
pub mod dispatcher;
pub mod router;

pub use chat::{ChatEvent, ChatHandle};
pub use container::{ContainerManager, StartedContainer};
pub use dispatcher::Dispatcher;
