//! # traj-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`ModelConfig`]** / **[`InputType`]** — model hyper-parameters and the
//!   tensor kinds a model consumes (serialised as JSON).
//! * **[`Registry`]** — dataset splits and clip descriptors.
//! * **[`Agent`]** — one sample; sampled from annotations and cached on disk.
//! * **[`maps`]** — segmentation maps, loaded or built from trajectories.
//! * **[`AgentManager`]** / **[`TensorDataset`]** / **[`DatasetManager`]** —
//!   loading and batching.

pub mod agent;
pub mod config;
pub mod data;
pub mod maps;
pub mod registry;

pub use agent::{Agent, Annotation, INIT_POSITION, PADDING_THRESHOLD};
pub use config::{parse_input_types, InputType, ModelConfig, Preprocess, TransformKind};
pub use data::{AgentManager, DatasetManager, LoadMode, TensorDataset};
pub use registry::{ClipInfo, DatasetSplit, Registry};
