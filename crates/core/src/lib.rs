//! # traj-core — Models
//!
//! Every compute primitive needed to build, train and run the trajectory
//! predictors lives in this crate:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`layers`] | `Dense`, `TrajEncoding`, `OuterLayer`, `MaxPooling2D`, `Flatten`, `GraphConv` |
//! | [`activation`] | `Activation`, transformer `FeedForward` |
//! | [`transform`] | `TransformLayer` (identity / DFT) |
//! | [`attention`] | `MultiHeadAttention` |
//! | [`transformer`] | encoder–decoder `Transformer` used as feature extractor |
//! | [`process`] | move / scale / rotate `Processor` |
//! | [`circle`] | `SocialCircleLayer`, `PhysicalCircleLayer`, `CircleFusionLayer` |
//! | [`model`] | `TrajModel` trait, agent registry |
//! | [`agent`] | `EvAgentModel` (`ev`, `evsc`, `evspc`) |
//! | [`handler`] | `LinearHandler` |
//! | [`silverballers`] | two-stage `SilverballersModel` |
//!
//! Everything goes through `candle-core`/`candle-nn`, so the same code runs
//! on CPU and CUDA.

pub mod activation;
pub mod agent;
pub mod attention;
pub mod circle;
pub mod handler;
pub mod layers;
pub mod model;
pub mod process;
pub mod silverballers;
pub mod transform;
pub mod transformer;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use agent::{CircleMode, EvAgentModel};
pub use handler::LinearHandler;
pub use model::{build_agent_model, count_parameters, AgentKind, ModelOutput, TrajModel};
pub use process::{ProcessState, Processor};
pub use silverballers::SilverballersModel;
pub use transform::TransformLayer;
