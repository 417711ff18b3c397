//! # traj-train — Training Structures
//!
//! Training loop, losses and result output for the trajectory models:
//!
//! * **[`Structure`]** — owns model + variables + optimiser. One call to
//!   [`Structure::step`] runs forward, the moving-average loss, backward and
//!   Adam; [`Structure::train`] adds validation and best-checkpoint saving.
//! * **[`LossSet`]** — weighted ADE / FDE / difference / key-point terms.
//! * **[`silverballers`]** — two-stage agent + handler test structure.
//! * **[`results`]** — per-clip prediction files and `test_results.json`.

pub mod loss;
pub mod results;
pub mod silverballers;
pub mod trainer;

pub use loss::{LossKind, LossMode, LossSet};
pub use results::{TestReport, TEST_RESULTS_FILE};
pub use silverballers::{build_structure as build_silverballers, SilverballersArgs};
pub use trainer::{
    validation_due, weighted_average, BestCheckpoint, Evaluation, LossMovingAverage, RunArgs,
    StepMetrics, Structure, TestMode, TrainState, TrainSummary, TrainerConfig,
};
