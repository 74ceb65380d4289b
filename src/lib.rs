pub mod attempt;
pub mod cad_config;
pub mod config;
pub mod design;
pub mod errors;
pub mod executor;
pub mod feedback;
pub mod generator;
pub mod logging;
pub mod parts;
pub mod store;
pub mod util;

pub use design::DesignPipeline;
pub use errors::{ExecutorError, GeneratorError, PipelineError, StoreError};
