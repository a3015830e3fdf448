//! Builder wiring a publisher, a processor and subscriber limits together

pub mod builder;

pub use builder::{FlowPipeline, PipelineConfig, RunningPipeline};
