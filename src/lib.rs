pub mod config;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod sparse;

pub mod processor;
pub mod subscription;
pub mod subscriber;
pub mod publisher;
pub mod polling;
pub mod lines;

pub mod pipeline;

// Re-export the main types at the crate root
pub use config::{
    Charset, LineConfig, PollingConfig, SubscriberConfig, BACK_PRESSURE_CHUNK_SIZE,
    MAX_PROCESSING_CONCURRENCY,
};
pub use error::{FlowError, FlowResult};
pub use lines::LineSubscriber;
pub use metrics::{FlowMetrics, MetricsSnapshot};
pub use pipeline::{FlowPipeline, PipelineConfig, RunningPipeline};
pub use polling::{PollSource, PollingHandle, PollingPublisher};
pub use processor::{
    aggregate_processor, completed_processor, processor_fn, BoxProcessor, ItemProcessor,
    ItemProcessorExt,
};
pub use publisher::{FlowStream, Publisher, StreamPublisher};
pub use queue::{Queue, QueueError, QueueStats};
pub use sparse::SparseSeq;
pub use subscriber::{CompletionSubscriber, Phase};
pub use subscription::{
    Completion, CompletionSubscription, DemandSubscription, Subscriber, Subscription, TerminalState,
};
