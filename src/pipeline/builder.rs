use std::sync::Arc;
use std::time::Duration;

use crate::config::SubscriberConfig;
use crate::error::{FlowError, FlowResult};
use crate::metrics::MetricsSnapshot;
use crate::processor::ItemProcessor;
use crate::publisher::Publisher;
use crate::subscriber::{CompletionSubscriber, Phase};
use crate::subscription::Completion;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub name: String,
    pub subscriber: SubscriberConfig,
    /// Upper bound on [`RunningPipeline::wait`]; `None` waits indefinitely.
    pub completion_timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "unnamed-pipeline".to_string(),
            subscriber: SubscriberConfig::default(),
            completion_timeout: None,
        }
    }
}

/// Wires a publisher to an [`ItemProcessor`] through a [`CompletionSubscriber`].
pub struct FlowPipeline<T> {
    config: PipelineConfig,
    source: Option<(String, Arc<dyn Publisher<T>>)>,
}

impl<T: Send + 'static> FlowPipeline<T> {
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
            source: None,
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.config.name = name.to_string();
        self
    }

    pub fn named_source<P>(mut self, name: &str, publisher: P) -> Self
    where
        P: Publisher<T> + 'static,
    {
        self.source = Some((name.to_string(), Arc::new(publisher)));
        self
    }

    pub fn source<P>(self, publisher: P) -> Self
    where
        P: Publisher<T> + 'static,
    {
        self.named_source("source", publisher)
    }

    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.config.subscriber.max_concurrency = max_concurrency;
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.config.subscriber.chunk_size = chunk_size;
        self
    }

    pub fn completion_timeout(mut self, timeout: Duration) -> Self {
        self.config.completion_timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> FlowResult<()> {
        if self.source.is_none() {
            return Err(FlowError::InvalidConfiguration(format!(
                "pipeline '{}' has no source",
                self.config.name
            )));
        }
        self.config.subscriber.validate()
    }

    /// Subscribe `processor` to the source and start the flow.
    pub fn run<P>(self, processor: P) -> FlowResult<RunningPipeline<P>>
    where
        P: ItemProcessor<Item = T> + 'static,
    {
        self.validate()?;
        let Some((source_name, publisher)) = self.source else {
            return Err(FlowError::InvalidConfiguration("pipeline has no source".to_string()));
        };
        let subscriber = CompletionSubscriber::new(processor, self.config.subscriber)?;
        log::info!(
            "Pipeline '{}': subscribing {} to source '{}'",
            self.config.name,
            subscriber.id(),
            source_name
        );
        let completion = publisher.subscribe(Arc::new(subscriber.clone()));
        Ok(RunningPipeline {
            name: self.config.name,
            timeout: self.config.completion_timeout,
            subscriber,
            completion,
        })
    }

    /// Run `processor` and wait for the pipeline to drain.
    pub async fn run_to_completion<P>(self, processor: P) -> FlowResult<MetricsSnapshot>
    where
        P: ItemProcessor<Item = T> + 'static,
    {
        self.run(processor)?.wait().await
    }
}

impl<T: Send + 'static> Default for FlowPipeline<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A started pipeline.
pub struct RunningPipeline<P> {
    name: String,
    timeout: Option<Duration>,
    subscriber: CompletionSubscriber<P>,
    completion: Completion,
}

impl<P> RunningPipeline<P>
where
    P: ItemProcessor + 'static,
{
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscriber(&self) -> &CompletionSubscriber<P> {
        &self.subscriber
    }

    pub fn phase(&self) -> Phase {
        self.subscriber.phase()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.subscriber.metrics()
    }

    /// Wait for the completion signal, bounded by the configured timeout.
    pub async fn wait(self) -> FlowResult<MetricsSnapshot> {
        match self.timeout {
            Some(timeout) => self.wait_timeout(timeout).await,
            None => {
                let outcome = self.completion.await;
                Self::finish(&self.name, &self.subscriber, outcome)
            }
        }
    }

    /// A timeout does not stop the pipeline; it only stops waiting for it.
    pub async fn wait_timeout(self, timeout: Duration) -> FlowResult<MetricsSnapshot> {
        let outcome = self.completion.with_timeout(timeout).await;
        Self::finish(&self.name, &self.subscriber, outcome)
    }

    fn finish(
        name: &str,
        subscriber: &CompletionSubscriber<P>,
        outcome: FlowResult<()>,
    ) -> FlowResult<MetricsSnapshot> {
        let metrics = subscriber.metrics();
        match outcome {
            Ok(()) => {
                log::info!("Pipeline '{}' drained: {}", name, metrics);
                Ok(metrics)
            }
            Err(e) => {
                log::error!("Pipeline '{}' ended with {}: {}", name, e, metrics);
                Err(e)
            }
        }
    }
}
