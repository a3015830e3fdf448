use async_trait::async_trait;
use rs2_flow::polling::{PollSource, PollingPublisher};
use rs2_flow::processor::{aggregate_processor, processor_fn, ItemProcessorExt};
use rs2_flow::{FlowError, FlowPipeline, FlowResult, PollingConfig, SparseSeq};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::runtime::Runtime;

/// Pretends to be a remote queue returning batches of up to three messages.
struct FakeQueue {
    received: AtomicU32,
}

#[async_trait]
impl PollSource for FakeQueue {
    type Item = SparseSeq<String>;

    async fn init(&self) -> FlowResult<()> {
        println!("Resolved queue url");
        Ok(())
    }

    async fn poll(&self) -> FlowResult<Option<SparseSeq<String>>> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let n = self.received.fetch_add(1, Ordering::SeqCst);
        if n % 4 == 3 {
            return Ok(None);
        }
        Ok(Some(SparseSeq::create(
            (0..3).map(|i| format!("message-{}-{}", n, i)),
        )))
    }
}

fn main() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let publisher = PollingPublisher::new(
            FakeQueue {
                received: AtomicU32::new(0),
            },
            PollingConfig {
                max_polls_per_thread: 4,
                ..PollingConfig::default()
            },
        )
        .unwrap();
        let handle = publisher.handle();

        // Parse each message of a batch; messages ending in "-1" are malformed.
        let parse = processor_fn(|message: String| async move {
            if message.ends_with("-1") {
                Err(FlowError::Validation(format!("cannot parse {}", message)))
            } else {
                Ok(message.to_uppercase())
            }
        });
        let processor = aggregate_processor(parse).apply_with_input(|batch: SparseSeq<String>, parsed| {
            let acknowledged = batch.merge_empties(&parsed);
            println!(
                "Acknowledging {}/{} messages: {:?}",
                acknowledged.present_count(),
                acknowledged.len(),
                acknowledged.iter().collect::<Vec<_>>()
            );
        });

        let running = FlowPipeline::new()
            .name("fake-queue")
            .named_source("fake-queue", publisher)
            .max_concurrency(8)
            .run(processor)
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        handle.shutdown();

        match running.wait_timeout(Duration::from_secs(5)).await {
            Ok(metrics) => println!("Pipeline drained: {}", metrics),
            Err(e) => println!("Pipeline failed: {}", e),
        }
    });
}
