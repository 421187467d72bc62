use evm_sync_observability::{Counter, Histogram, RequestMetrics};

#[derive(Debug, Clone)]
pub struct DispatcherMetrics {
    /// Time between enqueueing a request and a worker picking it up.
    pub queue_lag: Histogram<f64>,
    /// Duration and errors of every single attempt.
    pub rpc: RequestMetrics,
    pub retries: Counter<u64>,
}

impl Default for DispatcherMetrics {
    fn default() -> Self {
        let meter = evm_sync_observability::meter("evm_sync_rpc");

        Self {
            queue_lag: meter
                .f64_histogram("evm_sync.rpc.queue_lag")
                .with_description("time a request waits in the queue before being sent")
                .with_unit("s")
                .with_boundaries(vec![
                    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
                ])
                .build(),
            rpc: RequestMetrics::new("evm_sync_rpc", "evm_sync.rpc.request"),
            retries: meter
                .u64_counter("evm_sync.rpc.retries")
                .with_description("number of retried rpc requests")
                .build(),
        }
    }
}
