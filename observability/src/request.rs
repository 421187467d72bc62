use std::{
    future::Future,
    pin::Pin,
    task::{self, Poll},
    time::Instant,
};

use futures::TryFuture;

use crate::{Counter, Histogram, KeyValue, UpDownCounter};

/// Instruments recorded around a remote call.
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    pub duration: Histogram<f64>,
    pub error: Counter<u64>,
    pub in_flight: UpDownCounter<i64>,
}

impl RequestMetrics {
    pub fn new(meter_name: &'static str, metric_name: &'static str) -> Self {
        let meter = crate::meter(meter_name);

        Self {
            duration: meter
                .f64_histogram(format!("{metric_name}.duration"))
                .with_description(format!("{metric_name} duration"))
                .with_unit("s")
                .with_boundaries(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
                ])
                .build(),
            error: meter
                .u64_counter(format!("{metric_name}.error"))
                .with_description(format!("{metric_name} error count"))
                .build(),
            in_flight: meter
                .i64_up_down_counter(format!("{metric_name}.in_flight"))
                .with_description(format!("{metric_name} requests in flight"))
                .build(),
        }
    }
}

/// A future that records its duration and outcome once it resolves.
#[pin_project::pin_project(PinnedDrop)]
pub struct RecordedRequest<T> {
    #[pin]
    inner: T,
    start: Option<Instant>,
    finished: bool,
    metrics: RequestMetrics,
    attributes: Vec<KeyValue>,
}

pub trait RecordRequest: Sized {
    fn record_request(self, metrics: RequestMetrics) -> RecordedRequest<Self> {
        self.record_request_with_attributes(metrics, &[])
    }

    fn record_request_with_attributes(
        self,
        metrics: RequestMetrics,
        attributes: &[KeyValue],
    ) -> RecordedRequest<Self> {
        RecordedRequest {
            inner: self,
            start: None,
            finished: false,
            metrics,
            attributes: attributes.to_vec(),
        }
    }
}

impl<T: Sized> RecordRequest for T {}

impl<T: TryFuture> Future for RecordedRequest<T> {
    type Output = Result<T::Ok, T::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        // The clock starts on first poll, not on construction.
        let start = match *this.start {
            Some(start) => start,
            None => {
                this.metrics.in_flight.add(1, this.attributes);
                let now = Instant::now();
                *this.start = Some(now);
                now
            }
        };

        match this.inner.try_poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(output) => {
                *this.finished = true;
                this.metrics.in_flight.add(-1, this.attributes);
                this.metrics
                    .duration
                    .record(start.elapsed().as_secs_f64(), this.attributes);

                if output.is_err() {
                    this.metrics.error.add(1, this.attributes);
                }

                Poll::Ready(output)
            }
        }
    }
}

#[pin_project::pinned_drop]
impl<T> PinnedDrop for RecordedRequest<T> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if this.start.is_some() && !*this.finished {
            this.metrics.in_flight.add(-1, this.attributes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{RecordRequest, RequestMetrics};

    #[tokio::test]
    async fn test_recorded_request_passes_output_through() {
        let metrics = RequestMetrics::new("test", "test.request");

        let ok: Result<u32, &str> = async { Ok(7) }.record_request(metrics.clone()).await;
        assert_eq!(ok, Ok(7));

        let err: Result<u32, &str> = async { Err("boom") }.record_request(metrics).await;
        assert_eq!(err, Err("boom"));
    }
}
