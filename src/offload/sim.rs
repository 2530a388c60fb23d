//! In-process accelerator stand-in.
//!
//! Services requests through the software codec after a latency modeled on
//! the hardware's throughput, so the full dispatch path (submission,
//! deadline, completion) can run without a device attached. This is the
//! default transport when no accelerator is configured explicitly and the
//! one the test suite drives.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use super::software::{self, SoftwareBackend};
use super::{AcceleratorTransport, OffloadError, OffloadRequest, OffloadResponse};

pub struct SimulatedAccelerator {
    backend: SoftwareBackend,
    /// Fixed submission overhead.
    base_latency: Duration,
    /// Modeled processing rate, as nanoseconds per input byte.
    nanos_per_byte: u64,
}

impl Default for SimulatedAccelerator {
    fn default() -> Self {
        // Roughly the original gateware's 10 MB/s crypto throughput.
        Self::new(Duration::from_micros(50), 100)
    }
}

impl SimulatedAccelerator {
    pub fn new(base_latency: Duration, nanos_per_byte: u64) -> Self {
        Self {
            backend: SoftwareBackend::new(),
            base_latency,
            nanos_per_byte,
        }
    }
}

impl AcceleratorTransport for SimulatedAccelerator {
    fn submit(
        &self,
        request: OffloadRequest,
    ) -> Pin<Box<dyn Future<Output = Result<OffloadResponse, OffloadError>> + Send + '_>> {
        let delay = self.base_latency
            + Duration::from_nanos(self.nanos_per_byte * request.input_len() as u64);
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            software::execute(&self.backend, request)
        })
    }
}
