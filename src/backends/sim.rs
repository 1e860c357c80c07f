//! Shared plumbing for the in-process simulated vendor clients.
//!
//! Provides what every simulated client needs:
//! - simulated command latency
//! - failure injection, for the next call or the next call of one operation
//! - a call log for test verification
//! - synthetic frames

use bytes::Bytes;
use rand::Rng;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{AppResult, HalError};
use crate::state::{ImageData, Resolution};

/// Locks a simulator mutex, recovering the data if a test panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct ControlState {
    latency_ms: u64,
    fail_next: bool,
    fail_operations: Vec<String>,
    call_log: Vec<String>,
    refuse_connections: bool,
}

/// Latency, failure injection and call logging, shared between clones.
#[derive(Debug, Clone, Default)]
pub struct SimControl {
    state: Arc<Mutex<ControlState>>,
}

impl SimControl {
    /// No latency, no failures.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set simulated latency in milliseconds.
    pub fn set_latency(&self, ms: u64) {
        lock(&self.state).latency_ms = ms;
    }

    /// Fail the next call, whatever it is.
    pub fn inject_next_failure(&self) {
        lock(&self.state).fail_next = true;
    }

    /// Fail the next call of `operation`.
    pub fn inject_failure(&self, operation: &str) {
        lock(&self.state).fail_operations.push(operation.to_string());
    }

    /// Make every `connect` fail until cleared.
    pub fn refuse_connections(&self, refuse: bool) {
        lock(&self.state).refuse_connections = refuse;
    }

    pub(crate) fn connections_refused(&self) -> bool {
        lock(&self.state).refuse_connections
    }

    /// Calls recorded so far.
    pub fn call_log(&self) -> Vec<String> {
        lock(&self.state).call_log.clone()
    }

    /// Clear the call log.
    pub fn clear_log(&self) {
        lock(&self.state).call_log.clear();
    }

    /// Records `operation`, waits the simulated latency, then consumes any
    /// pending failure for it.
    pub(crate) async fn call(&self, operation: &'static str, detail: String) -> AppResult<()> {
        let latency = {
            let mut state = lock(&self.state);
            if detail.is_empty() {
                state.call_log.push(operation.to_string());
            } else {
                state.call_log.push(format!("{}: {}", operation, detail));
            }
            state.latency_ms
        };

        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let mut state = lock(&self.state);
        if std::mem::take(&mut state.fail_next) {
            return Err(HalError::hardware(operation, "Injected failure"));
        }
        if let Some(idx) = state.fail_operations.iter().position(|op| op == operation) {
            state.fail_operations.remove(idx);
            return Err(HalError::hardware(operation, "Injected failure"));
        }
        Ok(())
    }
}

/// Noise frame with a brighter centre band, 8-bit grayscale.
pub(crate) fn synthetic_frame(resolution: Resolution) -> AppResult<ImageData> {
    let mut rng = rand::thread_rng();
    let mut pixels = vec![0u8; resolution.pixel_count()];
    rng.fill(&mut pixels[..]);

    let width = resolution.width as usize;
    let band = (resolution.height as usize / 3)..(2 * resolution.height as usize / 3);
    for row in band {
        for px in &mut pixels[row * width..(row + 1) * width] {
            *px = px.saturating_add(64);
        }
    }

    ImageData::new(resolution.width, resolution.height, Bytes::from(pixels))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failure_injection_is_consumed() {
        let control = SimControl::new();
        control.inject_next_failure();
        assert!(control.call("connect", String::new()).await.is_err());
        assert!(control.call("connect", String::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_operation_failure_targets_one_call() {
        let control = SimControl::new();
        control.inject_failure("clear_patterns");
        assert!(control.call("start", String::new()).await.is_ok());
        assert!(control.call("clear_patterns", String::new()).await.is_err());
        assert!(control.call("clear_patterns", String::new()).await.is_ok());
        assert_eq!(control.call_log().len(), 3);
    }

    #[tokio::test]
    async fn test_latency() {
        let control = SimControl::new();
        control.set_latency(10);
        let start = std::time::Instant::now();
        control.call("connect", String::new()).await.unwrap();
        assert!(start.elapsed().as_millis() >= 10);
    }

    #[test]
    fn test_synthetic_frame_size() {
        let frame = synthetic_frame(Resolution::new(32, 24)).unwrap();
        assert_eq!(frame.pixels.len(), 32 * 24);
        assert_eq!(frame.resolution(), Resolution::new(32, 24));
    }
}
