use std::{sync::Mutex, time::Instant};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use super::StreamingSession;

/// Watches a run without changing it. Observers see every chunk in arrival
/// order; transforming text is the job of post-processors.
///
/// An observer runs when the `onStreaming` hook names it or when it is
/// always on.
#[async_trait]
pub trait StreamingObserver: Send + Sync {
    fn name(&self) -> &str;

    fn always_on(&self) -> bool {
        false
    }

    async fn on_before_streaming(&self, _session: &StreamingSession) {}

    async fn on_streaming(&self, _session: &StreamingSession, _chunk: &str) {}

    async fn after_streaming_done(&self, _session: &StreamingSession, _text: &str) {}
}

pub struct LoggingObserver;

#[async_trait]
impl StreamingObserver for LoggingObserver {
    fn name(&self) -> &str {
        "logging"
    }

    async fn on_before_streaming(&self, session: &StreamingSession) {
        info!("streaming started for run {}", session.run_id);
    }

    async fn on_streaming(&self, session: &StreamingSession, chunk: &str) {
        debug!("run {} chunk: {:?}", session.run_id, chunk);
    }

    async fn after_streaming_done(&self, session: &StreamingSession, text: &str) {
        info!("streaming done for run {} ({} bytes)", session.run_id, text.len());
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamingProfile {
    pub chunks: usize,
    pub bytes: usize,
    pub elapsed_ms: u128,
}

/// Counts chunks and bytes and measures the time between the first and the
/// last hook.
#[derive(Default)]
pub struct ProfilingObserver {
    started: Mutex<Option<Instant>>,
    profile: Mutex<StreamingProfile>,
}

impl ProfilingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn profile(&self) -> StreamingProfile {
        self.profile.lock().map(|p| *p).unwrap_or_default()
    }
}

#[async_trait]
impl StreamingObserver for ProfilingObserver {
    fn name(&self) -> &str {
        "profiling"
    }

    fn always_on(&self) -> bool {
        true
    }

    async fn on_before_streaming(&self, _session: &StreamingSession) {
        if let Ok(mut started) = self.started.lock() {
            *started = Some(Instant::now());
        }
        if let Ok(mut profile) = self.profile.lock() {
            *profile = StreamingProfile::default();
        }
    }

    async fn on_streaming(&self, _session: &StreamingSession, chunk: &str) {
        if let Ok(mut profile) = self.profile.lock() {
            profile.chunks += 1;
            profile.bytes += chunk.len();
        }
    }

    async fn after_streaming_done(&self, session: &StreamingSession, _text: &str) {
        let elapsed = self
            .started
            .lock()
            .ok()
            .and_then(|s| *s)
            .map(|s| s.elapsed().as_millis())
            .unwrap_or_default();
        if let Ok(mut profile) = self.profile.lock() {
            profile.elapsed_ms = elapsed;
            info!(
                "run {}: {} chunks, {} bytes in {}ms",
                session.run_id, profile.chunks, profile.bytes, profile.elapsed_ms
            );
        }
    }
}
