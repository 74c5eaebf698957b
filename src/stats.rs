// src/stats.rs
//! Per-frame counters and a rolling frame-time window.

use std::time::{Duration, Instant};

use crate::error::{ErrorKind, RenderError};

const FRAME_WINDOW: usize = 128;

/// Why one mesh was left out of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeshSkipReason {
    PipelinePending,
    PipelineFailed,
    MissingEnvironment,
    MissingAttributes,
    UnknownMaterial,
    InvalidGeometry,
    AllocationFailure,
    UniformBudget,
    Other,
}

impl MeshSkipReason {
    pub fn from_error(err: &RenderError) -> Self {
        match err.kind() {
            ErrorKind::Allocation => Self::AllocationFailure,
            ErrorKind::PipelineCompile => Self::PipelineFailed,
            ErrorKind::CapacityExceeded => Self::UniformBudget,
            ErrorKind::InvalidInput => Self::InvalidGeometry,
            _ => Self::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PipelinePending => "pipeline pending",
            Self::PipelineFailed => "pipeline failed",
            Self::MissingEnvironment => "missing environment",
            Self::MissingAttributes => "missing vertex attributes",
            Self::UnknownMaterial => "unknown material",
            Self::InvalidGeometry => "invalid geometry",
            Self::AllocationFailure => "allocation failure",
            Self::UniformBudget => "uniform budget exhausted",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SkipCounters {
    pub pipeline_pending: u32,
    pub pipeline_failed: u32,
    pub missing_environment: u32,
    pub missing_attributes: u32,
    pub unknown_material: u32,
    pub invalid_geometry: u32,
    pub allocation_failure: u32,
    pub uniform_budget: u32,
    pub other: u32,
}

impl SkipCounters {
    pub fn record(&mut self, reason: MeshSkipReason) {
        let counter = match reason {
            MeshSkipReason::PipelinePending => &mut self.pipeline_pending,
            MeshSkipReason::PipelineFailed => &mut self.pipeline_failed,
            MeshSkipReason::MissingEnvironment => &mut self.missing_environment,
            MeshSkipReason::MissingAttributes => &mut self.missing_attributes,
            MeshSkipReason::UnknownMaterial => &mut self.unknown_material,
            MeshSkipReason::InvalidGeometry => &mut self.invalid_geometry,
            MeshSkipReason::AllocationFailure => &mut self.allocation_failure,
            MeshSkipReason::UniformBudget => &mut self.uniform_budget,
            MeshSkipReason::Other => &mut self.other,
        };
        *counter += 1;
    }

    pub fn total(&self) -> u32 {
        self.pipeline_pending
            + self.pipeline_failed
            + self.missing_environment
            + self.missing_attributes
            + self.unknown_material
            + self.invalid_geometry
            + self.allocation_failure
            + self.uniform_budget
            + self.other
    }
}

/// Counters of one frame. Reset at frame start, read-only once finalized.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct FrameStats {
    pub frame_index: u64,
    pub draw_calls: u32,
    pub triangles: u64,
    pub total_meshes: usize,
    pub visible_meshes: usize,
    pub culled_meshes: usize,
    pub batches: usize,
    pub buffer_bytes_allocated: u64,
    pub buffer_bytes_disposed: u64,
    pub texture_bytes_allocated: u64,
    pub texture_bytes_disposed: u64,
    pub pipeline_hits: u64,
    pub pipeline_misses: u64,
    pub geometry_hits: u64,
    pub geometry_misses: u64,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub skipped: SkipCounters,
    /// Allocations for the frame itself (uniform buffer, attachments) that
    /// failed and aborted the frame.
    pub frame_allocation_failures: u32,
    pub cpu_time: Duration,
}

#[derive(Debug)]
pub struct RenderStatsTracker {
    frame_times: [f32; FRAME_WINDOW],
    index: usize,
    frames: u64,
    current: FrameStats,
    last: FrameStats,
    frame_start: Option<Instant>,
    allocation_streak: u32,
    allocation_warning_threshold: u32,
    allocation_warning: bool,
}

impl RenderStatsTracker {
    pub fn new(allocation_warning_threshold: u32) -> Self {
        Self {
            frame_times: [0.0; FRAME_WINDOW],
            index: 0,
            frames: 0,
            current: FrameStats::default(),
            last: FrameStats::default(),
            frame_start: None,
            allocation_streak: 0,
            allocation_warning_threshold: allocation_warning_threshold.max(1),
            allocation_warning: false,
        }
    }

    pub fn begin_frame(&mut self, frame_index: u64) {
        self.current = FrameStats {
            frame_index,
            ..FrameStats::default()
        };
        self.frame_start = Some(Instant::now());
    }

    #[inline]
    pub fn current(&mut self) -> &mut FrameStats {
        &mut self.current
    }

    pub fn record_skip(&mut self, reason: MeshSkipReason) {
        self.current.skipped.record(reason);
    }

    /// Record an error that aborted the whole frame. Allocation failures
    /// count toward the allocation warning streak.
    pub fn record_frame_error(&mut self, err: &RenderError) {
        if err.kind() == ErrorKind::Allocation {
            self.current.frame_allocation_failures += 1;
        }
    }

    /// Finalize the frame and return its counters.
    pub fn end_frame(&mut self) -> &FrameStats {
        if let Some(start) = self.frame_start.take() {
            self.current.cpu_time = start.elapsed();
        }
        self.frame_times[self.index] = self.current.cpu_time.as_secs_f32() * 1000.0;
        self.index = (self.index + 1) % FRAME_WINDOW;
        self.frames += 1;

        if self.current.skipped.allocation_failure > 0 || self.current.frame_allocation_failures > 0 {
            self.allocation_streak += 1;
            if self.allocation_streak >= self.allocation_warning_threshold && !self.allocation_warning {
                self.allocation_warning = true;
                log::warn!(
                    "allocation failures in {} consecutive frames; raise the buffer pool ceiling or reduce scene size",
                    self.allocation_streak
                );
            }
        } else {
            self.allocation_streak = 0;
            self.allocation_warning = false;
        }

        self.last = self.current;
        &self.last
    }

    #[inline]
    pub fn last_frame(&self) -> &FrameStats {
        &self.last
    }

    #[inline]
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Raised once allocation failures persist for the configured number of
    /// consecutive frames; cleared by the first clean frame.
    #[inline]
    pub fn allocation_warning(&self) -> bool {
        self.allocation_warning
    }

    #[inline]
    pub fn consecutive_allocation_failures(&self) -> u32 {
        self.allocation_streak
    }

    /// Average frames per second and CPU frame time (ms) over the window.
    pub fn averaged(&self) -> (f32, f32) {
        let mut sum = 0.0f32;
        let mut count = 0;
        for &v in &self.frame_times {
            if v > 0.0 {
                sum += v;
                count += 1;
            }
        }
        if count == 0 {
            return (0.0, 0.0);
        }
        let avg_ms = sum / count as f32;
        (1000.0 / avg_ms, avg_ms)
    }

    pub fn log_every(&self, every: u64) {
        if every > 0 && self.frames % every == 0 {
            let (fps, ms) = self.averaged();
            let last = &self.last;
            log::info!(
                "frame {}: {:.1} fps, {:.3} ms cpu, {} draws, {} batches, {}/{} visible",
                last.frame_index,
                fps,
                ms,
                last.draw_calls,
                last.batches,
                last.visible_meshes,
                last.total_meshes
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_reset_at_frame_start() {
        let mut tracker = RenderStatsTracker::new(3);
        tracker.begin_frame(1);
        tracker.current().draw_calls = 5;
        tracker.record_skip(MeshSkipReason::PipelinePending);
        let stats = *tracker.end_frame();
        assert_eq!(stats.draw_calls, 5);
        assert_eq!(stats.skipped.total(), 1);

        tracker.begin_frame(2);
        assert_eq!(tracker.current().draw_calls, 0);
        assert_eq!(tracker.last_frame().draw_calls, 5);
    }

    #[test]
    fn allocation_warning_needs_consecutive_frames() {
        let mut tracker = RenderStatsTracker::new(2);
        let failing_frame = |tracker: &mut RenderStatsTracker, index| {
            tracker.begin_frame(index);
            tracker.record_skip(MeshSkipReason::AllocationFailure);
            tracker.end_frame();
        };
        failing_frame(&mut tracker, 0);
        assert!(!tracker.allocation_warning());
        failing_frame(&mut tracker, 1);
        assert!(tracker.allocation_warning());

        tracker.begin_frame(2);
        tracker.end_frame();
        assert!(!tracker.allocation_warning());
        assert_eq!(tracker.consecutive_allocation_failures(), 0);
    }

    #[test]
    fn aborted_frames_feed_the_allocation_streak() {
        let mut tracker = RenderStatsTracker::new(2);
        for index in 0..2 {
            tracker.begin_frame(index);
            tracker.record_frame_error(&RenderError::allocation("depth_target", 1 << 20, "out of memory"));
            tracker.end_frame();
        }
        assert!(tracker.allocation_warning());
        assert_eq!(tracker.last_frame().frame_allocation_failures, 1);

        tracker.begin_frame(2);
        tracker.record_frame_error(&RenderError::custom("encoder failed"));
        tracker.end_frame();
        assert_eq!(tracker.consecutive_allocation_failures(), 0);
    }

    #[test]
    fn skip_reason_follows_error_kind() {
        let err = RenderError::allocation("vertex", 64, "out of memory").context("mesh 3");
        assert_eq!(MeshSkipReason::from_error(&err), MeshSkipReason::AllocationFailure);
        let err = RenderError::InvalidGeometry {
            geometry: 1,
            reason: "empty".into(),
        };
        assert_eq!(MeshSkipReason::from_error(&err), MeshSkipReason::InvalidGeometry);
    }

    #[test]
    fn averaged_ignores_empty_slots() {
        let mut tracker = RenderStatsTracker::new(1);
        assert_eq!(tracker.averaged(), (0.0, 0.0));
        tracker.frame_times[0] = 10.0;
        tracker.frame_times[1] = 30.0;
        let (fps, ms) = tracker.averaged();
        assert!((ms - 20.0).abs() < 1e-4);
        assert!((fps - 50.0).abs() < 1e-3);
    }
}
