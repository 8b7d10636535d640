// src/performance/mod.rs
//! # Performance Metrics
//!
//! Frame timing and ray statistics for the renderer. The monitor keeps a ring
//! buffer of recent frame times for averaging and accumulates per-frame
//! marching counts reported by the backend.
//!
//! ## Usage
//!
//! ```rust
//! use volren::performance::{FrameStats, PerformanceMonitor};
//!
//! let mut monitor = PerformanceMonitor::new();
//!
//! monitor.begin_frame();
//! // ... render frame ...
//! monitor.end_frame(FrameStats { rays: 64, samples: 640, terminated_rays: 3 }, false);
//!
//! assert_eq!(monitor.get_metrics().frames, 1);
//! ```

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Marching counts for one frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Rays cast (one per pixel)
    pub rays: u64,
    /// Ray steps that sampled at least one volume; zero when the backend cannot count them
    pub samples: u64,
    /// Rays stopped by the interpreter before leaving the volumes
    pub terminated_rays: u64,
}

/// What one frame cost
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameMetrics {
    pub frame_time_ms: f32,
    pub stats: FrameStats,
    pub rebuilt: bool,
}

/// Aggregated metrics over the monitor's window
#[derive(Debug, Clone)]
pub struct PerformanceMetrics {
    /// Current frames per second
    pub fps: f32,
    /// Average frame time in milliseconds
    pub frame_time_ms: f32,
    /// Minimum frame time in the current window
    pub min_frame_time_ms: f32,
    /// Maximum frame time in the current window
    pub max_frame_time_ms: f32,
    /// Frames recorded since creation or the last reset
    pub frames: u64,
    /// Program rebuilds since creation or the last reset
    pub rebuilds: u64,
    pub total_rays: u64,
    pub total_samples: u64,
    pub total_terminated_rays: u64,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self {
            fps: 0.0,
            frame_time_ms: 0.0,
            min_frame_time_ms: f32::MAX,
            max_frame_time_ms: 0.0,
            frames: 0,
            rebuilds: 0,
            total_rays: 0,
            total_samples: 0,
            total_terminated_rays: 0,
        }
    }
}

impl PerformanceMetrics {
    /// Mean steps per ray over all recorded frames
    pub fn samples_per_ray(&self) -> f32 {
        if self.total_rays == 0 {
            0.0
        } else {
            self.total_samples as f32 / self.total_rays as f32
        }
    }
}

/// Performance monitoring system
pub struct PerformanceMonitor {
    /// Ring buffer of recent frame times for averaging
    frame_times: VecDeque<Duration>,
    /// Maximum number of frame times to keep for averaging
    max_samples: usize,
    /// Start time of the current frame
    frame_start: Option<Instant>,
    current_metrics: PerformanceMetrics,
    last_frame: FrameMetrics,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::with_window(120)
    }

    /// Monitor averaging over the last `max_samples` frames
    pub fn with_window(max_samples: usize) -> Self {
        let max_samples = max_samples.max(1);
        Self {
            frame_times: VecDeque::with_capacity(max_samples),
            max_samples,
            frame_start: None,
            current_metrics: PerformanceMetrics::default(),
            last_frame: FrameMetrics::default(),
        }
    }

    /// Mark the beginning of a frame
    pub fn begin_frame(&mut self) {
        self.frame_start = Some(Instant::now());
    }

    /// Mark the end of a frame and fold its counts into the metrics
    pub fn end_frame(&mut self, stats: FrameStats, rebuilt: bool) -> FrameMetrics {
        let frame_time = self
            .frame_start
            .take()
            .map(|start| start.elapsed())
            .unwrap_or_default();
        self.add_frame_time(frame_time);

        let metrics = &mut self.current_metrics;
        metrics.frames += 1;
        metrics.rebuilds += u64::from(rebuilt);
        metrics.total_rays += stats.rays;
        metrics.total_samples += stats.samples;
        metrics.total_terminated_rays += stats.terminated_rays;
        self.update_timing();

        self.last_frame = FrameMetrics {
            frame_time_ms: frame_time.as_secs_f32() * 1000.0,
            stats,
            rebuilt,
        };
        self.last_frame
    }

    fn add_frame_time(&mut self, frame_time: Duration) {
        if self.frame_times.len() >= self.max_samples {
            self.frame_times.pop_front();
        }
        self.frame_times.push_back(frame_time);
    }

    fn update_timing(&mut self) {
        if self.frame_times.is_empty() {
            return;
        }

        let total_time: Duration = self.frame_times.iter().sum();
        let avg_frame_time_ms = total_time.as_secs_f32() * 1000.0 / self.frame_times.len() as f32;

        self.current_metrics.frame_time_ms = avg_frame_time_ms;
        self.current_metrics.fps = if avg_frame_time_ms > 0.0 {
            1000.0 / avg_frame_time_ms
        } else {
            0.0
        };

        if let (Some(min_time), Some(max_time)) =
            (self.frame_times.iter().min(), self.frame_times.iter().max())
        {
            self.current_metrics.min_frame_time_ms = min_time.as_secs_f32() * 1000.0;
            self.current_metrics.max_frame_time_ms = max_time.as_secs_f32() * 1000.0;
        }
    }

    pub fn get_metrics(&self) -> &PerformanceMetrics {
        &self.current_metrics
    }

    pub fn last_frame(&self) -> FrameMetrics {
        self.last_frame
    }

    /// Frame time history in milliseconds, oldest first
    pub fn get_frame_time_history(&self) -> Vec<f32> {
        self.frame_times
            .iter()
            .map(|duration| duration.as_secs_f32() * 1000.0)
            .collect()
    }

    /// One-line summary for logging
    pub fn summary(&self) -> String {
        let m = &self.current_metrics;
        format!(
            "{} frames, {:.2}ms avg ({:.1} fps), {:.1} samples/ray, {} early terminations, {} rebuilds",
            m.frames,
            m.frame_time_ms,
            m.fps,
            m.samples_per_ray(),
            m.total_terminated_rays,
            m.rebuilds
        )
    }

    /// Reset all metrics and history
    pub fn reset(&mut self) {
        self.frame_times.clear();
        self.current_metrics = PerformanceMetrics::default();
        self.last_frame = FrameMetrics::default();
        self.frame_start = None;
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_accumulate() {
        let mut monitor = PerformanceMonitor::with_window(4);
        for i in 0..6u64 {
            monitor.begin_frame();
            monitor.end_frame(
                FrameStats {
                    rays: 10,
                    samples: 10 * i,
                    terminated_rays: 1,
                },
                i == 0,
            );
        }
        let m = monitor.get_metrics();
        assert_eq!(m.frames, 6);
        assert_eq!(m.rebuilds, 1);
        assert_eq!(m.total_rays, 60);
        assert_eq!(m.total_samples, 150);
        assert_eq!(m.total_terminated_rays, 6);
        assert!((m.samples_per_ray() - 2.5).abs() < 1e-6);
        assert_eq!(monitor.get_frame_time_history().len(), 4);
        assert_eq!(monitor.last_frame().stats.samples, 50);
    }

    #[test]
    fn test_reset_clears_history() {
        let mut monitor = PerformanceMonitor::new();
        monitor.end_frame(FrameStats::default(), true);
        monitor.reset();
        assert_eq!(monitor.get_metrics().frames, 0);
        assert!(monitor.get_frame_time_history().is_empty());
        assert!(monitor.summary().starts_with("0 frames"));
    }
}
