// src/transfer_function/mod.rs
//! # Transfer Functions
//!
//! Maps scalar intensity to straight-alpha RGBA. A transfer function is an
//! ordered list of [`ControlPoint`]s with strictly increasing intensities plus
//! one active [`Sampler`] strategy that decides how ray samples read it.
//!
//! Lookups never walk the control points on the per-sample path. Every edit
//! rebuilds a discretized table spanning the domain (see
//! [`TransferFunctionTables`]) and sampling becomes table indexing with linear
//! interpolation between entries.
//!
//! ## Usage
//!
//! ```
//! use volren::transfer_function::{ControlPoint, Sampler, TransferFunction};
//! use cgmath::Vector4;
//!
//! let mut tf = TransferFunction::new(vec![
//!     ControlPoint::new(0.0, Vector4::new(0.0, 0.0, 0.0, 0.0)),
//!     ControlPoint::new(1.0, Vector4::new(1.0, 1.0, 1.0, 1.0)),
//! ])?;
//! tf.set_sampler(Sampler::PreIntegrated);
//! let color = tf.sample(Some(0.25), 0.75);
//! assert!((color.w - 0.5).abs() < 1e-3);
//! # Ok::<(), volren::VolumeRenderError>(())
//! ```

pub mod sampler;

pub use sampler::Sampler;

use crate::error::{Result, VolumeRenderError};
use crate::math::{lerp_rgba, Rgba};
use cgmath::{Vector4, Zero};

/// Default number of entries in the 1D lookup table
pub const DEFAULT_TABLE_SIZE: usize = 256;

/// Largest lookup table the renderer accepts
pub const MAX_TABLE_SIZE: usize = 4096;

/// Segments shorter than this (in table entries) are treated as point samples
const DEGENERATE_SEGMENT: f32 = 1e-4;

/// One control point of a transfer function
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlPoint {
    /// Scalar intensity in the volume's value units
    pub intensity: f32,
    /// Straight-alpha color at this intensity
    pub color: Rgba,
}

impl ControlPoint {
    pub fn new(intensity: f32, color: Rgba) -> Self {
        Self { intensity, color }
    }
}

/// Discretized lookup tables derived from a control-point list.
///
/// `regular` holds N evenly spaced samples over the domain. `prefix` holds the
/// running integral of the piecewise-linear table measured in table entries,
/// so the mean value over any segment is a difference of two prefix reads.
/// `segments` is the N×N pre-integrated table (row = start, column = end) and
/// is only materialized while the pre-integrated sampler is active.
#[derive(Debug, Clone)]
pub struct TransferFunctionTables {
    domain: (f32, f32),
    regular: Vec<Rgba>,
    prefix: Vec<Rgba>,
    segments: Option<Vec<[f32; 4]>>,
}

impl TransferFunctionTables {
    fn build(points: &[ControlPoint], size: usize) -> Self {
        let domain = (points[0].intensity, points[points.len() - 1].intensity);
        let span = domain.1 - domain.0;
        let last = (size - 1) as f32;

        let regular: Vec<Rgba> = (0..size)
            .map(|k| {
                let intensity = if k + 1 == size {
                    domain.1
                } else {
                    domain.0 + span * (k as f32 / last)
                };
                evaluate_points(points, intensity)
            })
            .collect();

        let mut prefix = Vec::with_capacity(size);
        let mut running = Rgba::zero();
        prefix.push(running);
        for pair in regular.windows(2) {
            running += (pair[0] + pair[1]) * 0.5;
            prefix.push(running);
        }

        Self {
            domain,
            regular,
            prefix,
            segments: None,
        }
    }

    /// Number of entries in the 1D table
    pub fn size(&self) -> usize {
        self.regular.len()
    }

    /// Intensity domain `[min, max]` spanned by the tables
    pub fn domain(&self) -> (f32, f32) {
        self.domain
    }

    /// Fractional table position of an intensity, clamped to the domain
    pub fn position(&self, intensity: f32) -> f32 {
        let (lo, hi) = self.domain;
        let last = (self.size() - 1) as f32;
        if intensity.is_nan() {
            return 0.0;
        }
        ((intensity - lo) / (hi - lo) * last).clamp(0.0, last)
    }

    /// Linearly interpolated table value at a fractional position
    pub fn regular_at(&self, x: f32) -> Rgba {
        let (k, t) = self.cell(x);
        if t <= 0.0 {
            self.regular[k]
        } else if t >= 1.0 {
            self.regular[k + 1]
        } else {
            lerp_rgba(self.regular[k], self.regular[k + 1], t)
        }
    }

    /// Integral of the interpolated table from position 0 to `x`
    pub fn prefix_at(&self, x: f32) -> Rgba {
        let (k, t) = self.cell(x);
        let a = self.regular[k];
        let b = self.regular[k + 1];
        self.prefix[k] + a * t + (b - a) * (0.5 * t * t)
    }

    /// Mean color/opacity between two fractional positions
    pub fn segment_between(&self, x0: f32, x1: f32) -> Rgba {
        let width = x1 - x0;
        if width.abs() < DEGENERATE_SEGMENT {
            return self.regular_at(x1);
        }
        (self.prefix_at(x1) - self.prefix_at(x0)) / width
    }

    /// Raw 1D table for GPU upload
    pub fn regular_texels(&self) -> Vec<[f32; 4]> {
        self.regular.iter().map(|c| [c.x, c.y, c.z, c.w]).collect()
    }

    /// The N×N pre-integrated table, if it has been built
    pub fn segment_texels(&self) -> Option<&[[f32; 4]]> {
        self.segments.as_deref()
    }

    /// Compute the N×N pre-integrated table from the prefix integral
    pub fn compute_segment_texels(&self) -> Vec<[f32; 4]> {
        let n = self.size();
        let mut texels = Vec::with_capacity(n * n);
        for start in 0..n {
            for end in 0..n {
                let c = self.segment_between(start as f32, end as f32);
                texels.push([c.x, c.y, c.z, c.w]);
            }
        }
        texels
    }

    fn build_segments(&mut self) {
        if self.segments.is_some() {
            return;
        }
        let n = self.size();
        self.segments = Some(self.compute_segment_texels());
        log::debug!("Built {}x{} pre-integration table", n, n);
    }

    fn drop_segments(&mut self) {
        self.segments = None;
    }

    fn cell(&self, x: f32) -> (usize, f32) {
        let last = self.size() - 1;
        let x = x.clamp(0.0, last as f32);
        let k = (x.floor() as usize).min(last - 1);
        (k, x - k as f32)
    }
}

/// User-editable mapping from intensity to color and opacity
#[derive(Debug, Clone)]
pub struct TransferFunction {
    points: Vec<ControlPoint>,
    sampler: Sampler,
    tables: TransferFunctionTables,
    revision: u64,
}

impl TransferFunction {
    /// Create a transfer function with the default table size and the regular sampler
    pub fn new(points: Vec<ControlPoint>) -> Result<Self> {
        Self::with_table_size(points, DEFAULT_TABLE_SIZE)
    }

    /// Create a transfer function with an explicit lookup table size
    pub fn with_table_size(points: Vec<ControlPoint>, table_size: usize) -> Result<Self> {
        validate_table_size(table_size)?;
        validate_points(&points)?;
        let tables = TransferFunctionTables::build(&points, table_size);
        Ok(Self {
            points,
            sampler: Sampler::Regular,
            tables,
            revision: 0,
        })
    }

    /// Ramp from transparent black at `min` to opaque white at `max`
    pub fn linear_ramp(min: f32, max: f32) -> Result<Self> {
        Self::new(vec![
            ControlPoint::new(min, Vector4::new(0.0, 0.0, 0.0, 0.0)),
            ControlPoint::new(max, Vector4::new(1.0, 1.0, 1.0, 1.0)),
        ])
    }

    /// Replace the control points.
    ///
    /// An invalid list is rejected and the previous table stays active.
    pub fn update_control_points(&mut self, points: Vec<ControlPoint>) -> Result<()> {
        if let Err(err) = validate_points(&points) {
            log::warn!("Rejected transfer function update: {}", err);
            return Err(err);
        }
        let mut tables = TransferFunctionTables::build(&points, self.tables.size());
        if self.sampler == Sampler::PreIntegrated {
            tables.build_segments();
        }
        self.points = points;
        self.tables = tables;
        self.revision += 1;
        Ok(())
    }

    /// Rebuild the tables with a different number of entries
    pub fn resize_table(&mut self, table_size: usize) -> Result<()> {
        validate_table_size(table_size)?;
        if table_size == self.tables.size() {
            return Ok(());
        }
        let mut tables = TransferFunctionTables::build(&self.points, table_size);
        if self.sampler == Sampler::PreIntegrated {
            tables.build_segments();
        }
        self.tables = tables;
        self.revision += 1;
        Ok(())
    }

    /// Check a control-point list without applying it
    pub fn validate_points(points: &[ControlPoint]) -> Result<()> {
        validate_points(points)
    }

    /// Swap the sampling strategy. Returns `true` when the sampler changed.
    pub fn set_sampler(&mut self, sampler: Sampler) -> bool {
        if self.sampler == sampler {
            return false;
        }
        match sampler {
            Sampler::PreIntegrated => self.tables.build_segments(),
            Sampler::Regular => self.tables.drop_segments(),
        }
        self.sampler = sampler;
        self.revision += 1;
        true
    }

    pub fn sampler(&self) -> Sampler {
        self.sampler
    }

    pub fn control_points(&self) -> &[ControlPoint] {
        &self.points
    }

    /// Intensity domain covered by the control points
    pub fn domain(&self) -> (f32, f32) {
        self.tables.domain()
    }

    pub fn tables(&self) -> &TransferFunctionTables {
        &self.tables
    }

    /// Counter bumped by every successful edit or sampler swap
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Exact evaluation by bracket search over the control points
    pub fn evaluate(&self, intensity: f32) -> Rgba {
        evaluate_points(&self.points, intensity)
    }

    /// Regular point sample through the lookup table
    pub fn lookup(&self, intensity: f32) -> Rgba {
        Sampler::Regular.sample(&self.tables, None, intensity)
    }

    /// Pre-integrated mean over `[i0, i1]`
    pub fn lookup_segment(&self, i0: f32, i1: f32) -> Rgba {
        Sampler::PreIntegrated.sample(&self.tables, Some(i0), i1)
    }

    /// Sample with the active sampler; `previous` is the prior ray sample
    pub fn sample(&self, previous: Option<f32>, current: f32) -> Rgba {
        self.sampler.sample(&self.tables, previous, current)
    }
}

fn validate_table_size(size: usize) -> Result<()> {
    if !(2..=MAX_TABLE_SIZE).contains(&size) {
        return Err(VolumeRenderError::transfer_function(format!(
            "table size {} outside [2, {}]",
            size, MAX_TABLE_SIZE
        )));
    }
    Ok(())
}

fn validate_points(points: &[ControlPoint]) -> Result<()> {
    if points.len() < 2 {
        return Err(VolumeRenderError::transfer_function(format!(
            "need at least 2 control points, got {}",
            points.len()
        )));
    }

    for (i, point) in points.iter().enumerate() {
        if !point.intensity.is_finite() {
            return Err(VolumeRenderError::transfer_function(format!(
                "control point {} has non-finite intensity",
                i
            )));
        }
        let c = point.color;
        let channels = [c.x, c.y, c.z, c.w];
        if channels.iter().any(|v| !v.is_finite() || *v < 0.0 || *v > 1.0) {
            return Err(VolumeRenderError::transfer_function(format!(
                "control point {} has a color outside [0, 1]",
                i
            )));
        }
    }

    if let Some(i) = points
        .windows(2)
        .position(|pair| pair[1].intensity <= pair[0].intensity)
    {
        return Err(VolumeRenderError::transfer_function(format!(
            "intensities must be strictly increasing (points {} and {})",
            i,
            i + 1
        )));
    }

    Ok(())
}

fn evaluate_points(points: &[ControlPoint], intensity: f32) -> Rgba {
    let first = points[0];
    let last = points[points.len() - 1];
    if intensity.is_nan() || intensity <= first.intensity {
        return first.color;
    }
    if intensity >= last.intensity {
        return last.color;
    }

    // First point strictly above the intensity; never 0 or len here.
    let upper = points.partition_point(|p| p.intensity <= intensity);
    let a = points[upper - 1];
    let b = points[upper];
    let t = (intensity - a.intensity) / (b.intensity - a.intensity);
    lerp_rgba(a.color, b.color, t)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: Rgba, b: Rgba, eps: f32) -> bool {
        (a - b).x.abs() < eps && (a - b).y.abs() < eps && (a - b).z.abs() < eps && (a - b).w.abs() < eps
    }

    fn three_point() -> TransferFunction {
        TransferFunction::new(vec![
            ControlPoint::new(0.0, Vector4::new(0.0, 0.0, 1.0, 0.0)),
            ControlPoint::new(0.3, Vector4::new(1.0, 0.0, 0.0, 0.8)),
            ControlPoint::new(2.0, Vector4::new(0.0, 1.0, 0.0, 0.2)),
        ])
        .expect("valid transfer function")
    }

    #[test]
    fn test_rejects_fewer_than_two_points() {
        let err = TransferFunction::new(vec![ControlPoint::new(0.0, Vector4::new(0.0, 0.0, 0.0, 0.0))])
            .expect_err("single point must be rejected");
        assert!(matches!(err, VolumeRenderError::InvalidTransferFunction { .. }));
    }

    #[test]
    fn test_rejects_non_monotonic_points() {
        let points = vec![
            ControlPoint::new(0.0, Vector4::new(0.0, 0.0, 0.0, 0.0)),
            ControlPoint::new(0.5, Vector4::new(0.0, 0.0, 0.0, 0.0)),
            ControlPoint::new(0.5, Vector4::new(1.0, 1.0, 1.0, 1.0)),
        ];
        assert!(TransferFunction::new(points).is_err());
    }

    #[test]
    fn test_failed_update_keeps_previous_table() {
        let mut tf = three_point();
        let before = tf.lookup(0.3);
        let revision = tf.revision();

        let bad = vec![ControlPoint::new(1.0, Vector4::new(2.0, 0.0, 0.0, 1.0)), ControlPoint::new(2.0, Vector4::new(0.0, 0.0, 0.0, 1.0))];
        assert!(tf.update_control_points(bad).is_err());
        assert_eq!(tf.lookup(0.3), before);
        assert_eq!(tf.revision(), revision);
        assert_eq!(tf.control_points().len(), 3);
    }

    #[test]
    fn test_lookup_clamps_outside_domain() {
        let tf = three_point();
        assert_eq!(tf.lookup(-5.0), Vector4::new(0.0, 0.0, 1.0, 0.0));
        assert_eq!(tf.lookup(99.0), Vector4::new(0.0, 1.0, 0.0, 0.2));
        assert_eq!(tf.lookup(f32::NAN), Vector4::new(0.0, 0.0, 1.0, 0.0));
    }

    #[test]
    fn test_lookup_continuous_at_control_points() {
        let tf = TransferFunction::with_table_size(three_point().control_points().to_vec(), 4096)
            .expect("valid transfer function");
        for point in tf.control_points() {
            let at = tf.lookup(point.intensity);
            let below = tf.lookup(point.intensity - 1e-4);
            let above = tf.lookup(point.intensity + 1e-4);
            assert!(approx(at, below, 1e-2), "left limit differs at {}", point.intensity);
            assert!(approx(at, above, 1e-2), "right limit differs at {}", point.intensity);

            let exact_below = tf.evaluate(point.intensity - 1e-5);
            let exact_above = tf.evaluate(point.intensity + 1e-5);
            assert!(approx(tf.evaluate(point.intensity), exact_below, 1e-3));
            assert!(approx(tf.evaluate(point.intensity), exact_above, 1e-3));
        }
    }

    #[test]
    fn test_table_matches_exact_evaluation() {
        let tf = TransferFunction::with_table_size(three_point().control_points().to_vec(), 4096)
            .expect("valid transfer function");
        for k in 0..=200 {
            let i = 2.0 * k as f32 / 200.0;
            assert!(approx(tf.lookup(i), tf.evaluate(i), 2e-3), "mismatch at {}", i);
        }
    }

    #[test]
    fn test_zero_length_segment_equals_regular() {
        let mut tf = three_point();
        tf.set_sampler(Sampler::PreIntegrated);
        for k in 0..=100 {
            let i = -0.5 + 3.0 * k as f32 / 100.0;
            assert_eq!(tf.lookup_segment(i, i), tf.lookup(i));
            assert_eq!(tf.sample(Some(i), i), tf.lookup(i));
        }
    }

    #[test]
    fn test_segment_converges_to_regular() {
        let tf = three_point();
        for &i in &[0.1f32, 0.3, 0.9, 1.7] {
            let seg = tf.lookup_segment(i, i + 1e-3);
            assert!(approx(seg, tf.lookup(i), 1e-2));
        }
    }

    #[test]
    fn test_segment_is_mean_of_linear_ramp() {
        let tf = TransferFunction::linear_ramp(0.0, 1.0).expect("valid ramp");
        let seg = tf.lookup_segment(0.2, 0.6);
        assert!((seg.w - 0.4).abs() < 1e-3);
        // Direction along the ray does not matter for the mean.
        let rev = tf.lookup_segment(0.6, 0.2);
        assert!(approx(seg, rev, 1e-5));
    }

    #[test]
    fn test_sampler_swap_manages_segment_table() {
        let mut tf = TransferFunction::with_table_size(three_point().control_points().to_vec(), 16)
            .expect("valid transfer function");
        assert!(tf.tables().segment_texels().is_none());

        assert!(tf.set_sampler(Sampler::PreIntegrated));
        assert!(!tf.set_sampler(Sampler::PreIntegrated));
        let table = tf.tables().segment_texels().expect("segment table built");
        assert_eq!(table.len(), 16 * 16);
        // Diagonal entries are point samples.
        let diag = table[5 * 16 + 5];
        let point = tf.tables().regular_at(5.0);
        assert!((diag[3] - point.w).abs() < 1e-6);

        tf.set_sampler(Sampler::Regular);
        assert!(tf.tables().segment_texels().is_none());
    }

    #[test]
    fn test_revision_tracks_edits() {
        let mut tf = three_point();
        assert_eq!(tf.revision(), 0);
        tf.update_control_points(vec![
            ControlPoint::new(0.0, Vector4::new(0.0, 0.0, 0.0, 0.0)),
            ControlPoint::new(4.0, Vector4::new(1.0, 1.0, 1.0, 1.0)),
        ])
        .expect("valid update");
        assert_eq!(tf.revision(), 1);
        assert_eq!(tf.domain(), (0.0, 4.0));
        tf.set_sampler(Sampler::PreIntegrated);
        assert_eq!(tf.revision(), 2);
    }

    #[test]
    fn test_resize_keeps_points_and_sampler() {
        let mut tf = three_point();
        tf.set_sampler(Sampler::PreIntegrated);
        let revision = tf.revision();
        tf.resize_table(32).expect("valid size");
        assert_eq!(tf.tables().size(), 32);
        assert_eq!(tf.tables().segment_texels().map(|t| t.len()), Some(32 * 32));
        assert_eq!(tf.revision(), revision + 1);
        assert_eq!(tf.lookup(2.0), Vector4::new(0.0, 1.0, 0.0, 0.2));
        assert!(tf.resize_table(0).is_err());
    }

    #[test]
    fn test_rejects_bad_table_size() {
        let points = three_point().control_points().to_vec();
        assert!(TransferFunction::with_table_size(points.clone(), 1).is_err());
        assert!(TransferFunction::with_table_size(points, MAX_TABLE_SIZE + 1).is_err());
    }
}
