// src/aggregation/mod.rs
//! # Multi-Volume Aggregation
//!
//! Combines the per-sample scalars of several volumes into the single value
//! that is fed to the transfer function. The combine rule is a pure function
//! over the samples present at a ray position; which rule to use is a product
//! decision, so the rule is pluggable and [`AggregationRule::Maximum`] is only
//! the default.
//!
//! Every rule exists twice: as a Rust function used by the CPU backend and as
//! a WGSL body spliced into the composed shader. The WGSL side folds samples
//! one at a time through three functions:
//!
//! ```text
//! fn aggregate_init() -> vec2<f32>
//! fn aggregate_step(acc: vec2<f32>, value: f32, weight: f32) -> vec2<f32>
//! fn aggregate_finish(acc: vec2<f32>, count: u32) -> f32
//! ```

use crate::error::{Result, VolumeRenderError};
use crate::volume::{Volume, VolumeDataManager, VolumeId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_CUSTOM_RULE_ID: AtomicU64 = AtomicU64::new(0);

/// One volume's contribution at a ray position
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSample {
    pub id: VolumeId,
    pub value: f32,
    pub weight: f32,
}

type CombineFn = dyn Fn(&[ChannelSample]) -> Option<f32> + Send + Sync;

/// User-supplied combine rule.
///
/// Every `CustomRule::new` gets a fresh id, so two rules sharing a name never
/// share a compiled program. Clones keep the id.
#[derive(Clone)]
pub struct CustomRule {
    id: u64,
    name: String,
    combine: Arc<CombineFn>,
    wgsl: String,
}

impl CustomRule {
    /// `wgsl` must define `aggregate_init`, `aggregate_step` and `aggregate_finish`.
    pub fn new<F>(name: impl Into<String>, wgsl: impl Into<String>, combine: F) -> Self
    where
        F: Fn(&[ChannelSample]) -> Option<f32> + Send + Sync + 'static,
    {
        Self {
            id: NEXT_CUSTOM_RULE_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            combine: Arc::new(combine),
            wgsl: wgsl.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Debug for CustomRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomRule")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// How the samples of several volumes are merged
#[derive(Debug, Clone, Default)]
pub enum AggregationRule {
    #[default]
    Maximum,
    Minimum,
    Sum,
    Average,
    WeightedSum,
    WeightedAverage,
    Custom(CustomRule),
}

impl AggregationRule {
    /// Stable identifier; part of the shader cache key
    pub fn key(&self) -> String {
        match self {
            AggregationRule::Maximum => "max".into(),
            AggregationRule::Minimum => "min".into(),
            AggregationRule::Sum => "sum".into(),
            AggregationRule::Average => "avg".into(),
            AggregationRule::WeightedSum => "wsum".into(),
            AggregationRule::WeightedAverage => "wavg".into(),
            AggregationRule::Custom(rule) => format!("custom:{}#{}", rule.name, rule.id),
        }
    }

    /// Combine the samples present at one position.
    ///
    /// Returns `None` when nothing contributes, in which case the ray step is
    /// treated as empty space.
    pub fn combine(&self, samples: &[ChannelSample]) -> Option<f32> {
        if samples.is_empty() {
            return None;
        }
        let values = samples.iter().map(|s| s.value);
        match self {
            AggregationRule::Maximum => values.reduce(f32::max),
            AggregationRule::Minimum => values.reduce(f32::min),
            AggregationRule::Sum => Some(values.sum()),
            AggregationRule::Average => Some(values.sum::<f32>() / samples.len() as f32),
            AggregationRule::WeightedSum => Some(samples.iter().map(|s| s.value * s.weight).sum()),
            AggregationRule::WeightedAverage => {
                let total: f32 = samples.iter().map(|s| s.weight).sum();
                if total > 0.0 {
                    Some(samples.iter().map(|s| s.value * s.weight).sum::<f32>() / total)
                } else {
                    None
                }
            }
            AggregationRule::Custom(rule) => (rule.combine)(samples).filter(|v| v.is_finite()),
        }
    }

    /// WGSL definitions of the three fold functions
    pub fn wgsl(&self) -> String {
        let (init, step, finish) = match self {
            AggregationRule::Maximum => (
                "vec2<f32>(-3.4e38, 0.0)",
                "vec2<f32>(max(acc.x, value), acc.y + weight)",
                "acc.x",
            ),
            AggregationRule::Minimum => (
                "vec2<f32>(3.4e38, 0.0)",
                "vec2<f32>(min(acc.x, value), acc.y + weight)",
                "acc.x",
            ),
            AggregationRule::Sum => (
                "vec2<f32>(0.0, 0.0)",
                "vec2<f32>(acc.x + value, acc.y + weight)",
                "acc.x",
            ),
            AggregationRule::Average => (
                "vec2<f32>(0.0, 0.0)",
                "vec2<f32>(acc.x + value, acc.y + weight)",
                "acc.x / f32(max(count, 1u))",
            ),
            AggregationRule::WeightedSum => (
                "vec2<f32>(0.0, 0.0)",
                "vec2<f32>(acc.x + value * weight, acc.y + weight)",
                "acc.x",
            ),
            AggregationRule::WeightedAverage => (
                "vec2<f32>(0.0, 0.0)",
                "vec2<f32>(acc.x + value * weight, acc.y + weight)",
                "select(0.0, acc.x / acc.y, acc.y > 0.0)",
            ),
            AggregationRule::Custom(rule) => return rule.wgsl.clone(),
        };
        format!(
            "fn aggregate_init() -> vec2<f32> {{\n    return {init};\n}}\n\n\
             fn aggregate_step(acc: vec2<f32>, value: f32, weight: f32) -> vec2<f32> {{\n    return {step};\n}}\n\n\
             fn aggregate_finish(acc: vec2<f32>, count: u32) -> f32 {{\n    return {finish};\n}}\n"
        )
    }
}

/// Per-volume participation in the aggregate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSettings {
    pub enabled: bool,
    pub weight: f32,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            weight: 1.0,
        }
    }
}

/// Rule plus per-volume flags and weights
#[derive(Debug, Clone, Default)]
pub struct AggregationConfig {
    pub rule: AggregationRule,
    pub channels: BTreeMap<VolumeId, ChannelSettings>,
}

impl AggregationConfig {
    pub fn new(rule: AggregationRule) -> Self {
        Self {
            rule,
            channels: BTreeMap::new(),
        }
    }

    pub fn with_channel(mut self, id: VolumeId, settings: ChannelSettings) -> Self {
        self.channels.insert(id, settings);
        self
    }

    /// Settings for a volume; volumes not listed participate with defaults
    pub fn channel(&self, id: VolumeId) -> ChannelSettings {
        self.channels.get(&id).copied().unwrap_or_default()
    }

    fn validate(&self) -> Result<()> {
        for (id, settings) in &self.channels {
            if !settings.weight.is_finite() || settings.weight < 0.0 {
                return Err(VolumeRenderError::InvalidSettings {
                    field: format!("weight of {} must be finite and non-negative", id),
                });
            }
        }
        Ok(())
    }
}

/// A volume selected for combination in the current frame
#[derive(Debug, Clone)]
pub struct ActiveVolume {
    pub id: VolumeId,
    pub revision: u64,
    pub volume: Arc<Volume>,
    pub weight: f32,
}

/// Owns the [`AggregationConfig`] and resolves it against the loaded volumes
#[derive(Debug, Default)]
pub struct AggregatorManager {
    config: AggregationConfig,
    revision: u64,
}

impl AggregatorManager {
    pub fn new(rule: AggregationRule) -> Self {
        Self {
            config: AggregationConfig::new(rule),
            revision: 0,
        }
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    pub fn rule(&self) -> &AggregationRule {
        &self.config.rule
    }

    /// Counter bumped by every accepted change
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Replace the whole configuration; rejected configs leave the old one active
    pub fn set_config(&mut self, config: AggregationConfig) -> Result<()> {
        config.validate()?;
        log::debug!("Aggregation rule set to {}", config.rule.key());
        self.config = config;
        self.revision += 1;
        Ok(())
    }

    pub fn set_rule(&mut self, rule: AggregationRule) {
        self.config.rule = rule;
        self.revision += 1;
    }

    pub fn set_enabled(&mut self, id: VolumeId, enabled: bool) -> Result<()> {
        let channel = self
            .config
            .channels
            .get_mut(&id)
            .ok_or(VolumeRenderError::VolumeNotFound(id))?;
        channel.enabled = enabled;
        self.revision += 1;
        Ok(())
    }

    pub fn set_weight(&mut self, id: VolumeId, weight: f32) -> Result<()> {
        if !weight.is_finite() || weight < 0.0 {
            return Err(VolumeRenderError::InvalidSettings {
                field: format!("weight of {} must be finite and non-negative", id),
            });
        }
        let channel = self
            .config
            .channels
            .get_mut(&id)
            .ok_or(VolumeRenderError::VolumeNotFound(id))?;
        channel.weight = weight;
        self.revision += 1;
        Ok(())
    }

    /// Channels in ascending identifier order
    pub fn enumerate(&self) -> Vec<(VolumeId, ChannelSettings)> {
        self.config
            .channels
            .iter()
            .map(|(id, settings)| (*id, *settings))
            .collect()
    }

    /// Add channels for newly loaded volumes and drop channels of removed ones
    pub fn sync_with(&mut self, data: &VolumeDataManager) {
        let before = self.config.channels.len();
        self.config.channels.retain(|id, _| data.contains(*id));
        let mut changed = self.config.channels.len() != before;
        for id in data.ids() {
            if !self.config.channels.contains_key(&id) {
                self.config.channels.insert(id, ChannelSettings::default());
                changed = true;
            }
        }
        if changed {
            self.revision += 1;
        }
    }

    /// Enabled volumes with their weights, in ascending identifier order
    pub fn active_volumes(&self, data: &VolumeDataManager) -> Vec<ActiveVolume> {
        data.iter()
            .filter_map(|(id, volume)| {
                let settings = self.config.channel(id);
                settings.enabled.then(|| ActiveVolume {
                    id,
                    revision: data.revision_of(id).unwrap_or_default(),
                    volume: volume.clone(),
                    weight: settings.weight,
                })
            })
            .collect()
    }

    pub fn combine(&self, samples: &[ChannelSample]) -> Option<f32> {
        self.config.rule.combine(samples)
    }
}
