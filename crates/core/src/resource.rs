use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Slack allowed per dimension when comparing with `Tolerance::Epsilon`.
/// Quantities are millicores and bytes, so a tenth of a unit is noise.
const DIMENSION_EPSILON: f64 = 0.1;

/// How `sub` treats a dimension that would go negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubMode {
    /// Clamp the dimension at zero.
    Saturating,
    /// Return an error and leave the vector untouched.
    Checked,
}

/// Comparison slack for `less_equal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tolerance {
    /// No slack at all.
    Exact,
    /// Allow a small per-dimension epsilon.
    Epsilon,
}

impl Tolerance {
    fn slack(self) -> f64 {
        match self {
            Tolerance::Exact => 0.0,
            Tolerance::Epsilon => DIMENSION_EPSILON,
        }
    }
}

/// Multi-dimensional non-negative resource quantity.
///
/// CPU is tracked in millicores and memory in bytes; any other device
/// dimension (GPUs, FPGAs, ...) lives in `devices` keyed by name. A
/// dimension absent from the map is treated as zero, which makes the
/// comparison a partial order over arbitrary dimension sets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub cpu_milli: f64,
    pub memory_bytes: f64,
    #[serde(default)]
    pub devices: BTreeMap<String, f64>,
}

impl Resource {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn new(cpu_milli: f64, memory_bytes: f64) -> Self {
        Self {
            cpu_milli,
            memory_bytes,
            devices: BTreeMap::new(),
        }
    }

    /// Builder-style helper for device dimensions.
    pub fn with_device(mut self, name: &str, quantity: f64) -> Self {
        self.devices.insert(name.to_string(), quantity);
        self
    }

    /// True when every dimension is zero (within epsilon).
    pub fn is_empty(&self) -> bool {
        self.cpu_milli < DIMENSION_EPSILON
            && self.memory_bytes < DIMENSION_EPSILON
            && self.devices.values().all(|q| *q < DIMENSION_EPSILON)
    }

    /// Component-wise addition.
    pub fn add(&mut self, other: &Resource) -> &mut Self {
        self.cpu_milli += other.cpu_milli;
        self.memory_bytes += other.memory_bytes;
        for (name, q) in &other.devices {
            *self.devices.entry(name.clone()).or_insert(0.0) += q;
        }
        self
    }

    /// Component-wise subtraction.
    ///
    /// `Saturating` clamps each dimension at zero; `Checked` fails without
    /// modifying `self` if any dimension would go negative.
    pub fn sub(&mut self, other: &Resource, mode: SubMode) -> Result<&mut Self, CoreError> {
        if mode == SubMode::Checked && !other.less_equal(self, Tolerance::Epsilon) {
            return Err(CoreError::InsufficientResource(format!(
                "cannot subtract {other} from {self}"
            )));
        }

        self.cpu_milli = (self.cpu_milli - other.cpu_milli).max(0.0);
        self.memory_bytes = (self.memory_bytes - other.memory_bytes).max(0.0);
        for (name, q) in &other.devices {
            let entry = self.devices.entry(name.clone()).or_insert(0.0);
            *entry = (*entry - q).max(0.0);
        }
        Ok(self)
    }

    /// Partial order: true iff every dimension of `self` is at most the
    /// corresponding dimension of `other` plus the tolerance slack.
    /// Dimensions missing on either side count as zero.
    pub fn less_equal(&self, other: &Resource, tolerance: Tolerance) -> bool {
        let slack = tolerance.slack();
        if self.cpu_milli > other.cpu_milli + slack {
            return false;
        }
        if self.memory_bytes > other.memory_bytes + slack {
            return false;
        }
        self.devices
            .iter()
            .all(|(name, q)| *q <= other.devices.get(name).copied().unwrap_or(0.0) + slack)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu {:.0}m, memory {:.0}B", self.cpu_milli, self.memory_bytes)?;
        for (name, q) in &self.devices {
            write!(f, ", {} {:.0}", name, q)?;
        }
        Ok(())
    }
}
