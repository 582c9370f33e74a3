//! Symmetric z-plane sequence around the current focus.

use crate::config::ZStackConfig;

/// Z positions visited at one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ZPlan {
    center: f64,
    step: f64,
    count: usize,
}

impl ZPlan {
    /// Plan `count` planes spaced by `step` around `center`.
    ///
    /// A count of zero is treated as one plane at the center.
    pub fn new(center: f64, step: f64, count: usize) -> Self {
        Self {
            center,
            step,
            count: count.max(1),
        }
    }

    /// Single plane at `center`.
    pub fn single(center: f64) -> Self {
        Self::new(center, 0.0, 1)
    }

    /// Plan derived from the z-stack settings at capture time.
    pub fn from_config(center: f64, zstack: &ZStackConfig) -> Self {
        if zstack.enabled {
            Self::new(center, zstack.step, zstack.count)
        } else {
            Self::single(center)
        }
    }

    /// Number of planes.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Always false; a plan has at least one plane.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Focus position the plan is centered on.
    pub fn center(&self) -> f64 {
        self.center
    }

    /// Offsets relative to the center, in ascending order.
    pub fn offsets(&self) -> Vec<f64> {
        let half = (self.count as f64 - 1.0) / 2.0;
        (0..self.count)
            .map(|i| (i as f64 - half) * self.step)
            .collect()
    }

    /// Absolute z positions, in ascending order.
    pub fn positions(&self) -> Vec<f64> {
        self.offsets().into_iter().map(|o| self.center + o).collect()
    }
}
