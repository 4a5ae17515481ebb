//! Nesterov momentum with L2 weight decay.
//!
//! For every useful variable `w` with gradient `g`:
//!
//! ```text
//! g'    = g + weight_decay * w
//! accum = momentum * accum + g'
//! w    -= lr * (g' + momentum * accum)
//! ```
//!
//! Accumulators are keyed by [`ParamId`]. They are dropped whenever the
//! training objective is redefined after a mutation, so every variable
//! restarts with zero velocity.

use std::collections::HashMap;

use ndarray::{ArrayD, Zip};

use crate::error::GrowResult;
use crate::params::{Gradients, ParamId, ParamStore};

#[derive(Debug, Clone)]
pub struct Momentum {
    pub momentum: f32,
    accum: HashMap<ParamId, ArrayD<f32>>,
}

impl Momentum {
    pub fn new(momentum: f32) -> Self {
        Self { momentum, accum: HashMap::new() }
    }

    /// Drop every accumulator.
    pub fn reset(&mut self) {
        self.accum.clear();
    }

    /// Apply one update to `vars`. Variables without a gradient still decay.
    pub fn step(
        &mut self,
        params: &mut ParamStore,
        grads: &Gradients,
        vars: &[ParamId],
        learning_rate: f32,
        weight_decay: f32,
    ) -> GrowResult<()> {
        let m = self.momentum;
        for &id in vars {
            let w = params.value(id)?;
            let mut g = w * weight_decay;
            if let Some(grad) = grads.get(id) {
                g += grad;
            }
            let accum = self
                .accum
                .entry(id)
                .or_insert_with(|| ArrayD::zeros(g.raw_dim()));
            Zip::from(&mut *accum).and(&g).for_each(|a, &gi| *a = m * *a + gi);

            let mut update = g;
            update.scaled_add(m, accum);
            params.update(id, |w| w.scaled_add(-learning_rate, &update))?;
        }
        Ok(())
    }

    /// Half squared L2 norm summed over `vars`: `Σ ½‖w‖²`.
    pub fn l2_penalty(params: &ParamStore, vars: &[ParamId]) -> GrowResult<f32> {
        let mut total = 0.0f64;
        for &id in vars {
            total += params.value(id)?.iter().map(|&v| (v as f64) * (v as f64)).sum::<f64>() * 0.5;
        }
        Ok(total as f32)
    }
}
