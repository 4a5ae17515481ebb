//! Fully-connected classifier over pooled features.
//!
//! The weight matrix `[features, classes]` is stored row by row: one
//! `[classes]` variable per input feature. When the feature width grows the
//! head keeps its old rows and appends fresh ones, so trained weights are
//! never re-created.

use ndarray::{Array2, Axis};

use crate::error::{GrowError, GrowResult};
use crate::params::{Gradients, ParamId, ParamStore};
use crate::tensor::Tensor;
use super::{single, single_shape, Cache, Layer, Pass, Shape};

#[derive(Debug, Clone)]
pub struct ClassifierLayer {
    pub rows: Vec<ParamId>,
    pub bias: ParamId,
    pub n_classes: usize,
}

impl ClassifierLayer {
    pub fn in_features(&self) -> usize {
        self.rows.len()
    }

    /// Stack the row variables into the `[features, classes]` matrix.
    pub fn weights(&self, params: &ParamStore) -> GrowResult<Array2<f32>> {
        let mut w = Array2::<f32>::zeros((self.rows.len(), self.n_classes));
        for (i, &id) in self.rows.iter().enumerate() {
            let row = params.vector(id)?;
            if row.len() != self.n_classes {
                return Err(GrowError::DimensionMismatch { expected: self.n_classes, actual: row.len() });
            }
            w.row_mut(i).assign(&row);
        }
        Ok(w)
    }

    fn flatten(&self, input: &Tensor) -> GrowResult<Array2<f32>> {
        let (n, c, h, w) = input.dim();
        if c * h * w != self.in_features() {
            return Err(GrowError::DimensionMismatch { expected: self.in_features(), actual: c * h * w });
        }
        Ok(input.as_standard_layout().to_owned().into_shape((n, c * h * w))?)
    }
}

impl Layer for ClassifierLayer {
    fn name(&self) -> &'static str { "Classifier" }

    fn output_shape(&self, inputs: &[Shape]) -> GrowResult<Shape> {
        let input = single_shape(self.name(), inputs)?;
        if input.total() != self.in_features() {
            return Err(GrowError::DimensionMismatch { expected: self.in_features(), actual: input.total() });
        }
        Ok(Shape::vector(self.n_classes))
    }

    fn params(&self) -> Vec<ParamId> {
        let mut ids = self.rows.clone();
        ids.push(self.bias);
        ids
    }

    fn forward(&self, inputs: &[&Tensor], params: &ParamStore, _pass: &mut Pass<'_>) -> GrowResult<(Tensor, Cache)> {
        let x = self.flatten(single(self.name(), inputs)?)?;
        let w = self.weights(params)?;
        let bias = params.vector(self.bias)?;
        let logits = x.dot(&w) + &bias;
        let n = logits.nrows();
        Ok((logits.into_shape((n, self.n_classes, 1, 1))?, Cache::None))
    }

    fn backward(
        &self,
        inputs: &[&Tensor],
        _cache: &Cache,
        grad_out: &Tensor,
        params: &ParamStore,
        grads: &mut Gradients,
    ) -> GrowResult<Vec<Tensor>> {
        let input = single(self.name(), inputs)?;
        let x = self.flatten(input)?;
        let w = self.weights(params)?;
        let n = x.nrows();
        let dy = grad_out.as_standard_layout().to_owned().into_shape((n, self.n_classes))?;

        let dw = x.t().dot(&dy);
        for (i, &id) in self.rows.iter().enumerate() {
            grads.accumulate(id, dw.row(i).to_owned().into_dyn());
        }
        grads.accumulate(self.bias, dy.sum_axis(Axis(0)).into_dyn());

        let dx = dy.dot(&w.t());
        Ok(vec![dx.into_shape(input.raw_dim())?])
    }
}
