//! Named variable store with incremental initialisation.
//!
//! Variables are created uninitialised and given a value only by
//! [`ParamStore::initialize_uninitialized`], which scans the whole store
//! against the set reported by [`ParamStore::uninitialized`]. Growing the
//! network therefore never touches a variable that already holds trained
//! values.

use std::collections::HashMap;

use ndarray::{Array1, ArrayD, Ix1, IxDyn};
use rand::Rng;

use crate::error::{GrowError, GrowResult};
use crate::tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(pub usize);

/// How a variable gets its first value.
#[derive(Debug, Clone)]
pub enum Init {
    Msra { fan_in: usize },
    Xavier { fan_in: usize, fan_out: usize },
    Zeros,
    Ones,
    /// Copy of values computed at creation time (head reconstruction).
    Values(ArrayD<f32>),
}

/// What part of the network a variable belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Convolution kernel.
    Kernel,
    /// Batch-norm scale/shift.
    Norm,
    /// Classifier weight row or bias.
    Dense,
    /// Batch-norm running mean/variance; saved but never trained.
    Statistic,
}

impl ParamKind {
    pub fn is_trainable(self) -> bool {
        !matches!(self, ParamKind::Statistic)
    }
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub kind: ParamKind,
    shape: Vec<usize>,
    value: ArrayD<f32>,
    init: Init,
    initialized: bool,
}

impl Param {
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParamStore {
    params: Vec<Param>,
    by_name: HashMap<String, ParamId>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a new variable. Its value stays unset until initialised.
    pub fn create(&mut self, name: impl Into<String>, shape: &[usize], kind: ParamKind, init: Init) -> GrowResult<ParamId> {
        let name = name.into();
        if let Init::Values(values) = &init {
            if values.shape() != shape {
                return Err(GrowError::shape("param_init", shape, values.shape()));
            }
        }
        let id = ParamId(self.params.len());
        self.by_name.insert(name.clone(), id);
        self.params.push(Param {
            name,
            kind,
            shape: shape.to_vec(),
            value: ArrayD::zeros(IxDyn(shape)),
            init,
            initialized: false,
        });
        Ok(id)
    }

    pub fn get(&self, id: ParamId) -> GrowResult<&Param> {
        self.params.get(id.0).ok_or(GrowError::UnknownParam(id.0))
    }

    /// Look a variable up by its full name. Later declarations shadow earlier
    /// ones with the same name.
    pub fn find(&self, name: &str) -> Option<ParamId> {
        self.by_name.get(name).copied()
    }

    pub fn value(&self, id: ParamId) -> GrowResult<&ArrayD<f32>> {
        let param = self.get(id)?;
        if !param.initialized {
            return Err(GrowError::Uninitialized(param.name.clone()));
        }
        Ok(&param.value)
    }

    /// A 1-D variable (batch-norm vectors, classifier rows, biases).
    pub fn vector(&self, id: ParamId) -> GrowResult<Array1<f32>> {
        Ok(self.value(id)?.clone().into_dimensionality::<Ix1>()?)
    }

    /// Overwrite a variable's value. The variable counts as initialised
    /// afterwards.
    pub fn assign(&mut self, id: ParamId, value: ArrayD<f32>) -> GrowResult<()> {
        let param = self.params.get_mut(id.0).ok_or(GrowError::UnknownParam(id.0))?;
        if value.shape() != param.shape.as_slice() {
            return Err(GrowError::shape("assign", &param.shape, value.shape()));
        }
        param.value = value;
        param.initialized = true;
        Ok(())
    }

    /// In-place update of an initialised variable.
    pub fn update(&mut self, id: ParamId, f: impl FnOnce(&mut ArrayD<f32>)) -> GrowResult<()> {
        let param = self.params.get_mut(id.0).ok_or(GrowError::UnknownParam(id.0))?;
        if !param.initialized {
            return Err(GrowError::Uninitialized(param.name.clone()));
        }
        f(&mut param.value);
        Ok(())
    }

    /// Ids of every variable that has not been given a value yet.
    pub fn uninitialized(&self) -> Vec<ParamId> {
        self.params
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.initialized)
            .map(|(i, _)| ParamId(i))
            .collect()
    }

    /// Initialise exactly the variables reported by [`Self::uninitialized`].
    /// Returns how many were initialised.
    pub fn initialize_uninitialized<R: Rng + ?Sized>(&mut self, rng: &mut R) -> usize {
        let pending = self.uninitialized();
        for id in &pending {
            let param = &mut self.params[id.0];
            param.value = match &param.init {
                Init::Msra { fan_in } => tensor::msra_normal(rng, &param.shape, *fan_in),
                Init::Xavier { fan_in, fan_out } => tensor::xavier_uniform(rng, &param.shape, *fan_in, *fan_out),
                Init::Zeros => ArrayD::zeros(IxDyn(&param.shape)),
                Init::Ones => ArrayD::ones(IxDyn(&param.shape)),
                Init::Values(values) => values.clone(),
            };
            param.initialized = true;
        }
        pending.len()
    }

    /// Forget every variable declared after the store held `len` variables.
    pub fn rollback(&mut self, len: usize) {
        if len >= self.params.len() {
            return;
        }
        self.params.truncate(len);
        self.by_name = self
            .params
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), ParamId(i)))
            .collect();
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamId, &Param)> {
        self.params.iter().enumerate().map(|(i, p)| (ParamId(i), p))
    }
}

/// Accumulated gradients for one backward pass.
#[derive(Debug, Clone, Default)]
pub struct Gradients {
    grads: HashMap<ParamId, ArrayD<f32>>,
}

impl Gradients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accumulate(&mut self, id: ParamId, grad: ArrayD<f32>) {
        match self.grads.get_mut(&id) {
            Some(existing) => *existing += &grad,
            None => {
                self.grads.insert(id, grad);
            }
        }
    }

    pub fn get(&self, id: ParamId) -> Option<&ArrayD<f32>> {
        self.grads.get(&id)
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }
}
