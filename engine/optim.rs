//! Named parameter storage and the first-order optimizers a fold can select.
//!
//! A model owns a [`ParamStore`]; its `backward` accumulates into each
//! parameter's `grad` buffer and an [`Optimizer`] then updates the values in
//! place. Per-parameter optimizer state is keyed by parameter name.

use ndarray::{ArrayD, Zip};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Flat snapshot of every parameter value, keyed by name.
pub type StateDict = BTreeMap<String, ArrayD<f64>>;

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub value: ArrayD<f64>,
    pub grad: ArrayD<f64>,
}

impl Parameter {
    pub fn new(value: ArrayD<f64>) -> Self {
        let grad = ArrayD::zeros(value.raw_dim());
        Self { value, grad }
    }
}

#[derive(Debug, Error)]
pub enum OptimError {
    #[error("Unsupported optimizer selector '{0}'")]
    UnknownSelector(String),
    #[error("gradient of '{name}' has shape {grad:?} but the parameter has shape {value:?}")]
    GradientShape {
        name: String,
        value: Vec<usize>,
        grad: Vec<usize>,
    },
    #[error("state dict is missing parameter '{0}'")]
    MissingParameter(String),
    #[error("state dict carries unexpected parameter '{0}'")]
    UnexpectedParameter(String),
    #[error("state dict entry '{name}' has shape {found:?}, expected {expected:?}")]
    StateShape {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
}

/// Ordered collection of trainable tensors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamStore {
    params: BTreeMap<String, Parameter>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a parameter with a zeroed gradient, replacing any previous
    /// entry under the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: ArrayD<f64>) {
        self.params.insert(name.into(), Parameter::new(value));
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.params.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Parameter)> {
        self.params.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut Parameter)> {
        self.params.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn zero_grad(&mut self) {
        for param in self.params.values_mut() {
            param.grad.fill(0.0);
        }
    }

    pub fn state_dict(&self) -> StateDict {
        self.params
            .iter()
            .map(|(name, param)| (name.clone(), param.value.clone()))
            .collect()
    }

    /// Strict load: every parameter must be present with its exact shape and
    /// no extra entries are accepted. Gradients are reset.
    pub fn load_state_dict(&mut self, state: &StateDict) -> Result<(), OptimError> {
        if let Some(extra) = state.keys().find(|name| !self.params.contains_key(*name)) {
            return Err(OptimError::UnexpectedParameter(extra.clone()));
        }
        for (name, param) in &self.params {
            let incoming = state
                .get(name)
                .ok_or_else(|| OptimError::MissingParameter(name.clone()))?;
            if incoming.shape() != param.value.shape() {
                return Err(OptimError::StateShape {
                    name: name.clone(),
                    expected: param.value.shape().to_vec(),
                    found: incoming.shape().to_vec(),
                });
            }
        }
        for (name, param) in self.params.iter_mut() {
            if let Some(incoming) = state.get(name) {
                param.value.assign(incoming);
                param.grad.fill(0.0);
            }
        }
        Ok(())
    }
}

fn check_grad(name: &str, param: &Parameter) -> Result<(), OptimError> {
    if param.grad.shape() != param.value.shape() {
        return Err(OptimError::GradientShape {
            name: name.to_string(),
            value: param.value.shape().to_vec(),
            grad: param.grad.shape().to_vec(),
        });
    }
    Ok(())
}

pub trait Optimizer {
    /// Applies one update using the gradients currently held by `params`.
    fn step(&mut self, params: &mut ParamStore) -> Result<(), OptimError>;
}

/// Stochastic gradient descent with heavy-ball momentum and L2 weight decay.
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f64,
    momentum: f64,
    weight_decay: f64,
    buffers: BTreeMap<String, ArrayD<f64>>,
}

impl Sgd {
    pub fn new(lr: f64, momentum: f64, weight_decay: f64) -> Self {
        Self {
            lr,
            momentum,
            weight_decay,
            buffers: BTreeMap::new(),
        }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut ParamStore) -> Result<(), OptimError> {
        for (name, param) in params.iter_mut() {
            check_grad(name, param)?;
            let mut direction = &param.grad + &(&param.value * self.weight_decay);
            if self.momentum != 0.0 {
                let momentum = self.momentum;
                // First step seeds the buffer with the raw gradient.
                let buffer = self
                    .buffers
                    .entry(name.clone())
                    .and_modify(|buffer| {
                        Zip::from(buffer)
                            .and(&direction)
                            .for_each(|b, &g| *b = momentum * *b + g);
                    })
                    .or_insert_with(|| direction.clone());
                direction.assign(buffer);
            }
            param.value.scaled_add(-self.lr, &direction);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Moments {
    step: i32,
    first: ArrayD<f64>,
    second: ArrayD<f64>,
}

impl Moments {
    fn zeros_like(value: &ArrayD<f64>) -> Self {
        Self {
            step: 0,
            first: ArrayD::zeros(value.raw_dim()),
            second: ArrayD::zeros(value.raw_dim()),
        }
    }

    fn update(&mut self, grad: &ArrayD<f64>, beta1: f64, beta2: f64) {
        self.step += 1;
        Zip::from(&mut self.first)
            .and(&mut self.second)
            .and(grad)
            .for_each(|m, v, &g| {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
            });
    }
}

/// Adam. With `decoupled` set, weight decay shrinks the parameters directly
/// (AdamW) instead of being folded into the gradient.
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f64,
    betas: (f64, f64),
    eps: f64,
    weight_decay: f64,
    decoupled: bool,
    state: BTreeMap<String, Moments>,
}

impl Adam {
    pub fn new(lr: f64, weight_decay: f64) -> Self {
        Self {
            lr,
            betas: (0.9, 0.999),
            eps: 1e-8,
            weight_decay,
            decoupled: false,
            state: BTreeMap::new(),
        }
    }

    pub fn adamw(lr: f64, weight_decay: f64) -> Self {
        Self {
            decoupled: true,
            ..Self::new(lr, weight_decay)
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut ParamStore) -> Result<(), OptimError> {
        let (beta1, beta2) = self.betas;
        for (name, param) in params.iter_mut() {
            check_grad(name, param)?;
            let grad = if self.decoupled {
                param.value *= 1.0 - self.lr * self.weight_decay;
                param.grad.clone()
            } else {
                &param.grad + &(&param.value * self.weight_decay)
            };
            let moments = self
                .state
                .entry(name.clone())
                .or_insert_with(|| Moments::zeros_like(&param.value));
            moments.update(&grad, beta1, beta2);

            let correction1 = 1.0 - beta1.powi(moments.step);
            let correction2 = 1.0 - beta2.powi(moments.step);
            let step_size = self.lr / correction1;
            let eps = self.eps;
            Zip::from(&mut param.value)
                .and(&moments.first)
                .and(&moments.second)
                .for_each(|p, &m, &v| {
                    *p -= step_size * m / (v.sqrt() / correction2.sqrt() + eps);
                });
        }
        Ok(())
    }
}

/// Rectified Adam. While the variance estimate is still unreliable
/// (rho < 5) the update falls back to bias-corrected momentum SGD.
#[derive(Debug, Clone)]
pub struct RAdam {
    lr: f64,
    betas: (f64, f64),
    eps: f64,
    weight_decay: f64,
    state: BTreeMap<String, Moments>,
}

impl RAdam {
    pub fn new(lr: f64, weight_decay: f64) -> Self {
        Self {
            lr,
            betas: (0.9, 0.999),
            eps: 1e-8,
            weight_decay,
            state: BTreeMap::new(),
        }
    }
}

impl Optimizer for RAdam {
    fn step(&mut self, params: &mut ParamStore) -> Result<(), OptimError> {
        let (beta1, beta2) = self.betas;
        let rho_inf = 2.0 / (1.0 - beta2) - 1.0;
        for (name, param) in params.iter_mut() {
            check_grad(name, param)?;
            let moments = self
                .state
                .entry(name.clone())
                .or_insert_with(|| Moments::zeros_like(&param.value));
            moments.update(&param.grad, beta1, beta2);

            let t = moments.step;
            let beta2_t = beta2.powi(t);
            let rho_t = rho_inf - 2.0 * f64::from(t) * beta2_t / (1.0 - beta2_t);
            let correction1 = 1.0 - beta1.powi(t);

            if self.weight_decay != 0.0 {
                param.value *= 1.0 - self.weight_decay * self.lr;
            }
            if rho_t >= 5.0 {
                let rect = ((1.0 - beta2_t) * (rho_t - 4.0) / (rho_inf - 4.0) * (rho_t - 2.0)
                    / rho_t
                    * rho_inf
                    / (rho_inf - 2.0))
                    .sqrt();
                let step_size = self.lr * rect / correction1;
                let eps = self.eps;
                Zip::from(&mut param.value)
                    .and(&moments.first)
                    .and(&moments.second)
                    .for_each(|p, &m, &v| *p -= step_size * m / (v.sqrt() + eps));
            } else {
                param.value.scaled_add(-self.lr / correction1, &moments.first);
            }
        }
        Ok(())
    }
}

/// Optimizer selector as written in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum OptimizerKind {
    Adam,
    Sgd,
    AdamW,
    RAdam,
}

impl OptimizerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Adam => "adam",
            Self::Sgd => "sgd",
            Self::AdamW => "adamW",
            Self::RAdam => "radam",
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptimizerKind {
    type Err = OptimError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag {
            "adam" => Ok(Self::Adam),
            "sgd" => Ok(Self::Sgd),
            "adamW" => Ok(Self::AdamW),
            "radam" => Ok(Self::RAdam),
            other => Err(OptimError::UnknownSelector(other.to_string())),
        }
    }
}

impl TryFrom<String> for OptimizerKind {
    type Error = OptimError;

    fn try_from(tag: String) -> Result<Self, Self::Error> {
        tag.parse()
    }
}

/// Closed set of optimizers, dispatched statically.
#[derive(Debug, Clone)]
pub enum AnyOptimizer {
    Sgd(Sgd),
    Adam(Adam),
    RAdam(RAdam),
}

impl AnyOptimizer {
    /// Plain Adam ignores `weight_decay`; the other three apply it.
    pub fn from_config(kind: OptimizerKind, lr: f64, weight_decay: f64) -> Self {
        match kind {
            OptimizerKind::Adam => Self::Adam(Adam::new(lr, 0.0)),
            OptimizerKind::Sgd => Self::Sgd(Sgd::new(lr, 0.9, weight_decay)),
            OptimizerKind::AdamW => Self::Adam(Adam::adamw(lr, weight_decay)),
            OptimizerKind::RAdam => Self::RAdam(RAdam::new(lr, weight_decay)),
        }
    }
}

impl Optimizer for AnyOptimizer {
    fn step(&mut self, params: &mut ParamStore) -> Result<(), OptimError> {
        match self {
            Self::Sgd(inner) => inner.step(params),
            Self::Adam(inner) => inner.step(params),
            Self::RAdam(inner) => inner.step(params),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{IxDyn, arr1};

    fn store(value: f64, grad: f64) -> ParamStore {
        let mut store = ParamStore::new();
        store.insert("w", arr1(&[value]).into_dyn());
        store.get_mut("w").expect("w").grad.fill(grad);
        store
    }

    fn value(store: &ParamStore) -> f64 {
        store.get("w").expect("w").value[[0]]
    }

    #[test]
    fn sgd_momentum_accumulates_across_steps() {
        let mut params = store(1.0, 0.5);
        let mut sgd = Sgd::new(0.1, 0.9, 0.0);
        sgd.step(&mut params).expect("step 1");
        assert_abs_diff_eq!(value(&params), 1.0 - 0.05, epsilon = 1e-12);
        sgd.step(&mut params).expect("step 2");
        // buffer = 0.9 * 0.5 + 0.5
        assert_abs_diff_eq!(value(&params), 0.95 - 0.1 * 0.95, epsilon = 1e-12);
    }

    #[test]
    fn sgd_weight_decay_enters_the_gradient() {
        let mut params = store(2.0, 0.0);
        let mut sgd = Sgd::new(0.5, 0.0, 0.1);
        sgd.step(&mut params).expect("step");
        assert_abs_diff_eq!(value(&params), 2.0 - 0.5 * 0.2, epsilon = 1e-12);
    }

    #[test]
    fn adam_first_step_moves_by_learning_rate() {
        let mut params = store(1.0, 3.0);
        let mut adam = Adam::new(0.01, 0.0);
        adam.step(&mut params).expect("step");
        assert_abs_diff_eq!(value(&params), 0.99, epsilon = 1e-6);
    }

    #[test]
    fn adamw_decays_parameters_without_gradient() {
        let mut params = store(1.0, 0.0);
        let mut adamw = Adam::adamw(0.1, 0.5);
        adamw.step(&mut params).expect("step");
        assert_abs_diff_eq!(value(&params), 0.95, epsilon = 1e-12);
    }

    #[test]
    fn radam_starts_as_momentum_sgd() {
        let mut params = store(1.0, 2.0);
        let mut radam = RAdam::new(0.1, 0.0);
        radam.step(&mut params).expect("step");
        assert_abs_diff_eq!(value(&params), 1.0 - 0.1 * 2.0, epsilon = 1e-12);
    }

    #[test]
    fn radam_rectifies_after_warmup() {
        let mut params = store(0.0, 1.0);
        let mut radam = RAdam::new(0.01, 0.0);
        let mut previous = value(&params);
        for _ in 0..10 {
            radam.step(&mut params).expect("step");
            let current = value(&params);
            assert!(current < previous);
            previous = current;
        }
    }

    #[test]
    fn selectors_parse_and_reject_unsupported_values() {
        assert_eq!("adamW".parse::<OptimizerKind>().unwrap(), OptimizerKind::AdamW);
        assert_eq!("radam".parse::<OptimizerKind>().unwrap(), OptimizerKind::RAdam);
        for tag in ["lamb", "rmsprop", "ADAM"] {
            assert!(matches!(
                tag.parse::<OptimizerKind>(),
                Err(OptimError::UnknownSelector(_))
            ));
        }
    }

    #[test]
    fn plain_adam_ignores_weight_decay() {
        let mut with_decay = store(1.0, 0.0);
        let mut opt = AnyOptimizer::from_config(OptimizerKind::Adam, 0.1, 10.0);
        opt.step(&mut with_decay).expect("step");
        assert_abs_diff_eq!(value(&with_decay), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn strict_state_dict_loading() {
        let mut params = store(1.0, 4.0);
        let mut state = params.state_dict();
        state.insert("w".into(), arr1(&[7.0]).into_dyn());
        params.load_state_dict(&state).expect("load");
        assert_eq!(value(&params), 7.0);
        assert_eq!(params.get("w").expect("w").grad[[0]], 0.0);

        let mut extra = state.clone();
        extra.insert("b".into(), arr1(&[0.0]).into_dyn());
        assert!(matches!(
            params.load_state_dict(&extra),
            Err(OptimError::UnexpectedParameter(name)) if name == "b"
        ));

        let mut reshaped = state.clone();
        reshaped.insert("w".into(), ArrayD::zeros(IxDyn(&[2])));
        assert!(matches!(
            params.load_state_dict(&reshaped),
            Err(OptimError::StateShape { .. })
        ));

        assert!(matches!(
            params.load_state_dict(&StateDict::new()),
            Err(OptimError::MissingParameter(_))
        ));
    }

    #[test]
    fn mismatched_gradient_is_rejected() {
        let mut params = store(1.0, 0.0);
        params.get_mut("w").expect("w").grad = ArrayD::zeros(IxDyn(&[3]));
        let mut sgd = Sgd::new(0.1, 0.0, 0.0);
        assert!(matches!(
            sgd.step(&mut params),
            Err(OptimError::GradientShape { .. })
        ));
    }
}
