//! Gradient-descent optimizers

use serde::{Deserialize, Serialize};

use crate::{
    error::{SiameseError, SiameseResult},
    ops::Param,
    tensor::Tensor,
};

/// Optimizer trait
///
/// `step` receives the parameters in the same order on every call; per-parameter
/// state (momentum, moment estimates) is matched by position.
pub trait Optimizer: Send + Sync {
    fn step(&mut self, params: &mut [Param<'_>]) -> SiameseResult<()>;
    fn learning_rate(&self) -> f32;
    fn set_learning_rate(&mut self, lr: f32);
    fn name(&self) -> &'static str;
}

/// Optimizer configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OptimizerConfig {
    Sgd { momentum: f32, weight_decay: f32 },
    Adam { beta1: f32, beta2: f32, eps: f32, weight_decay: f32 },
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig::Adam {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

impl OptimizerConfig {
    pub fn sgd() -> Self {
        OptimizerConfig::Sgd {
            momentum: 0.0,
            weight_decay: 0.0,
        }
    }

    pub fn validate(&self) -> SiameseResult<()> {
        let ok = match *self {
            OptimizerConfig::Sgd { momentum, weight_decay } => {
                (0.0..1.0).contains(&momentum) && weight_decay >= 0.0
            }
            OptimizerConfig::Adam { beta1, beta2, eps, weight_decay } => {
                (0.0..1.0).contains(&beta1) && (0.0..1.0).contains(&beta2) && eps > 0.0 && weight_decay >= 0.0
            }
        };
        if ok {
            Ok(())
        } else {
            Err(SiameseError::ConfigurationError(format!("Invalid optimizer settings: {:?}", self)))
        }
    }

    pub fn create_optimizer(&self, learning_rate: f32) -> Box<dyn Optimizer> {
        match *self {
            OptimizerConfig::Sgd { momentum, weight_decay } => {
                Box::new(Sgd::new(learning_rate, momentum, weight_decay))
            }
            OptimizerConfig::Adam { beta1, beta2, eps, weight_decay } => {
                Box::new(Adam::new(learning_rate, beta1, beta2, eps, weight_decay))
            }
        }
    }
}

fn check_state(name: &str, state: &[Tensor], params: &[Param<'_>]) -> SiameseResult<()> {
    if state.len() != params.len() {
        return Err(SiameseError::operation_error(
            name,
            &format!("optimizer tracks {} parameters but received {}", state.len(), params.len()),
        ));
    }
    for (slot, param) in state.iter().zip(params.iter()) {
        if slot.shape() != param.value.shape() {
            return Err(SiameseError::shape_error(
                &slot.shape().to_string(),
                &param.value.shape().to_string(),
                Some(&format!("parameter {} changed shape between steps", param.name)),
            ));
        }
    }
    Ok(())
}

/// Stochastic gradient descent with optional momentum and L2 weight decay
#[derive(Debug, Clone)]
pub struct Sgd {
    learning_rate: f32,
    momentum: f32,
    weight_decay: f32,
    velocity: Vec<Tensor>,
}

impl Sgd {
    pub fn new(learning_rate: f32, momentum: f32, weight_decay: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            weight_decay,
            velocity: Vec::new(),
        }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut [Param<'_>]) -> SiameseResult<()> {
        if self.velocity.is_empty() {
            self.velocity = params.iter().map(|p| Tensor::zeros(p.value.shape().clone())).collect();
        }
        check_state(self.name(), &self.velocity, params)?;

        for (param, velocity) in params.iter_mut().zip(self.velocity.iter_mut()) {
            let values = param.value.as_slice_mut();
            let grads = param.grad.as_slice();
            for ((w, &g), v) in values.iter_mut().zip(grads).zip(velocity.as_slice_mut()) {
                let g = g + self.weight_decay * *w;
                *v = self.momentum * *v + g;
                *w -= self.learning_rate * *v;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.learning_rate = lr;
    }

    fn name(&self) -> &'static str {
        "Sgd"
    }
}

/// Adam with bias-corrected moment estimates
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    weight_decay: f32,
    step_count: i32,
    m: Vec<Tensor>,
    v: Vec<Tensor>,
}

impl Adam {
    pub fn new(learning_rate: f32, beta1: f32, beta2: f32, eps: f32, weight_decay: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            eps,
            weight_decay,
            step_count: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    pub fn step_count(&self) -> i32 {
        self.step_count
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut [Param<'_>]) -> SiameseResult<()> {
        if self.m.is_empty() {
            self.m = params.iter().map(|p| Tensor::zeros(p.value.shape().clone())).collect();
            self.v = self.m.clone();
        }
        check_state(self.name(), &self.m, params)?;

        self.step_count += 1;
        let bias1 = 1.0 - self.beta1.powi(self.step_count);
        let bias2 = 1.0 - self.beta2.powi(self.step_count);

        for ((param, m), v) in params.iter_mut().zip(self.m.iter_mut()).zip(self.v.iter_mut()) {
            let values = param.value.as_slice_mut();
            let grads = param.grad.as_slice();
            for (((w, &g), m), v) in values
                .iter_mut()
                .zip(grads)
                .zip(m.as_slice_mut())
                .zip(v.as_slice_mut())
            {
                let g = g + self.weight_decay * *w;
                *m = self.beta1 * *m + (1.0 - self.beta1) * g;
                *v = self.beta2 * *v + (1.0 - self.beta2) * g * g;
                let m_hat = *m / bias1;
                let v_hat = *v / bias2;
                *w -= self.learning_rate * m_hat / (v_hat.sqrt() + self.eps);
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.learning_rate = lr;
    }

    fn name(&self) -> &'static str {
        "Adam"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Shape;

    fn quadratic_descent(optimizer: &mut dyn Optimizer, steps: usize) -> f32 {
        // minimize f(w) = sum(w^2), gradient 2w
        let mut value = Tensor::full(Shape::new([3]), 2.0);
        let mut grad = Tensor::zeros(Shape::new([3]));
        for _ in 0..steps {
            for (g, &w) in grad.as_slice_mut().iter_mut().zip(value.as_slice()) {
                *g = 2.0 * w;
            }
            let mut params = vec![Param {
                name: "w",
                value: &mut value,
                grad: &mut grad,
            }];
            optimizer.step(&mut params).unwrap();
        }
        value.as_slice().iter().map(|w| w * w).sum()
    }

    #[test]
    fn test_sgd_single_step() {
        let mut value = Tensor::full(Shape::new([2]), 1.0);
        let mut grad = Tensor::full(Shape::new([2]), 0.5);
        let mut sgd = Sgd::new(0.1, 0.0, 0.0);
        sgd.step(&mut [Param { name: "w", value: &mut value, grad: &mut grad }]).unwrap();
        assert!((value.as_slice()[0] - 0.95).abs() < 1e-6);
    }

    #[test]
    fn test_optimizers_decrease_quadratic() {
        let mut sgd = OptimizerConfig::Sgd { momentum: 0.9, weight_decay: 0.0 }.create_optimizer(0.01);
        assert!(quadratic_descent(sgd.as_mut(), 100) < 0.1);

        let mut adam = OptimizerConfig::default().create_optimizer(0.1);
        assert!(quadratic_descent(adam.as_mut(), 200) < 0.1);
    }

    #[test]
    fn test_learning_rate_accessors() {
        let mut adam = OptimizerConfig::default().create_optimizer(1e-3);
        assert_eq!(adam.learning_rate(), 1e-3);
        adam.set_learning_rate(5e-4);
        assert_eq!(adam.learning_rate(), 5e-4);
        assert_eq!(adam.name(), "Adam");
    }

    #[test]
    fn test_parameter_count_change_rejected() {
        let mut a = Tensor::zeros(Shape::new([1]));
        let mut ga = Tensor::zeros(Shape::new([1]));
        let mut b = Tensor::zeros(Shape::new([1]));
        let mut gb = Tensor::zeros(Shape::new([1]));
        let mut sgd = Sgd::new(0.1, 0.0, 0.0);
        sgd.step(&mut [Param { name: "a", value: &mut a, grad: &mut ga }]).unwrap();
        let result = sgd.step(&mut [
            Param { name: "a", value: &mut a, grad: &mut ga },
            Param { name: "b", value: &mut b, grad: &mut gb },
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_config_validation_and_serde() {
        assert!(OptimizerConfig::Sgd { momentum: 1.5, weight_decay: 0.0 }.validate().is_err());
        assert!(OptimizerConfig::default().validate().is_ok());
        let json = serde_json::to_string(&OptimizerConfig::sgd()).unwrap();
        assert!(json.contains("\"type\":\"sgd\""));
        let back: OptimizerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, OptimizerConfig::sgd());
    }
}
