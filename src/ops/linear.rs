//! Linear operations (matrix multiplication, etc.)

use rand::Rng;

use crate::{
    error::{SiameseError, SiameseResult},
    ops::core::{missing_forward, Param, TensorOperation},
    tensor::{Shape, Tensor},
};

/// Fully connected operation `y = x Wᵀ + b` over `[batch, in]` inputs
#[derive(Debug, Clone)]
pub struct LinearOp {
    pub weight: Tensor,
    pub bias: Tensor,
    weight_grad: Tensor,
    bias_grad: Tensor,
    input: Option<Tensor>,
}

impl LinearOp {
    /// He-initialized weights of shape `[output_size, input_size]`, zero bias
    pub fn new<R: Rng + ?Sized>(input_size: usize, output_size: usize, rng: &mut R) -> SiameseResult<Self> {
        let std = (2.0 / input_size.max(1) as f32).sqrt();
        let weight = Tensor::randn(Shape::new([output_size, input_size]), std, rng)?;
        let bias = Tensor::zeros(Shape::new([output_size]));
        Ok(Self::from_parts(weight, bias))
    }

    pub fn from_parts(weight: Tensor, bias: Tensor) -> Self {
        Self {
            weight_grad: Tensor::zeros(weight.shape().clone()),
            bias_grad: Tensor::zeros(bias.shape().clone()),
            weight,
            bias,
            input: None,
        }
    }

    pub fn input_size(&self) -> usize {
        self.weight.shape().dims[1]
    }

    pub fn output_size(&self) -> usize {
        self.weight.shape().dims[0]
    }

    fn check_input(&self, shape: &Shape) -> SiameseResult<()> {
        if shape.rank() != 2 || shape.dims[1] != self.input_size() {
            return Err(SiameseError::shape_error(
                &format!("[batch, {}]", self.input_size()),
                &shape.to_string(),
                Some("flatten image inputs before a linear layer"),
            ));
        }
        Ok(())
    }
}

impl TensorOperation for LinearOp {
    fn forward(&mut self, input: &Tensor) -> SiameseResult<Tensor> {
        self.check_input(input.shape())?;
        let (batch, in_features, out_features) = (input.rows(), self.input_size(), self.output_size());
        let w = self.weight.as_slice();
        let b = self.bias.as_slice();

        let mut output = vec![0.0f32; batch * out_features];
        for (row, out_row) in input.iter_rows().zip(output.chunks_mut(out_features)) {
            for (o, out) in out_row.iter_mut().enumerate() {
                let w_row = &w[o * in_features..(o + 1) * in_features];
                *out = b[o] + w_row.iter().zip(row).map(|(w, x)| w * x).sum::<f32>();
            }
        }

        self.input = Some(input.clone());
        Tensor::from_vec(output, Shape::new([batch, out_features]))
    }

    fn backward(&mut self, grad_output: &Tensor) -> SiameseResult<Tensor> {
        let input = self.input.as_ref().ok_or_else(|| missing_forward(self.name()))?;
        let (in_features, out_features) = (self.input_size(), self.output_size());
        if grad_output.shape().dims != [input.rows(), out_features] {
            return Err(SiameseError::shape_error(
                &format!("[{}, {}]", input.rows(), out_features),
                &grad_output.shape().to_string(),
                None,
            ));
        }

        let w = self.weight.as_slice();
        let mut grad_input = vec![0.0f32; input.numel()];
        {
            let w_grad = self.weight_grad.as_slice_mut();
            let b_grad = self.bias_grad.as_slice_mut();
            for ((x, g), dx) in input
                .iter_rows()
                .zip(grad_output.iter_rows())
                .zip(grad_input.chunks_mut(in_features))
            {
                for (o, &g_o) in g.iter().enumerate() {
                    if g_o == 0.0 {
                        continue;
                    }
                    b_grad[o] += g_o;
                    let w_row = &w[o * in_features..(o + 1) * in_features];
                    let w_grad_row = &mut w_grad[o * in_features..(o + 1) * in_features];
                    for i in 0..in_features {
                        w_grad_row[i] += g_o * x[i];
                        dx[i] += g_o * w_row[i];
                    }
                }
            }
        }

        Tensor::from_vec(grad_input, input.shape().clone())
    }

    fn name(&self) -> &'static str {
        "LinearOp"
    }

    fn output_shape(&self, input_shape: &Shape) -> SiameseResult<Shape> {
        self.check_input(input_shape)?;
        Ok(Shape::new([input_shape.rows(), self.output_size()]))
    }

    fn parameters(&mut self) -> Vec<Param<'_>> {
        vec![
            Param { name: "weight", value: &mut self.weight, grad: &mut self.weight_grad },
            Param { name: "bias", value: &mut self.bias, grad: &mut self.bias_grad },
        ]
    }
}
