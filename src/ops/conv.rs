//! Convolution operations

use rand::Rng;

use crate::{
    error::{SiameseError, SiameseResult},
    ops::core::{missing_forward, Param, TensorOperation},
    tensor::{Shape, Tensor},
};

fn nchw(shape: &Shape, operation: &str) -> SiameseResult<(usize, usize, usize, usize)> {
    match shape.as_slice() {
        &[b, c, h, w] => Ok((b, c, h, w)),
        _ => Err(SiameseError::shape_error(
            "[batch, channels, height, width]",
            &shape.to_string(),
            Some(&format!("{} expects 4-D image batches", operation)),
        )),
    }
}

/// 2-D convolution over `[batch, channels, height, width]` inputs
#[derive(Debug, Clone)]
pub struct Conv2dOp {
    pub weight: Tensor,
    pub bias: Tensor,
    weight_grad: Tensor,
    bias_grad: Tensor,
    stride: usize,
    padding: usize,
    input: Option<Tensor>,
}

impl Conv2dOp {
    /// He-initialized square kernels of shape `[out_channels, in_channels, k, k]`
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        rng: &mut R,
    ) -> SiameseResult<Self> {
        if kernel_size == 0 || stride == 0 {
            return Err(SiameseError::InvalidInput(
                "kernel size and stride must be positive".to_string(),
            ));
        }
        let fan_in = in_channels * kernel_size * kernel_size;
        let std = (2.0 / fan_in.max(1) as f32).sqrt();
        let weight = Tensor::randn(
            Shape::new([out_channels, in_channels, kernel_size, kernel_size]),
            std,
            rng,
        )?;
        let bias = Tensor::zeros(Shape::new([out_channels]));
        Ok(Self::from_parts(weight, bias, stride, padding))
    }

    pub fn from_parts(weight: Tensor, bias: Tensor, stride: usize, padding: usize) -> Self {
        Self {
            weight_grad: Tensor::zeros(weight.shape().clone()),
            bias_grad: Tensor::zeros(bias.shape().clone()),
            weight,
            bias,
            stride,
            padding,
            input: None,
        }
    }

    fn kernel(&self) -> (usize, usize, usize) {
        let dims = self.weight.shape().as_slice();
        (dims[0], dims[1], dims[2])
    }

    fn output_hw(&self, h: usize, w: usize) -> SiameseResult<(usize, usize)> {
        let (_, _, k) = self.kernel();
        let (ph, pw) = (h + 2 * self.padding, w + 2 * self.padding);
        if ph < k || pw < k {
            return Err(SiameseError::shape_error(
                &format!("spatial size of at least {}x{} after padding", k, k),
                &format!("{}x{}", ph, pw),
                None,
            ));
        }
        Ok(((ph - k) / self.stride + 1, (pw - k) / self.stride + 1))
    }

    /// Input coordinate for output position `o` and kernel offset `k`, if inside the image
    fn source(&self, o: usize, k: usize, extent: usize) -> Option<usize> {
        let pos = (o * self.stride + k).checked_sub(self.padding)?;
        (pos < extent).then_some(pos)
    }
}

impl TensorOperation for Conv2dOp {
    fn forward(&mut self, input: &Tensor) -> SiameseResult<Tensor> {
        let out_shape = self.output_shape(input.shape())?;
        let (batch, channels, h, w) = nchw(input.shape(), self.name())?;
        let (out_c, _, k) = self.kernel();
        let (oh, ow) = (out_shape.dims[2], out_shape.dims[3]);

        let x = input.as_slice();
        let wt = self.weight.as_slice();
        let bias = self.bias.as_slice();
        let mut out = vec![0.0f32; out_shape.total_elements()];

        for b in 0..batch {
            for o in 0..out_c {
                let out_base = (b * out_c + o) * oh * ow;
                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut acc = bias[o];
                        for c in 0..channels {
                            let in_base = (b * channels + c) * h * w;
                            let w_base = (o * channels + c) * k * k;
                            for ky in 0..k {
                                let Some(iy) = self.source(oy, ky, h) else { continue };
                                for kx in 0..k {
                                    let Some(ix) = self.source(ox, kx, w) else { continue };
                                    acc += wt[w_base + ky * k + kx] * x[in_base + iy * w + ix];
                                }
                            }
                        }
                        out[out_base + oy * ow + ox] = acc;
                    }
                }
            }
        }

        self.input = Some(input.clone());
        Tensor::from_vec(out, out_shape)
    }

    fn backward(&mut self, grad_output: &Tensor) -> SiameseResult<Tensor> {
        let input = self.input.take().ok_or_else(|| missing_forward(self.name()))?;
        let expected = self.output_shape(input.shape())?;
        if grad_output.shape() != &expected {
            return Err(SiameseError::shape_error(
                &expected.to_string(),
                &grad_output.shape().to_string(),
                None,
            ));
        }
        let (batch, channels, h, w) = nchw(input.shape(), self.name())?;
        let (out_c, _, k) = self.kernel();
        let (oh, ow) = (expected.dims[2], expected.dims[3]);

        let x = input.as_slice();
        let g = grad_output.as_slice();
        let mut dx = vec![0.0f32; input.numel()];
        let mut w_grad = std::mem::replace(&mut self.weight_grad, Tensor::zeros(Shape::new([0])));
        let mut b_grad = std::mem::replace(&mut self.bias_grad, Tensor::zeros(Shape::new([0])));
        {
            let wt = self.weight.as_slice();
            let dw = w_grad.as_slice_mut();
            let db = b_grad.as_slice_mut();
            for b in 0..batch {
                for o in 0..out_c {
                    let out_base = (b * out_c + o) * oh * ow;
                    for oy in 0..oh {
                        for ox in 0..ow {
                            let g_val = g[out_base + oy * ow + ox];
                            if g_val == 0.0 {
                                continue;
                            }
                            db[o] += g_val;
                            for c in 0..channels {
                                let in_base = (b * channels + c) * h * w;
                                let w_base = (o * channels + c) * k * k;
                                for ky in 0..k {
                                    let Some(iy) = self.source(oy, ky, h) else { continue };
                                    for kx in 0..k {
                                        let Some(ix) = self.source(ox, kx, w) else { continue };
                                        let xi = in_base + iy * w + ix;
                                        let wi = w_base + ky * k + kx;
                                        dw[wi] += g_val * x[xi];
                                        dx[xi] += g_val * wt[wi];
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        self.weight_grad = w_grad;
        self.bias_grad = b_grad;

        let grad_input = Tensor::from_vec(dx, input.shape().clone());
        self.input = Some(input);
        grad_input
    }

    fn name(&self) -> &'static str {
        "Conv2dOp"
    }

    fn output_shape(&self, input_shape: &Shape) -> SiameseResult<Shape> {
        let (batch, channels, h, w) = nchw(input_shape, self.name())?;
        let (out_c, in_c, _) = self.kernel();
        if channels != in_c {
            return Err(SiameseError::shape_error(
                &format!("{} input channels", in_c),
                &format!("{} channels in {}", channels, input_shape),
                None,
            ));
        }
        let (oh, ow) = self.output_hw(h, w)?;
        Ok(Shape::new([batch, out_c, oh, ow]))
    }

    fn parameters(&mut self) -> Vec<Param<'_>> {
        vec![
            Param { name: "weight", value: &mut self.weight, grad: &mut self.weight_grad },
            Param { name: "bias", value: &mut self.bias, grad: &mut self.bias_grad },
        ]
    }
}

/// Non-overlapping max pooling (`stride == kernel_size`, no padding)
#[derive(Debug, Clone)]
pub struct MaxPool2dOp {
    kernel_size: usize,
    input_shape: Option<Shape>,
    argmax: Vec<usize>,
}

impl MaxPool2dOp {
    pub fn new(kernel_size: usize) -> Self {
        Self {
            kernel_size: kernel_size.max(1),
            input_shape: None,
            argmax: Vec::new(),
        }
    }
}

impl TensorOperation for MaxPool2dOp {
    fn forward(&mut self, input: &Tensor) -> SiameseResult<Tensor> {
        let out_shape = self.output_shape(input.shape())?;
        let (batch, channels, h, w) = nchw(input.shape(), self.name())?;
        let (oh, ow) = (out_shape.dims[2], out_shape.dims[3]);
        let k = self.kernel_size;
        let x = input.as_slice();

        let mut out = Vec::with_capacity(out_shape.total_elements());
        self.argmax.clear();
        for plane in 0..batch * channels {
            let base = plane * h * w;
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut best = f32::NEG_INFINITY;
                    let mut best_idx = base + oy * k * w + ox * k;
                    for ky in 0..k {
                        for kx in 0..k {
                            let idx = base + (oy * k + ky) * w + ox * k + kx;
                            if x[idx] > best {
                                best = x[idx];
                                best_idx = idx;
                            }
                        }
                    }
                    out.push(best);
                    self.argmax.push(best_idx);
                }
            }
        }

        self.input_shape = Some(input.shape().clone());
        Tensor::from_vec(out, out_shape)
    }

    fn backward(&mut self, grad_output: &Tensor) -> SiameseResult<Tensor> {
        let input_shape = self.input_shape.as_ref().ok_or_else(|| missing_forward("MaxPool2dOp"))?;
        if grad_output.numel() != self.argmax.len() {
            return Err(SiameseError::shape_error(
                &format!("{} gradient elements", self.argmax.len()),
                &grad_output.shape().to_string(),
                None,
            ));
        }
        let mut dx = vec![0.0f32; input_shape.total_elements()];
        for (&idx, &g) in self.argmax.iter().zip(grad_output.as_slice()) {
            dx[idx] += g;
        }
        Tensor::from_vec(dx, input_shape.clone())
    }

    fn name(&self) -> &'static str {
        "MaxPool2dOp"
    }

    fn output_shape(&self, input_shape: &Shape) -> SiameseResult<Shape> {
        let (batch, channels, h, w) = nchw(input_shape, self.name())?;
        let k = self.kernel_size;
        if h < k || w < k {
            return Err(SiameseError::shape_error(
                &format!("spatial size of at least {}x{}", k, k),
                &format!("{}x{}", h, w),
                None,
            ));
        }
        Ok(Shape::new([batch, channels, h / k, w / k]))
    }
}
