use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder, VarMap};

/// Global average pooling followed by a dense layer.
///
/// Produces well-shaped logits for any label count without any trained
/// weights, which is all the stand-in classifier needs.
pub struct PooledLinear {
    head: Linear,
    // Keeps the randomly initialised parameters alive.
    _vars: VarMap,
}

impl PooledLinear {
    pub fn new(num_classes: usize, device: &Device) -> Result<Self> {
        let vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&vars, DType::F32, device);
        let head = candle_nn::linear(3, num_classes, vb.pp("head"))?;
        Ok(Self { head, _vars: vars })
    }
}

impl Module for PooledLinear {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        // (batch, 3, h, w) -> (batch, 3)
        let pooled = xs.mean((2, 3))?;
        self.head.forward(&pooled)
    }
}

/// ResNet-18 with the final layer sized to `num_classes`, torchvision naming.
pub fn resnet18(num_classes: usize, vb: VarBuilder<'static>) -> Result<Box<dyn Module + Send + Sync>> {
    let net = candle_transformers::models::resnet::resnet18(num_classes, vb)?;
    Ok(Box::new(net))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pooled_linear_emits_one_logit_per_class() {
        let model = PooledLinear::new(4, &Device::Cpu).unwrap();
        let xs = Tensor::zeros((2, 3, 16, 16), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(model.forward(&xs).unwrap().dims(), &[2, 4]);
    }

    #[test]
    fn resnet_head_is_boxed_with_owned_weights() {
        let vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&vars, DType::F32, &Device::Cpu);
        let model = resnet18(4, vb).unwrap();
        drop(vars);

        let xs = Tensor::zeros((1, 3, 64, 64), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(model.forward(&xs).unwrap().dims(), &[1, 4]);
    }
}
