use candle_core::{Result, Tensor, D};
use candle_nn::{conv1d, conv2d, Conv1d, Conv1dConfig, Conv2d, Conv2dConfig, Module, VarBuilder};

/// A differentiable occupancy predictor.
///
/// Maps a batch of RGB images `(B, 3, S, S)` and query points `(B, 3, T)` to
/// per-point occupancy probabilities `(B, 1, T)` in `[0, 1]`. Parameter state
/// lives in the `VarMap` the model was built from; checkpointing goes
/// through that map.
pub trait OccupancyModel {
    fn forward(&self, images: &Tensor, points: &Tensor) -> Result<Tensor>;
}

#[derive(Debug)]
pub struct ConvBlock {
    conv1: Conv2d,
    conv2: Conv2d,
}

impl ConvBlock {
    pub fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv1 = conv2d(in_channels, out_channels, 3, conv_cfg, vb.pp("conv1"))?;
        let conv2 = conv2d(out_channels, out_channels, 3, conv_cfg, vb.pp("conv2"))?;
        Ok(Self { conv1, conv2 })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.conv1.forward(x)?.relu()?;
        self.conv2.forward(&x)?.relu()
    }
}

/// Image encoder feeding a per-point conv1d decoder.
///
/// The encoder halves the spatial extent four times and mean-pools the rest,
/// producing one global feature vector per image. That vector is broadcast
/// over the query points, concatenated with per-point features, and decoded
/// to an occupancy probability per point.
#[derive(Debug)]
pub struct OccupancyNet {
    enc1: ConvBlock,
    enc2: ConvBlock,
    enc3: ConvBlock,
    enc4: ConvBlock,
    point1: Conv1d,
    point2: Conv1d,
    fuse1: Conv1d,
    fuse2: Conv1d,
    occupancy_head: Conv1d,
}

impl OccupancyNet {
    pub fn new(base_channels: usize, vb: VarBuilder) -> Result<Self> {
        let c1 = base_channels;
        let c2 = c1 * 2;
        let c3 = c2 * 2;
        let c4 = c3 * 2;

        let enc1 = ConvBlock::new(3, c1, vb.pp("enc1"))?;
        let enc2 = ConvBlock::new(c1, c2, vb.pp("enc2"))?;
        let enc3 = ConvBlock::new(c2, c3, vb.pp("enc3"))?;
        let enc4 = ConvBlock::new(c3, c4, vb.pp("enc4"))?;

        let point_cfg = Conv1dConfig::default();
        let point1 = conv1d(3, c2, 1, point_cfg, vb.pp("point1"))?;
        let point2 = conv1d(c2, c3, 1, point_cfg, vb.pp("point2"))?;
        let fuse1 = conv1d(c3 + c4, c4, 1, point_cfg, vb.pp("fuse1"))?;
        let fuse2 = conv1d(c4, c2, 1, point_cfg, vb.pp("fuse2"))?;
        let occupancy_head = conv1d(c2, 1, 1, point_cfg, vb.pp("occupancy_head"))?;

        Ok(Self {
            enc1,
            enc2,
            enc3,
            enc4,
            point1,
            point2,
            fuse1,
            fuse2,
            occupancy_head,
        })
    }
}

impl OccupancyModel for OccupancyNet {
    fn forward(&self, images: &Tensor, points: &Tensor) -> Result<Tensor> {
        let x = self.enc1.forward(images)?.max_pool2d(2)?;
        let x = self.enc2.forward(&x)?.max_pool2d(2)?;
        let x = self.enc3.forward(&x)?.max_pool2d(2)?;
        let x = self.enc4.forward(&x)?.max_pool2d(2)?;
        // (B, C4, h, w) -> (B, C4)
        let global = x.mean(D::Minus1)?.mean(D::Minus1)?;

        let p = self.point1.forward(points)?.relu()?;
        let p = self.point2.forward(&p)?.relu()?;

        let (batch, channels) = global.dims2()?;
        let query_count = p.dim(2)?;
        let global = global
            .unsqueeze(2)?
            .expand((batch, channels, query_count))?
            .contiguous()?;

        let fused = Tensor::cat(&[&p, &global], 1)?;
        let fused = self.fuse1.forward(&fused)?.relu()?;
        let fused = self.fuse2.forward(&fused)?.relu()?;
        let logits = self.occupancy_head.forward(&fused)?;
        candle_nn::ops::sigmoid(&logits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    #[test]
    fn forward_produces_per_point_probabilities() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = OccupancyNet::new(2, vb).unwrap();

        let images = Tensor::zeros((2, 3, 16, 16), DType::F32, &device).unwrap();
        let points = Tensor::zeros((2, 3, 8), DType::F32, &device).unwrap();
        let pred = model.forward(&images, &points).unwrap();
        assert_eq!(pred.dims(), &[2, 1, 8]);

        let values = pred.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn query_count_follows_the_points_tensor() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = OccupancyNet::new(2, vb).unwrap();

        let images = Tensor::zeros((1, 3, 16, 16), DType::F32, &device).unwrap();
        let points = Tensor::zeros((1, 3, 27), DType::F32, &device).unwrap();
        let pred = model.forward(&images, &points).unwrap();
        assert_eq!(pred.dims(), &[1, 1, 27]);
    }
}
