//! Resolution changes between Unet levels

use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::PaddingConfig2d;
use burn::prelude::*;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};

/// 2x downsampling with a stride-2, 4x4 convolution
#[derive(Module, Debug)]
pub struct Down2x<B: Backend> {
    pub conv: Conv2d<B>,
}

impl<B: Backend> Down2x<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([channels, channels], [4, 4])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        Self { conv }
    }

    /// Spatial size after one downsampling, `None` below 2
    pub fn output_size(size: usize) -> Option<usize> {
        size.checked_sub(2).map(|rest| rest / 2 + 1)
    }

    /// `[b, c, h, w]` -> `[b, c, floor(h / 2), floor(w / 2)]`
    ///
    /// Both spatial sizes must be at least 2, see [`Down2x::output_size`].
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.conv.forward(x)
    }
}

/// 2x upsampling with a stride-2, 4x4 transposed convolution
#[derive(Module, Debug)]
pub struct Up2x<B: Backend> {
    pub conv: ConvTranspose2d<B>,
}

impl<B: Backend> Up2x<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        let conv = ConvTranspose2dConfig::new([channels, channels], [4, 4])
            .with_stride([2, 2])
            .with_padding([1, 1])
            .init(device);
        Self { conv }
    }

    /// `[b, c, h, w]` -> `[b, c, 2h, 2w]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.conv.forward(x)
    }
}

/// Bilinear resize of the spatial axes to `[height, width]`
///
/// Returns the input untouched when it already has the target size.
pub fn resize_to<B: Backend>(x: Tensor<B, 4>, size: [usize; 2]) -> Tensor<B, 4> {
    let [_, _, height, width] = x.dims();
    if [height, width] == size {
        return x;
    }
    interpolate(x, size, InterpolateOptions::new(InterpolateMode::Bilinear))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_down_halves() {
        let device = Default::default();
        let down = Down2x::<TestBackend>::new(4, &device);
        let x = Tensor::zeros([1, 4, 16, 12], &device);
        assert_eq!(down.forward(x).dims(), [1, 4, 8, 6]);

        let odd = Tensor::zeros([1, 4, 15, 9], &device);
        assert_eq!(down.forward(odd).dims(), [1, 4, 7, 4]);
    }

    #[test]
    fn test_output_size() {
        assert_eq!(Down2x::<TestBackend>::output_size(16), Some(8));
        assert_eq!(Down2x::<TestBackend>::output_size(15), Some(7));
        assert_eq!(Down2x::<TestBackend>::output_size(2), Some(1));
        assert_eq!(Down2x::<TestBackend>::output_size(1), None);
        assert_eq!(Down2x::<TestBackend>::output_size(0), None);
    }

    #[test]
    fn test_up_doubles() {
        let device = Default::default();
        let up = Up2x::<TestBackend>::new(4, &device);
        let x = Tensor::zeros([2, 4, 7, 4], &device);
        assert_eq!(up.forward(x).dims(), [2, 4, 14, 8]);
    }

    #[test]
    fn test_resize_to_target() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::random([1, 3, 14, 8], Distribution::Default, &device);
        assert_eq!(resize_to(x, [15, 9]).dims(), [1, 3, 15, 9]);
    }

    #[test]
    fn test_resize_same_size_is_identity() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::random([1, 2, 5, 5], Distribution::Default, &device);
        let y = resize_to(x.clone(), [5, 5]);
        assert_eq!(
            y.into_data().to_vec::<f32>().unwrap(),
            x.into_data().to_vec::<f32>().unwrap()
        );
    }
}
