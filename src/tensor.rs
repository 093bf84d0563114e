//! Small numeric helpers shared by the transform pipeline and the adapters.
//!
//! Layout conventions: pixel arrays coming out of the decoder are HWC, network
//! inputs are NCHW and segmentation logits are CHW.

use image::RgbImage;
use ndarray::{Array2, Array3, Array4, ArrayView3, Axis, s};

use crate::error::ServiceError;

/// Converts an 8-bit RGB image to an HWC float array in `0.0..=255.0`.
pub fn image_to_hwc(image: &RgbImage) -> Array3<f32> {
    let (width, height) = image.dimensions();
    Array3::from_shape_fn((height as usize, width as usize, 3), |(y, x, c)| {
        image.get_pixel(x as u32, y as u32)[c] as f32
    })
}

pub fn hwc_to_chw(hwc: Array3<f32>) -> Array3<f32> {
    hwc.permuted_axes([2, 0, 1]).as_standard_layout().into_owned()
}

/// Bilinear resize of a CHW array using half-pixel centers
/// (`align_corners = false`).
pub fn resize_bilinear(input: ArrayView3<'_, f32>, out_h: usize, out_w: usize) -> Array3<f32> {
    let (channels, in_h, in_w) = input.dim();
    if (in_h, in_w) == (out_h, out_w) {
        return input.to_owned();
    }
    let rows = sample_positions(in_h, out_h);
    let cols = sample_positions(in_w, out_w);

    let mut out = Array3::<f32>::zeros((channels, out_h, out_w));
    for c in 0..channels {
        let plane = input.index_axis(Axis(0), c);
        let mut target = out.index_axis_mut(Axis(0), c);
        for (oy, &(y0, y1, ly)) in rows.iter().enumerate() {
            for (ox, &(x0, x1, lx)) in cols.iter().enumerate() {
                let top = plane[[y0, x0]] * (1.0 - lx) + plane[[y0, x1]] * lx;
                let bottom = plane[[y1, x0]] * (1.0 - lx) + plane[[y1, x1]] * lx;
                target[[oy, ox]] = top * (1.0 - ly) + bottom * ly;
            }
        }
    }
    out
}

fn sample_positions(input: usize, output: usize) -> Vec<(usize, usize, f32)> {
    let scale = input as f32 / output as f32;
    (0..output)
        .map(|dst| {
            let src = ((dst as f32 + 0.5) * scale - 0.5).max(0.0);
            let i0 = (src.floor() as usize).min(input - 1);
            let i1 = if i0 + 1 < input { i0 + 1 } else { i0 };
            (i0, i1, src - i0 as f32)
        })
        .collect()
}

/// Numerically stable softmax over a slice, in place.
pub fn softmax_in_place(values: &mut [f32]) {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return;
    }
    let mut sum = 0.0;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in values.iter_mut() {
            *v /= sum;
        }
    }
}

/// Per-pixel argmax across channels. The first maximum wins on ties.
pub fn argmax_channels(logits: ArrayView3<'_, f32>) -> Array2<u32> {
    let (channels, height, width) = logits.dim();
    Array2::from_shape_fn((height, width), |(y, x)| {
        let mut best = 0usize;
        let mut best_val = f32::NEG_INFINITY;
        for c in 0..channels {
            let v = logits[[c, y, x]];
            if v > best_val {
                best = c;
                best_val = v;
            }
        }
        best as u32
    })
}

/// Stacks equally shaped CHW tensors into one NCHW batch.
pub fn stack_batch(items: &[Array3<f32>]) -> Result<Array4<f32>, ServiceError> {
    let first = items
        .first()
        .ok_or_else(|| ServiceError::Inference("cannot build an empty batch".into()))?;
    let (c, h, w) = first.dim();
    let mut batch = Array4::<f32>::zeros((items.len(), c, h, w));
    for (idx, item) in items.iter().enumerate() {
        if item.dim() != (c, h, w) {
            return Err(ServiceError::Inference(format!(
                "transformed images differ in shape: {:?} vs {:?}; the transform list must \
                 produce a fixed size for batched models",
                item.dim(),
                (c, h, w)
            )));
        }
        batch.slice_mut(s![idx, .., .., ..]).assign(item);
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn softmax_sums_to_one() {
        let mut v = [1.0f32, 2.0, 3.0];
        softmax_in_place(&mut v);
        let sum: f32 = v.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(v[2] > v[1] && v[1] > v[0]);
    }

    #[test]
    fn argmax_prefers_first_on_ties() {
        let logits = Array3::from_shape_vec((2, 1, 2), vec![1.0, 0.0, 1.0, 5.0]).unwrap();
        let mask = argmax_channels(logits.view());
        assert_eq!(mask, array![[0u32, 1]]);
    }

    #[test]
    fn bilinear_identity_and_upsample() {
        let input = Array3::from_shape_vec((1, 2, 2), vec![0.0, 1.0, 2.0, 3.0]).unwrap();
        assert_eq!(resize_bilinear(input.view(), 2, 2), input);

        let up = resize_bilinear(input.view(), 4, 4);
        assert_eq!(up.dim(), (1, 4, 4));
        // Corners clamp to the source corners with half-pixel sampling.
        assert!((up[[0, 0, 0]] - 0.0).abs() < 1e-6);
        assert!((up[[0, 3, 3]] - 3.0).abs() < 1e-6);
        assert!((up[[0, 0, 1]] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn downsample_averages_neighbours() {
        let input = Array3::from_shape_vec((1, 2, 2), vec![0.0, 2.0, 4.0, 6.0]).unwrap();
        let down = resize_bilinear(input.view(), 1, 1);
        assert!((down[[0, 0, 0]] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn image_layout_is_hwc_then_chw() {
        let mut img = RgbImage::new(3, 2);
        img.put_pixel(2, 1, image::Rgb([10, 20, 30]));
        let hwc = image_to_hwc(&img);
        assert_eq!(hwc.dim(), (2, 3, 3));
        assert_eq!(hwc[[1, 2, 2]], 30.0);
        let chw = hwc_to_chw(hwc);
        assert_eq!(chw.dim(), (3, 2, 3));
        assert_eq!(chw[[1, 1, 2]], 20.0);
    }

    #[test]
    fn stacking_rejects_mismatched_shapes() {
        let a = Array3::<f32>::zeros((3, 4, 4));
        let b = Array3::<f32>::zeros((3, 4, 5));
        assert!(stack_batch(&[a.clone(), b]).is_err());
        assert_eq!(stack_batch(&[a.clone(), a]).unwrap().dim(), (2, 3, 4, 4));
    }
}
