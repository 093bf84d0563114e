//! Class-mask decomposition and run-length encoding.
//!
//! Row/column indices stay internal to this module. Anything handed to callers
//! goes through [`MaskBox::to_xyxy`], which maps columns to x and rows to y.

use ndarray::{Array2, ArrayView2, s};
use serde::Serialize;

use crate::error::ServiceError;

/// Tight box around the set pixels of a mask. Upper bounds are exclusive, so
/// `mask[row_min..row_max, col_min..col_max]` is the crop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MaskBox {
    pub row_min: usize,
    pub row_max: usize,
    pub col_min: usize,
    pub col_max: usize,
}

impl MaskBox {
    /// `[x_min, y_min, x_max, y_max]` in pixel space.
    pub fn to_xyxy(&self) -> [u32; 4] {
        [
            self.col_min as u32,
            self.row_min as u32,
            self.col_max as u32,
            self.row_max as u32,
        ]
    }

    pub fn height(&self) -> usize {
        self.row_max - self.row_min
    }

    pub fn width(&self) -> usize {
        self.col_max - self.col_min
    }
}

pub fn bounding_box(mask: ArrayView2<'_, bool>) -> Result<MaskBox, ServiceError> {
    let mut found: Option<MaskBox> = None;
    for ((row, col), &set) in mask.indexed_iter() {
        if !set {
            continue;
        }
        found = Some(match found {
            None => MaskBox {
                row_min: row,
                row_max: row + 1,
                col_min: col,
                col_max: col + 1,
            },
            Some(b) => MaskBox {
                row_min: b.row_min.min(row),
                row_max: b.row_max.max(row + 1),
                col_min: b.col_min.min(col),
                col_max: b.col_max.max(col + 1),
            },
        });
    }
    found.ok_or(ServiceError::EmptyMask)
}

pub fn crop(mask: ArrayView2<'_, bool>, bbox: &MaskBox) -> Array2<bool> {
    mask.slice(s![bbox.row_min..bbox.row_max, bbox.col_min..bbox.col_max])
        .to_owned()
}

/// Row-major run lengths, alternating zeros and ones, starting with zeros.
pub fn rle_encode(mask: ArrayView2<'_, bool>) -> Vec<u32> {
    let mut runs = Vec::new();
    let mut current = false;
    let mut length = 0u32;
    for &value in mask.iter() {
        if value == current {
            length += 1;
        } else {
            runs.push(length);
            current = value;
            length = 1;
        }
    }
    runs.push(length);
    runs
}

pub fn rle_decode(runs: &[u32], height: usize, width: usize) -> Result<Array2<bool>, ServiceError> {
    let total: u64 = runs.iter().map(|&r| r as u64).sum();
    if total != (height * width) as u64 {
        return Err(ServiceError::InvalidInput(format!(
            "run lengths cover {total} pixels, mask has {}",
            height * width
        )));
    }
    let mut flat = Vec::with_capacity(height * width);
    for (idx, &run) in runs.iter().enumerate() {
        let value = idx % 2 == 1;
        flat.extend(std::iter::repeat(value).take(run as usize));
    }
    Array2::from_shape_vec((height, width), flat)
        .map_err(|e| ServiceError::InvalidInput(e.to_string()))
}

/// One present class of a label mask.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassRegion {
    pub class_idx: usize,
    pub bbox: MaskBox,
    pub rle: Vec<u32>,
}

/// Splits a label mask into per-class regions for classes `1..num_classes`.
/// Class 0 is background. Absent classes produce no region.
pub fn decompose(
    labels: ArrayView2<'_, u32>,
    num_classes: usize,
) -> Result<Vec<ClassRegion>, ServiceError> {
    let mut present = vec![false; num_classes];
    for &label in labels.iter() {
        if let Some(slot) = present.get_mut(label as usize) {
            *slot = true;
        }
    }

    let mut regions = Vec::new();
    for class_idx in 1..num_classes {
        if !present[class_idx] {
            continue;
        }
        let indicator = labels.mapv(|v| v as usize == class_idx);
        let bbox = bounding_box(indicator.view())?;
        let cropped = crop(indicator.view(), &bbox);
        regions.push(ClassRegion {
            class_idx,
            bbox,
            rle: rle_encode(cropped.view()),
        });
    }
    Ok(regions)
}
