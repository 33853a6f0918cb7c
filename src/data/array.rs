//! Labelled N-dimensional measurement arrays.
//!
//! A [`DataArray`] wraps a contiguous `ndarray` buffer with the metadata a
//! measurement needs: a name (a valid identifier, so it can double as a
//! document field), a human-readable label, a physical unit, a setpoint flag
//! and an ordered list of axis arrays. Axis arrays are shared handles
//! ([`ArrayRef`]); copying a `DataArray` deep-copies the buffer but keeps
//! sharing its axes.
//!
//! ## Shape rules
//!
//! - A *setpoint* array with `k` axis arrays requires axis `i` to have the
//!   shape of this array's first `i + 1` dimensions.
//! - A *data* (non-setpoint) array requires every axis shape to be a prefix
//!   of its own shape, and the largest axis to match its shape exactly.

use std::sync::Arc;

use ndarray::{ArrayD, Axis, IxDyn};
use parking_lot::RwLock;

use crate::error::{LabError, LabResult};
use crate::validation::is_valid_identifier;

/// Shared handle to a [`DataArray`].
///
/// Axis arrays and dataset entries are shared through this handle so that a
/// setpoint array mutated by the producer is observed by every data array
/// referencing it.
pub type ArrayRef = Arc<RwLock<DataArray>>;

/// An N-dimensional numeric array with measurement metadata.
#[derive(Debug, Clone)]
pub struct DataArray {
    name: String,
    label: String,
    unit: String,
    is_setpoint: bool,
    data: ArrayD<f64>,
    set_arrays: Vec<ArrayRef>,
}

impl DataArray {
    /// Starts building an array with the given name.
    pub fn builder(name: impl Into<String>) -> DataArrayBuilder {
        DataArrayBuilder {
            name: name.into(),
            label: String::new(),
            unit: String::new(),
            is_setpoint: false,
            shape: None,
            preset_data: None,
            set_arrays: Vec::new(),
        }
    }

    /// The array name; immutable once the array is inside a dataset.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Physical unit of the elements.
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Whether this array parametrises indices of data arrays.
    pub fn is_setpoint(&self) -> bool {
        self.is_setpoint
    }

    /// The array shape.
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.data.ndim()
    }

    /// Element strides of the backing buffer, in elements.
    pub fn strides(&self) -> &[isize] {
        self.data.strides()
    }

    /// Dtype descriptor of the backing buffer.
    pub fn dtype(&self) -> &'static str {
        "<f8"
    }

    /// The ordered axis arrays.
    pub fn set_arrays(&self) -> &[ArrayRef] {
        &self.set_arrays
    }

    /// Read-only view of the numeric backing.
    ///
    /// Arithmetic is done on this `ndarray` view; results are plain numeric
    /// arrays, not labelled ones.
    pub fn values(&self) -> &ArrayD<f64> {
        &self.data
    }

    /// Mutable view of the numeric backing.
    pub fn values_mut(&mut self) -> &mut ArrayD<f64> {
        &mut self.data
    }

    /// Reads one element at a full index tuple.
    pub fn get(&self, index: &[usize]) -> LabResult<f64> {
        self.data
            .get(IxDyn(index))
            .copied()
            .ok_or_else(|| self.out_of_bounds(index))
    }

    /// Writes one element at a full index tuple.
    pub fn set(&mut self, index: &[usize], value: f64) -> LabResult<()> {
        let oob = self.out_of_bounds(index);
        match self.data.get_mut(IxDyn(index)) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(oob),
        }
    }

    /// Writes a one-dimensional block along the trailing dimension.
    ///
    /// `index` addresses all but the last dimension; the block must have the
    /// length of the trailing dimension.
    pub fn set_block(&mut self, index: &[usize], block: &[f64]) -> LabResult<()> {
        if index.len() + 1 != self.ndim() {
            return Err(LabError::DimensionMismatch {
                name: self.name.clone(),
                reason: format!(
                    "block write at {:?} needs {} leading indices for shape {:?}",
                    index,
                    self.ndim().saturating_sub(1),
                    self.shape()
                ),
            });
        }
        let oob = self.out_of_bounds(index);
        let mut view = self.data.view_mut();
        for &i in index {
            if i >= view.shape()[0] {
                return Err(oob);
            }
            view = view.index_axis_move(Axis(0), i);
        }
        if view.len() != block.len() {
            return Err(LabError::DimensionMismatch {
                name: self.name.clone(),
                reason: format!(
                    "block of length {} does not fit trailing dimension of length {}",
                    block.len(),
                    view.len()
                ),
            });
        }
        for (slot, value) in view.iter_mut().zip(block) {
            *slot = *value;
        }
        Ok(())
    }

    /// Wraps the array in a shared handle.
    pub fn into_shared(self) -> ArrayRef {
        Arc::new(RwLock::new(self))
    }

    /// Whether two arrays agree on name, shape and setpoint flag.
    ///
    /// This is the structural equivalence used when comparing setpoint lists
    /// across arrays and channels.
    pub fn same_structure(&self, other: &DataArray) -> bool {
        self.name == other.name
            && self.shape() == other.shape()
            && self.is_setpoint == other.is_setpoint
    }

    fn out_of_bounds(&self, index: &[usize]) -> LabError {
        LabError::IndexOutOfBounds {
            index: index.to_vec(),
            shape: self.shape().to_vec(),
        }
    }
}

/// Equality compares axis handle identity plus buffer value equality.
impl PartialEq for DataArray {
    fn eq(&self, other: &Self) -> bool {
        self.set_arrays.len() == other.set_arrays.len()
            && self
                .set_arrays
                .iter()
                .zip(&other.set_arrays)
                .all(|(a, b)| Arc::ptr_eq(a, b))
            && self.data == other.data
    }
}

impl std::ops::Add<&DataArray> for &DataArray {
    type Output = ArrayD<f64>;

    fn add(self, rhs: &DataArray) -> ArrayD<f64> {
        &self.data + &rhs.data
    }
}

impl std::ops::Sub<&DataArray> for &DataArray {
    type Output = ArrayD<f64>;

    fn sub(self, rhs: &DataArray) -> ArrayD<f64> {
        &self.data - &rhs.data
    }
}

impl std::ops::Mul<&DataArray> for &DataArray {
    type Output = ArrayD<f64>;

    fn mul(self, rhs: &DataArray) -> ArrayD<f64> {
        &self.data * &rhs.data
    }
}

impl std::ops::Div<&DataArray> for &DataArray {
    type Output = ArrayD<f64>;

    fn div(self, rhs: &DataArray) -> ArrayD<f64> {
        &self.data / &rhs.data
    }
}

impl std::ops::Mul<f64> for &DataArray {
    type Output = ArrayD<f64>;

    fn mul(self, rhs: f64) -> ArrayD<f64> {
        &self.data * rhs
    }
}

impl std::ops::Add<f64> for &DataArray {
    type Output = ArrayD<f64>;

    fn add(self, rhs: f64) -> ArrayD<f64> {
        &self.data + rhs
    }
}

/// Builder for [`DataArray`].
#[derive(Debug)]
pub struct DataArrayBuilder {
    name: String,
    label: String,
    unit: String,
    is_setpoint: bool,
    shape: Option<Vec<usize>>,
    preset_data: Option<ArrayD<f64>>,
    set_arrays: Vec<ArrayRef>,
}

impl DataArrayBuilder {
    /// Sets the human-readable label.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Sets the physical unit.
    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Marks the array as a setpoint axis.
    pub fn setpoint(mut self, is_setpoint: bool) -> Self {
        self.is_setpoint = is_setpoint;
        self
    }

    /// Allocates the buffer with this shape, filled with NaN.
    pub fn shape(mut self, shape: &[usize]) -> Self {
        self.shape = Some(shape.to_vec());
        self
    }

    /// Uses a copy of this data as the buffer.
    pub fn preset_data(mut self, data: ArrayD<f64>) -> Self {
        self.preset_data = Some(data);
        self
    }

    /// Sets the ordered axis arrays.
    pub fn set_arrays(mut self, set_arrays: Vec<ArrayRef>) -> Self {
        self.set_arrays = set_arrays;
        self
    }

    /// Validates and builds the array.
    pub fn build(self) -> LabResult<DataArray> {
        is_valid_identifier(&self.name)
            .map_err(|_| LabError::InvalidIdentifier(self.name.clone()))?;

        let data = match (self.shape, self.preset_data) {
            (None, None) => return Err(LabError::MissingShape(self.name)),
            (None, Some(data)) => data,
            (Some(shape), None) => ArrayD::from_elem(IxDyn(&shape), f64::NAN),
            (Some(shape), Some(data)) => {
                if data.shape() != shape.as_slice() {
                    return Err(LabError::DimensionMismatch {
                        name: self.name,
                        reason: format!(
                            "preset data has shape {:?}, requested {:?}",
                            data.shape(),
                            shape
                        ),
                    });
                }
                data
            }
        };

        validate_set_arrays(&self.name, self.is_setpoint, data.shape(), &self.set_arrays)?;

        Ok(DataArray {
            name: self.name,
            label: self.label,
            unit: self.unit,
            is_setpoint: self.is_setpoint,
            data,
            set_arrays: self.set_arrays,
        })
    }

    /// Validates, builds, and wraps in a shared handle.
    pub fn build_shared(self) -> LabResult<ArrayRef> {
        Ok(self.build()?.into_shared())
    }
}

fn validate_set_arrays(
    name: &str,
    is_setpoint: bool,
    shape: &[usize],
    set_arrays: &[ArrayRef],
) -> LabResult<()> {
    let mismatch = |reason: String| LabError::DimensionMismatch {
        name: name.to_string(),
        reason,
    };

    if is_setpoint {
        // Axis i broadcasts over the outer i+1 indices of this array.
        for (i, axis) in set_arrays.iter().enumerate() {
            let axis = axis.read();
            let expected = shape.get(..i + 1).ok_or_else(|| {
                mismatch(format!(
                    "{} axis arrays for a {}-dimensional setpoint",
                    set_arrays.len(),
                    shape.len()
                ))
            })?;
            if axis.shape() != expected {
                return Err(mismatch(format!(
                    "axis {} ('{}') has shape {:?}, expected {:?}",
                    i,
                    axis.name(),
                    axis.shape(),
                    expected
                )));
            }
        }
        return Ok(());
    }

    if set_arrays.is_empty() {
        return Ok(());
    }

    let mut max_ndim = 0;
    for (i, axis) in set_arrays.iter().enumerate() {
        let axis = axis.read();
        let ndim = axis.ndim();
        if ndim > shape.len() || axis.shape() != &shape[..ndim] {
            return Err(mismatch(format!(
                "axis {} ('{}') has shape {:?}, expected {:?}",
                i,
                axis.name(),
                axis.shape(),
                shape.get(..ndim).unwrap_or(shape)
            )));
        }
        max_ndim = max_ndim.max(ndim);
    }
    if max_ndim != shape.len() {
        return Err(mismatch(format!(
            "largest axis covers {} of {} dimensions",
            max_ndim,
            shape.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    fn setpoint(name: &str, shape: &[usize], axes: Vec<ArrayRef>) -> ArrayRef {
        DataArray::builder(name)
            .setpoint(true)
            .shape(shape)
            .set_arrays(axes)
            .build_shared()
            .expect("setpoint array")
    }

    #[test]
    fn test_nested_setpoint_and_data_array_shapes_accepted() {
        let x = setpoint("x", &[10], vec![]);
        let y = setpoint("y", &[10, 5], vec![x.clone()]);
        let z = DataArray::builder("z")
            .shape(&[10, 5])
            .set_arrays(vec![y, x])
            .build();
        assert!(z.is_ok());
    }

    #[test]
    fn test_data_array_shape_mismatch_rejected() {
        let x = setpoint("x", &[10], vec![]);
        let y = setpoint("y", &[10, 5], vec![x.clone()]);
        let z = DataArray::builder("z")
            .shape(&[10, 6])
            .set_arrays(vec![x, y])
            .build();
        assert!(matches!(z, Err(LabError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_setpoint_axis_shape_mismatch_rejected() {
        let x = setpoint("x", &[12], vec![]);
        let y = DataArray::builder("y")
            .setpoint(true)
            .shape(&[10, 5])
            .set_arrays(vec![x])
            .build();
        assert!(matches!(y, Err(LabError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_largest_axis_must_cover_all_dimensions() {
        let x = setpoint("x", &[10], vec![]);
        let z = DataArray::builder("z")
            .shape(&[10, 5])
            .set_arrays(vec![x])
            .build();
        assert!(matches!(z, Err(LabError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_neither_shape_nor_preset_data_rejected() {
        let result = DataArray::builder("empty").build();
        assert!(matches!(result, Err(LabError::MissingShape(_))));
    }

    #[test]
    fn test_invalid_identifier_rejected() {
        let result = DataArray::builder("not a name").shape(&[2]).build();
        assert!(matches!(result, Err(LabError::InvalidIdentifier(_))));
    }

    #[test]
    fn test_preset_data_initialises_buffer() {
        let array = DataArray::builder("preset")
            .preset_data(arr1(&[1.0, 2.0, 3.0]).into_dyn())
            .build()
            .expect("array");
        assert_eq!(array.shape(), &[3]);
        assert_eq!(array.get(&[1]).expect("get"), 2.0);
    }

    #[test]
    fn test_shape_allocation_fills_with_nan() {
        let array = DataArray::builder("blank").shape(&[2, 2]).build().expect("array");
        assert!(array.get(&[0, 0]).expect("get").is_nan());
    }

    #[test]
    fn test_element_access_out_of_bounds() {
        let mut array = DataArray::builder("a").shape(&[5, 5]).build().expect("array");
        assert!(matches!(
            array.get(&[5, 0]),
            Err(LabError::IndexOutOfBounds { .. })
        ));
        assert!(matches!(
            array.set(&[0, 9], 1.0),
            Err(LabError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_block_write_fills_trailing_dimension() {
        let mut array = DataArray::builder("rows").shape(&[3, 4]).build().expect("array");
        array
            .set_block(&[1], &[10.0, 11.0, 12.0, 13.0])
            .expect("block write");
        assert_eq!(array.get(&[1, 2]).expect("get"), 12.0);
        assert!(array.get(&[0, 0]).expect("get").is_nan());
    }

    #[test]
    fn test_block_write_wrong_length_rejected() {
        let mut array = DataArray::builder("rows").shape(&[3, 4]).build().expect("array");
        assert!(matches!(
            array.set_block(&[1], &[1.0, 2.0]),
            Err(LabError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_equality_requires_same_axis_instances() {
        let x = setpoint("x", &[3], vec![]);
        let x2 = setpoint("x", &[3], vec![]);
        let data = arr1(&[1.0, 2.0, 3.0]).into_dyn();

        let a = DataArray::builder("a")
            .preset_data(data.clone())
            .set_arrays(vec![x.clone()])
            .build()
            .expect("a");
        let b = DataArray::builder("a")
            .preset_data(data.clone())
            .set_arrays(vec![x])
            .build()
            .expect("b");
        let c = DataArray::builder("a")
            .preset_data(data)
            .set_arrays(vec![x2])
            .build()
            .expect("c");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_clone_copies_buffer_and_shares_axes() {
        let x = setpoint("x", &[3], vec![]);
        let original = DataArray::builder("a")
            .preset_data(arr1(&[1.0, 2.0, 3.0]).into_dyn())
            .set_arrays(vec![x.clone()])
            .build()
            .expect("array");

        let mut copy = original.clone();
        copy.set(&[0], 99.0).expect("set");

        assert_eq!(original.get(&[0]).expect("get"), 1.0);
        assert!(Arc::ptr_eq(&original.set_arrays()[0], &copy.set_arrays()[0]));
    }

    #[test]
    fn test_arithmetic_forwards_to_numeric_backing() {
        let a = DataArray::builder("a")
            .preset_data(arr1(&[1.0, 2.0]).into_dyn())
            .build()
            .expect("a");
        let b = DataArray::builder("b")
            .preset_data(arr1(&[10.0, 20.0]).into_dyn())
            .build()
            .expect("b");

        let sum = &a + &b;
        assert_eq!(sum, arr1(&[11.0, 22.0]).into_dyn());

        let scaled = &a * 2.0;
        assert_eq!(scaled, arr1(&[2.0, 4.0]).into_dyn());
    }
}
