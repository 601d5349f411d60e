use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};

use crate::AggregationError;

/// The default device tag of tensors built on the host.
pub const HOST_DEVICE: &str = "cpu";

/// The key used when a flat vector is carried as a parameter set.
pub const FLAT_KEY: &str = "flat";

/// The element types a tensor can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dtype {
    F32,
    F64,
    I32,
    I64,
    Bool,
}

impl Dtype {
    pub const ALL: [Dtype; 5] = [Dtype::F32, Dtype::F64, Dtype::I32, Dtype::I64, Dtype::Bool];

    /// The size in bytes of a single element.
    pub fn size(self) -> usize {
        match self {
            Self::F32 | Self::I32 => 4,
            Self::F64 | Self::I64 => 8,
            Self::Bool => 1,
        }
    }

    /// The wire tag of this element type.
    pub fn tag(self) -> u8 {
        match self {
            Self::F32 => 0,
            Self::F64 => 1,
            Self::I32 => 2,
            Self::I64 => 3,
            Self::Bool => 4,
        }
    }

    /// Resolves a wire tag into an element type.
    ///
    /// # Arguments
    /// * `tag` - The tag read from the wire.
    ///
    /// # Returns
    /// The element type or an `UnsupportedDtype` error listing the supported set.
    pub fn from_tag(tag: u8) -> Result<Self, AggregationError> {
        Self::ALL
            .into_iter()
            .find(|dtype| dtype.tag() == tag)
            .ok_or_else(|| AggregationError::UnsupportedDtype {
                dtype: format!("tag {tag}"),
                supported: Self::names(&Self::ALL),
            })
    }

    /// The human readable name of this element type.
    pub fn name(self) -> &'static str {
        match self {
            Self::F32 => "float32",
            Self::F64 => "float64",
            Self::I32 => "int32",
            Self::I64 => "int64",
            Self::Bool => "bool",
        }
    }

    /// Whether tensors of this type support arithmetic reductions.
    pub fn is_numeric(self) -> bool {
        !matches!(self, Self::Bool)
    }

    /// Whether tensors of this type can be scaled by a real weight.
    pub fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    /// Lists the names of `dtypes`, used in error details.
    pub fn names(dtypes: &[Dtype]) -> Vec<String> {
        dtypes.iter().map(|d| d.name().to_string()).collect()
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A numeric primitive that can be stored inside a `Tensor`.
pub trait Element: bytemuck::Pod {
    const DTYPE: Dtype;

    /// Converts between host and little-endian byte order, applying it twice is the identity.
    fn le(self) -> Self;
}

macro_rules! impl_int_element {
    ($($t:ty => $dtype:ident),*) => {$(
        impl Element for $t {
            const DTYPE: Dtype = Dtype::$dtype;

            fn le(self) -> Self {
                self.to_le()
            }
        }
    )*};
}

macro_rules! impl_float_element {
    ($($t:ty => $dtype:ident),*) => {$(
        impl Element for $t {
            const DTYPE: Dtype = Dtype::$dtype;

            fn le(self) -> Self {
                <$t>::from_bits(self.to_bits().to_le())
            }
        }
    )*};
}

impl_int_element!(i32 => I32, i64 => I64);
impl_float_element!(f32 => F32, f64 => F64);

/// Returns the amount of elements described by `shape`, `None` on overflow.
pub fn numel(shape: &[u32]) -> Option<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim as usize))
}

/// A dense array of numbers stored as raw little-endian bytes.
///
/// Keeping the bytes untouched is what makes the codec bit exact, equality compares the
/// bytes and not the numbers so `NaN` payloads survive a round trip too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    dtype: Dtype,
    shape: Vec<u32>,
    device: String,
    data: Vec<u8>,
}

impl Tensor {
    /// Creates a tensor from its raw little-endian bytes.
    ///
    /// # Arguments
    /// * `dtype` - The element type.
    /// * `shape` - The dimensions of the tensor.
    /// * `device` - The device tag of the originating process.
    /// * `data` - The little-endian encoded elements.
    ///
    /// # Returns
    /// The tensor or a `CorruptPayload` error if a dimension is zero or `data` doesn't hold
    /// `shape` elements.
    pub fn from_raw(
        dtype: Dtype,
        shape: Vec<u32>,
        device: impl Into<String>,
        data: Vec<u8>,
    ) -> Result<Self, AggregationError> {
        if shape.contains(&0) {
            return Err(AggregationError::corrupt(format!(
                "shape {shape:?} has an empty dimension"
            )));
        }

        let expected = numel(&shape)
            .and_then(|n| n.checked_mul(dtype.size()))
            .ok_or_else(|| AggregationError::corrupt(format!("shape {shape:?} overflows")))?;

        if data.len() != expected {
            return Err(AggregationError::corrupt(format!(
                "{} bytes can't hold a {dtype} tensor of shape {shape:?}, expected {expected}",
                data.len()
            )));
        }

        if u32::try_from(expected).is_err() {
            return Err(AggregationError::corrupt(format!(
                "tensor of {expected} bytes exceeds the encodable length"
            )));
        }

        Ok(Self {
            dtype,
            shape,
            device: device.into(),
            data,
        })
    }

    /// Creates a host tensor from typed values.
    ///
    /// # Arguments
    /// * `shape` - The dimensions of the tensor.
    /// * `values` - The elements in row-major order.
    ///
    /// # Returns
    /// The tensor or a `CorruptPayload` error if the amount of values doesn't match `shape`.
    pub fn from_slice<T: Element>(shape: &[u32], values: &[T]) -> Result<Self, AggregationError> {
        Self::from_raw(T::DTYPE, shape.to_vec(), HOST_DEVICE, encode_elements(values))
    }

    /// Creates a host tensor of booleans.
    pub fn from_bools(shape: &[u32], values: &[bool]) -> Result<Self, AggregationError> {
        let data = values.iter().map(|&b| b as u8).collect();
        Self::from_raw(Dtype::Bool, shape.to_vec(), HOST_DEVICE, data)
    }

    /// Creates a one dimensional host tensor.
    ///
    /// `values` must not be empty, use `from_slice` when that isn't known upfront.
    pub fn vector<T: Element>(values: &[T]) -> Self {
        debug_assert!(!values.is_empty(), "tensors can't have empty dimensions");
        Self {
            dtype: T::DTYPE,
            shape: vec![values.len() as u32],
            device: HOST_DEVICE.to_string(),
            data: encode_elements(values),
        }
    }

    /// Retags this tensor with another device.
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn shape(&self) -> &[u32] {
        &self.shape
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// The raw little-endian bytes of the elements.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn numel(&self) -> usize {
        self.data.len() / self.dtype.size()
    }

    /// Copies the elements out as `T`.
    ///
    /// # Returns
    /// `None` if `T` isn't the element type of this tensor.
    pub fn to_vec<T: Element>(&self) -> Option<Vec<T>> {
        if T::DTYPE != self.dtype {
            return None;
        }

        let values = self
            .data
            .chunks_exact(size_of::<T>())
            .map(|chunk| bytemuck::pod_read_unaligned::<T>(chunk).le())
            .collect();

        Some(values)
    }

    /// Copies the elements out as booleans, `None` if this isn't a bool tensor.
    pub fn to_bools(&self) -> Option<Vec<bool>> {
        (self.dtype == Dtype::Bool).then(|| self.data.iter().map(|&b| b != 0).collect())
    }

    /// Overwrites the elements keeping the shape and device.
    ///
    /// # Returns
    /// `None` if `T` isn't the element type or the amount of values differs.
    pub fn set_values<T: Element>(&mut self, values: &[T]) -> Option<()> {
        if T::DTYPE != self.dtype || values.len() != self.numel() {
            return None;
        }

        self.data = encode_elements(values);
        Some(())
    }

    /// A tensor laid out like this one with every byte set to zero.
    pub fn zeroed(&self) -> Self {
        Self {
            data: vec![0; self.data.len()],
            ..self.clone()
        }
    }

    /// Whether `other` has the same element type and shape.
    pub fn same_layout(&self, other: &Tensor) -> bool {
        self.dtype == other.dtype && self.shape == other.shape
    }
}

fn encode_elements<T: Element>(values: &[T]) -> Vec<u8> {
    let mut data = Vec::with_capacity(values.len() * size_of::<T>());

    for value in values {
        data.extend_from_slice(bytemuck::bytes_of(&value.le()));
    }

    data
}

/// An ordered mapping from unique parameter names to tensors.
#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    entries: Vec<(String, Tensor)>,
    index: HashMap<String, usize>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a flat vector of parameters as a single entry set.
    pub fn flat(values: &[f32]) -> Self {
        let mut params = Self::new();
        params.insert(FLAT_KEY, Tensor::vector(values));
        params
    }

    /// Inserts a tensor under `name`, keeping the position of a replaced entry.
    ///
    /// # Returns
    /// The previous tensor under that name, if any.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        let name = name.into();

        if let Some(&i) = self.index.get(&name) {
            return Some(std::mem::replace(&mut self.entries[i].1, tensor));
        }

        self.index.insert(name.clone(), self.entries.len());
        self.entries.push((name, tensor));
        None
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.index.get(name).map(|&i| &self.entries[i].1)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.index.get(name).map(|&i| &mut self.entries[i].1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates the entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries.iter().map(|(name, t)| (name.as_str(), t))
    }

    /// Iterates the entries in insertion order, with mutable tensors.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Tensor)> {
        self.entries.iter_mut().map(|(name, t)| (name.as_str(), t))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// The total amount of elements across all tensors.
    pub fn numel(&self) -> usize {
        self.entries.iter().map(|(_, t)| t.numel()).sum()
    }

    /// Checks that `other` holds the same keys with the same shapes and element types.
    ///
    /// # Returns
    /// A `SchemaMismatch` naming the first divergent key, following this set's order.
    pub fn check_schema(&self, other: &ParameterSet) -> Result<(), AggregationError> {
        for (name, tensor) in self.iter() {
            let Some(theirs) = other.get(name) else {
                return Err(AggregationError::schema(name, "key is missing"));
            };

            if tensor.dtype() != theirs.dtype() {
                let detail = format!("dtype {} vs {}", tensor.dtype(), theirs.dtype());
                return Err(AggregationError::schema(name, detail));
            }

            if tensor.shape() != theirs.shape() {
                let detail = format!("shape {:?} vs {:?}", tensor.shape(), theirs.shape());
                return Err(AggregationError::schema(name, detail));
            }
        }

        if let Some(extra) = other.names().find(|name| !self.contains(name)) {
            return Err(AggregationError::schema(extra, "unexpected key"));
        }

        Ok(())
    }

    /// Summarizes the set for logging without dumping any values.
    pub fn summary(&self) -> Summary {
        const MAX_KEYS: usize = 5;

        let mut keys: Vec<String> = self.names().map(str::to_string).collect();
        if keys.len() > MAX_KEYS {
            let total = keys.len();
            keys.truncate(3);
            keys.push("...".to_string());
            keys.push(format!("({total} total)"));
        }

        let first = self.entries.first().map(|(_, t)| t);

        Summary {
            tensors: self.len(),
            total_elements: self.numel(),
            dtype: first.map(Tensor::dtype),
            device: first.map(|t| t.device().to_string()),
            keys,
        }
    }
}

impl PartialEq for ParameterSet {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl<S: Into<String>> FromIterator<(S, Tensor)> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = (S, Tensor)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (name, tensor) in iter {
            params.insert(name, tensor);
        }
        params
    }
}

impl IntoIterator for ParameterSet {
    type Item = (String, Tensor);
    type IntoIter = std::vec::IntoIter<(String, Tensor)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Metadata about a `ParameterSet`, meant for log lines.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub tensors: usize,
    pub total_elements: usize,
    pub dtype: Option<Dtype>,
    pub device: Option<String>,
    pub keys: Vec<String>,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tensors, {} elements, keys {:?}",
            self.tensors, self.total_elements, self.keys
        )?;

        if let (Some(dtype), Some(device)) = (self.dtype, &self.device) {
            write!(f, ", {dtype} on {device}")?;
        }

        Ok(())
    }
}
