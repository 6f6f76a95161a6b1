use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// A dense, row-major `f32` array with an explicit shape.
///
/// This is the value a batch generator hands to the loader. The loader never
/// looks inside it; the only invariant enforced here is that `data` holds
/// exactly `shape.iter().product()` elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Array {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Array {
    /// Creates an array, checking that `data` fills `shape` exactly.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(anyhow!(
                "Shape {:?} expects {} elements but {} were given",
                shape,
                expected,
                data.len()
            ));
        }
        Ok(Self { shape, data })
    }

    /// Stacks equally sized rows into a `[rows, cols]` array.
    ///
    /// Ragged input (rows of different lengths) is a malformed sample and is
    /// rejected, as is an empty row list.
    pub fn from_rows<R: AsRef<[f32]>>(rows: &[R]) -> Result<Self> {
        let first = rows
            .first()
            .ok_or_else(|| anyhow!("Malformed sample: cannot stack zero rows"))?;
        let cols = first.as_ref().len();

        let mut data = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            let row = row.as_ref();
            if row.len() != cols {
                return Err(anyhow!(
                    "Malformed sample: row {} has {} elements but row 0 has {}",
                    i,
                    row.len(),
                    cols
                ));
            }
            data.extend_from_slice(row);
        }

        Ok(Self {
            shape: vec![rows.len(), cols],
            data,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

/// One unit of training data: an ordered tuple of arrays (e.g. `(image, label)`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    fields: Vec<Array>,
}

impl Batch {
    pub fn new(fields: Vec<Array>) -> Self {
        Self { fields }
    }

    /// Builds a batch from nested rows, one entry per field.
    ///
    /// Mirrors what a Python-style generator yields (`[[[1, 2], [1]]]`): each
    /// field must be rectangular or the whole batch is rejected.
    pub fn from_ragged(fields: Vec<Vec<Vec<f32>>>) -> Result<Self> {
        let fields = fields
            .iter()
            .enumerate()
            .map(|(i, rows)| {
                Array::from_rows(rows).map_err(|e| e.context(format!("Field {} is malformed", i)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { fields })
    }

    /// Returns the field at `index`.
    pub fn get(&self, index: usize) -> Result<&Array> {
        self.fields
            .get(index)
            .ok_or_else(|| anyhow!("Field {} not found in batch of {} fields", index, self.fields.len()))
    }

    pub fn fields(&self) -> &[Array] {
        &self.fields
    }

    /// Number of fields in the tuple.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Leading dimension shared by all fields.
    pub fn batch_size(&self) -> Result<usize> {
        let mut sizes = self
            .fields
            .iter()
            .map(|f| f.shape().first().copied().unwrap_or(1));
        let first = sizes.next().ok_or_else(|| anyhow!("Empty batch"))?;
        if let Some(other) = sizes.find(|&s| s != first) {
            return Err(anyhow!(
                "Fields disagree on batch size ({} vs {})",
                first,
                other
            ));
        }
        Ok(first)
    }
}
