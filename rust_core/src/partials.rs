use crate::error::{Error, Result};
use crate::graph::VertexId;
use crate::tensor::{self, Tensor};
use ndarray::Array2;
use std::collections::HashMap;

/// Partial derivatives of one output with respect to several vertices.
///
/// Every tensor is shaped `of_shape ++ wrt_shape`. Contributions for the same
/// wrt vertex arriving along different paths are summed.
#[derive(Debug, Clone, Default)]
pub struct PartialDerivatives {
    partials: HashMap<VertexId, Tensor>,
}

impl PartialDerivatives {
    pub fn new() -> Self {
        Self::default()
    }

    /// d(x)/d(x) for a vertex of the given shape.
    pub fn with_respect_to_self(id: VertexId, shape: &[usize]) -> Self {
        let mut partials = HashMap::new();
        partials.insert(id, tensor::identity(shape));
        Self { partials }
    }

    pub fn with_respect_to(&self, id: VertexId) -> Option<&Tensor> {
        self.partials.get(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.partials.is_empty()
    }

    pub fn len(&self) -> usize {
        self.partials.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&VertexId, &Tensor)> {
        self.partials.iter()
    }

    pub fn into_map(self) -> HashMap<VertexId, Tensor> {
        self.partials
    }

    /// Add `partial` into the entry for `id`.
    pub fn accumulate(&mut self, id: VertexId, partial: Tensor) -> Result<()> {
        match self.partials.get_mut(&id) {
            Some(existing) => {
                if existing.shape() != partial.shape() {
                    return Err(Error::ShapeMismatch {
                        expected: existing.shape().to_vec(),
                        got: partial.shape().to_vec(),
                    });
                }
                *existing += &partial;
            }
            None => {
                self.partials.insert(id, partial);
            }
        }
        Ok(())
    }

    pub fn add(mut self, other: PartialDerivatives) -> Result<Self> {
        for (id, partial) in other.partials {
            self.accumulate(id, partial)?;
        }
        Ok(self)
    }

    pub fn scale(mut self, factor: f64) -> Self {
        for partial in self.partials.values_mut() {
            partial.mapv_inplace(|v| v * factor);
        }
        self
    }

    /// Forward-mode chain rule for an elementwise operation.
    ///
    /// `self` holds partials of a parent shaped `parent_shape ++ wrt`. Each
    /// parent element is scaled by the matching element of `local` (already
    /// broadcast to the output shape). A length-one parent is expanded across
    /// every output element.
    pub fn multiply_along_of_dimensions(&self, local: &Tensor, parent_shape: &[usize]) -> Result<Self> {
        let out_shape = local.shape().to_vec();
        let n_out = local.len();
        let n_parent = tensor::element_count(parent_shape);
        let local_flat: Vec<f64> = local.iter().copied().collect();

        let mut result = HashMap::with_capacity(self.partials.len());
        for (&id, partial) in &self.partials {
            let wrt_shape = &partial.shape()[parent_shape.len()..];
            let n_wrt = tensor::element_count(wrt_shape);
            let source = tensor::to_matrix(partial, n_parent, n_wrt)?;
            let mut out = Array2::<f64>::zeros((n_out, n_wrt));
            for i in 0..n_out {
                let row = if n_parent == n_out { i } else { 0 };
                for j in 0..n_wrt {
                    out[[i, j]] = source[[row, j]] * local_flat[i];
                }
            }
            let shape = tensor::concat_shapes(&out_shape, wrt_shape);
            result.insert(id, tensor::from_matrix(&out, &shape)?);
        }
        Ok(Self { partials: result })
    }
}

/// Reverse-mode chain rule for an elementwise operation.
///
/// `upstream` is shaped `of_shape ++ visiting_shape`; each visiting element
/// column is scaled by the matching element of `local`.
pub fn multiply_along_wrt_dimensions(upstream: &Tensor, local: &Tensor, of_shape: &[usize]) -> Result<Tensor> {
    let n_of = tensor::element_count(of_shape);
    let n_wrt = local.len();
    let mut m = tensor::to_matrix(upstream, n_of, n_wrt)?;
    let local_flat: Vec<f64> = local.iter().copied().collect();
    for mut row in m.rows_mut() {
        for (v, l) in row.iter_mut().zip(local_flat.iter()) {
            *v *= l;
        }
    }
    tensor::from_matrix(&m, upstream.shape())
}

/// Bring a reverse-mode contribution shaped `of_shape ++ visiting_shape`
/// onto a parent's shape. A length-one parent that was broadcast gets the
/// broadcast dimensions summed away.
pub fn collapse_to_parent(partial: Tensor, of_shape: &[usize], parent_shape: &[usize]) -> Result<Tensor> {
    let target = tensor::concat_shapes(of_shape, parent_shape);
    if partial.shape() == target.as_slice() {
        return Ok(partial);
    }
    let n_of = tensor::element_count(of_shape);
    let n_parent = tensor::element_count(parent_shape);
    let n_visiting = partial.len() / n_of.max(1);
    if n_visiting == n_parent {
        return tensor::create(partial.iter().copied().collect(), &target);
    }
    if tensor::is_length_one(parent_shape) {
        let m = tensor::to_matrix(&partial, n_of, n_visiting)?;
        let summed: Vec<f64> = m.rows().into_iter().map(|r| r.sum()).collect();
        return tensor::create(summed, &target);
    }
    Err(Error::ShapeMismatch {
        expected: target,
        got: partial.shape().to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulate_sums_paths() {
        let id = VertexId(3);
        let mut p = PartialDerivatives::new();
        p.accumulate(id, tensor::scalar(1.5)).unwrap();
        p.accumulate(id, tensor::scalar(2.0)).unwrap();
        assert_eq!(tensor::first(p.with_respect_to(id).unwrap()), 3.5);
        assert!(p.accumulate(id, tensor::zeros(&[2])).is_err());
    }

    #[test]
    fn test_collapse_sums_broadcast_dimensions() {
        let upstream = tensor::create(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
        let collapsed = collapse_to_parent(upstream, &[2], &[]).unwrap();
        assert_eq!(collapsed.shape(), &[2]);
        assert_eq!(collapsed.iter().copied().collect::<Vec<_>>(), vec![6.0, 15.0]);
    }

    #[test]
    fn test_forward_multiply_expands_length_one_parent() {
        let id = VertexId(0);
        let p = PartialDerivatives::with_respect_to_self(id, &[]);
        let local = tensor::create(vec![2.0, 3.0], &[2]).unwrap();
        let out = p.multiply_along_of_dimensions(&local, &[]).unwrap();
        let t = out.with_respect_to(id).unwrap();
        assert_eq!(t.shape(), &[2]);
        assert_eq!(t.iter().copied().collect::<Vec<_>>(), vec![2.0, 3.0]);
    }
}
