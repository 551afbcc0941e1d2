//! Thin helpers over `ndarray::ArrayD<f64>`.
//!
//! Broadcasting in the graph is deliberately narrow: two operands either
//! share a shape, or one of them holds a single element. Derivative tensors
//! are handled by flattening them into `[rows, cols]` matrices, where the
//! split point is given by the element count of the "of" or "wrt" part.

use crate::error::{Error, Result};
use ndarray::{Array2, ArrayD, IxDyn, Zip};

pub type Tensor = ArrayD<f64>;

pub fn scalar(value: f64) -> Tensor {
    ArrayD::from_elem(IxDyn(&[]), value)
}

pub fn create(values: Vec<f64>, shape: &[usize]) -> Result<Tensor> {
    let got = vec![values.len()];
    ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|_| Error::ShapeMismatch {
        expected: shape.to_vec(),
        got,
    })
}

pub fn zeros(shape: &[usize]) -> Tensor {
    ArrayD::zeros(IxDyn(shape))
}

pub fn filled(shape: &[usize], value: f64) -> Tensor {
    ArrayD::from_elem(IxDyn(shape), value)
}

pub fn element_count(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// A shape is length-one when it holds exactly one element, e.g. `[]`, `[1]`, `[1, 1]`.
pub fn is_length_one(shape: &[usize]) -> bool {
    element_count(shape) == 1
}

pub fn concat_shapes(a: &[usize], b: &[usize]) -> Vec<usize> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    out.extend_from_slice(a);
    out.extend_from_slice(b);
    out
}

/// First element in logical order. Only meaningful for length-one tensors.
pub fn first(t: &Tensor) -> f64 {
    t.iter().next().copied().unwrap_or(f64::NAN)
}

/// Identity of shape `shape ++ shape`: `I[i..., j...] = 1` when `i == j`.
pub fn identity(shape: &[usize]) -> Tensor {
    let n = element_count(shape);
    let mut out = zeros(&concat_shapes(shape, shape));
    if let Some(data) = out.as_slice_mut() {
        for i in 0..n {
            data[i * n + i] = 1.0;
        }
    }
    out
}

/// Shape produced by combining operands elementwise.
///
/// All operands must either share the single non-length-one shape or be
/// length-one themselves. When every operand is length-one the highest-rank
/// shape wins, so `[] op [1, 1]` yields `[1, 1]`.
pub fn check_has_one_non_length_one_shape_or_all_length_one(shapes: &[&[usize]]) -> Result<Vec<usize>> {
    let mut result: Option<&[usize]> = None;
    for &shape in shapes {
        if is_length_one(shape) {
            continue;
        }
        match result {
            None => result = Some(shape),
            Some(existing) if existing == shape => {}
            Some(existing) => {
                return Err(Error::BroadcastError {
                    lhs: existing.to_vec(),
                    rhs: shape.to_vec(),
                })
            }
        }
    }
    Ok(match result {
        Some(shape) => shape.to_vec(),
        None => shapes
            .iter()
            .max_by_key(|s| s.len())
            .map(|s| s.to_vec())
            .unwrap_or_default(),
    })
}

/// Parameters of a distribution must either be length-one or match the
/// vertex's own shape.
pub fn check_parameters_match_shape(shape: &[usize], params: &[&[usize]]) -> Result<()> {
    for &p in params {
        if !is_length_one(p) && p != shape {
            return Err(Error::ShapeMismatch {
                expected: shape.to_vec(),
                got: p.to_vec(),
            });
        }
    }
    Ok(())
}

/// Output shape of a matrix product. Both operands must be rank 2.
pub fn check_matmul(left: &[usize], right: &[usize]) -> Result<Vec<usize>> {
    if left.len() != 2 || right.len() != 2 || left[1] != right[0] {
        return Err(Error::BroadcastError {
            lhs: left.to_vec(),
            rhs: right.to_vec(),
        });
    }
    Ok(vec![left[0], right[1]])
}

/// Reinterpret or expand `t` as a tensor of `shape`.
///
/// Length-one tensors are filled across the target shape; tensors with the
/// same element count are reshaped in logical order.
pub fn broadcast_to(t: &Tensor, shape: &[usize]) -> Result<Tensor> {
    if t.shape() == shape {
        return Ok(t.clone());
    }
    if t.len() == 1 {
        return Ok(filled(shape, first(t)));
    }
    if t.len() == element_count(shape) {
        return create(t.iter().copied().collect(), shape);
    }
    Err(Error::BroadcastError {
        lhs: t.shape().to_vec(),
        rhs: shape.to_vec(),
    })
}

pub fn unary(a: &Tensor, f: impl Fn(f64) -> f64) -> Tensor {
    a.mapv(f)
}

pub fn binary(a: &Tensor, b: &Tensor, shape: &[usize], f: impl Fn(f64, f64) -> f64) -> Result<Tensor> {
    let a = broadcast_to(a, shape)?;
    let b = broadcast_to(b, shape)?;
    let mut out = zeros(shape);
    Zip::from(&mut out)
        .and(&a)
        .and(&b)
        .for_each(|o, &x, &y| *o = f(x, y));
    Ok(out)
}

/// Flatten into a `[rows, cols]` matrix in logical element order.
pub fn to_matrix(t: &Tensor, rows: usize, cols: usize) -> Result<Array2<f64>> {
    Array2::from_shape_vec((rows, cols), t.iter().copied().collect()).map_err(|_| Error::ShapeMismatch {
        expected: vec![rows, cols],
        got: t.shape().to_vec(),
    })
}

/// Inverse of [`to_matrix`].
pub fn from_matrix(m: &Array2<f64>, shape: &[usize]) -> Result<Tensor> {
    create(m.iter().copied().collect(), shape)
}

/// Sum a tensor down to `shape`: identity when shapes already agree, a full
/// reduction to one element when `shape` is length-one.
pub fn sum_to_shape(t: &Tensor, shape: &[usize]) -> Result<Tensor> {
    if t.shape() == shape {
        return Ok(t.clone());
    }
    if is_length_one(shape) {
        return Ok(filled(shape, t.sum()));
    }
    broadcast_to(t, shape)
}

pub fn dot(a: &Tensor, b: &Tensor) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub fn max_abs(t: &Tensor) -> f64 {
    t.iter().fold(0.0f64, |acc, v| acc.max(v.abs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_one_shapes() {
        assert!(is_length_one(&[]));
        assert!(is_length_one(&[1, 1]));
        assert!(!is_length_one(&[2]));
    }

    #[test]
    fn test_broadcast_shape_check() {
        let out = check_has_one_non_length_one_shape_or_all_length_one(&[&[2, 2], &[]]).unwrap();
        assert_eq!(out, vec![2, 2]);
        let out = check_has_one_non_length_one_shape_or_all_length_one(&[&[], &[1, 1]]).unwrap();
        assert_eq!(out, vec![1, 1]);
        assert!(check_has_one_non_length_one_shape_or_all_length_one(&[&[2], &[3]]).is_err());
    }

    #[test]
    fn test_identity_layout() {
        let eye = identity(&[2]);
        assert_eq!(eye.shape(), &[2, 2]);
        assert_eq!(eye.iter().copied().collect::<Vec<_>>(), vec![1.0, 0.0, 0.0, 1.0]);
        assert_eq!(identity(&[]).shape(), &[] as &[usize]);
    }

    #[test]
    fn test_binary_broadcasts_length_one_operand() {
        let a = create(vec![1.0, 2.0, 3.0], &[3]).unwrap();
        let out = binary(&a, &scalar(2.0), &[3], |x, y| x * y).unwrap();
        assert_eq!(out.iter().copied().collect::<Vec<_>>(), vec![2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_matmul_shape() {
        assert_eq!(check_matmul(&[2, 3], &[3, 4]).unwrap(), vec![2, 4]);
        assert!(check_matmul(&[2, 3], &[2, 3]).is_err());
    }
}
