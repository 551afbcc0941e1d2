//! Value and derivative rules for every deterministic [`Op`].
//!
//! Elementwise ops are described by their local derivative with respect to
//! each parent, broadcast to the output shape. Forward mode scales parent
//! partials along the "of" dimensions, reverse mode scales the upstream
//! partial along the "wrt" dimensions. `Sum` and `MatMul` change shape and
//! carry their own rules.

use crate::error::{Error, Result};
use crate::graph::{Graph, Op, VertexId};
use crate::partials::{self, PartialDerivatives};
use crate::tensor::{self, Tensor};
use ndarray::{Array2, Axis};
use std::collections::HashMap;

/// Recompute a deterministic vertex from its parents' current values.
pub(crate) fn calculate(graph: &Graph, id: VertexId) -> Result<Tensor> {
    let vertex = graph.get(id)?;
    let shape = vertex.shape.as_slice();
    let val = |p: VertexId| graph.value_of(p);
    match &vertex.op {
        Op::Constant(c) => Ok(c.clone()),
        Op::Add(l, r) => tensor::binary(val(*l)?, val(*r)?, shape, |a, b| a + b),
        Op::Sub(l, r) => tensor::binary(val(*l)?, val(*r)?, shape, |a, b| a - b),
        Op::Mul(l, r) => tensor::binary(val(*l)?, val(*r)?, shape, |a, b| a * b),
        Op::Div(l, r) => tensor::binary(val(*l)?, val(*r)?, shape, |a, b| a / b),
        Op::Pow(b, e) => tensor::binary(val(*b)?, val(*e)?, shape, f64::powf),
        Op::ArcTan2(x, y) => tensor::binary(val(*x)?, val(*y)?, shape, |x, y| y.atan2(x)),
        Op::Max(l, r) => tensor::binary(val(*l)?, val(*r)?, shape, |a, b| if a >= b { a } else { b }),
        Op::MatMul(l, r) => {
            let (a, b) = (as_matrix(val(*l)?)?, as_matrix(val(*r)?)?);
            tensor::from_matrix(&a.dot(&b), shape)
        }
        Op::Neg(a) => Ok(tensor::unary(val(*a)?, |x| -x)),
        Op::Exp(a) => Ok(tensor::unary(val(*a)?, f64::exp)),
        Op::Log(a) => Ok(tensor::unary(val(*a)?, f64::ln)),
        Op::Sin(a) => Ok(tensor::unary(val(*a)?, f64::sin)),
        Op::Cos(a) => Ok(tensor::unary(val(*a)?, f64::cos)),
        Op::ArcSin(a) => Ok(tensor::unary(val(*a)?, f64::asin)),
        Op::ArcCos(a) => Ok(tensor::unary(val(*a)?, f64::acos)),
        Op::Proxy(a) => Ok(val(*a)?.clone()),
        Op::Sigmoid(a) => Ok(tensor::unary(val(*a)?, sigmoid)),
        Op::Abs(a) => Ok(tensor::unary(val(*a)?, f64::abs)),
        Op::Sum(a) => Ok(tensor::scalar(val(*a)?.sum())),
        Op::Random(d) => Err(Error::InvalidArgument {
            arg: "id",
            reason: format!("{} vertex {} is sampled, not calculated", d.name(), id),
        }),
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn as_matrix(t: &Tensor) -> Result<Array2<f64>> {
    let shape = t.shape();
    if shape.len() != 2 {
        return Err(Error::ShapeMismatch {
            expected: vec![0, 0],
            got: shape.to_vec(),
        });
    }
    tensor::to_matrix(t, shape[0], shape[1])
}

fn not_differentiable(graph: &Graph, id: VertexId) -> Error {
    Error::NotDifferentiable {
        id,
        op: graph.vertex(id).op.name(),
    }
}

/// Local derivative of an elementwise op with respect to each parent,
/// broadcast to the output shape. `None` for ops that are not elementwise.
fn elementwise_locals(graph: &Graph, id: VertexId) -> Result<Option<Vec<(VertexId, Tensor)>>> {
    let vertex = graph.vertex(id);
    let shape = vertex.shape.as_slice();
    let val = |p: &VertexId| -> Result<Tensor> { tensor::broadcast_to(graph.value_of(*p)?, shape) };
    let ones = || tensor::filled(shape, 1.0);

    let locals = match &vertex.op {
        Op::Add(l, r) => vec![(*l, ones()), (*r, ones())],
        Op::Sub(l, r) => vec![(*l, ones()), (*r, tensor::filled(shape, -1.0))],
        Op::Mul(l, r) => vec![(*l, val(r)?), (*r, val(l)?)],
        Op::Div(l, r) => {
            let (lv, rv) = (val(l)?, val(r)?);
            let d_right = tensor::binary(&lv, &rv, shape, |a, b| -a / (b * b))?;
            vec![(*l, rv.mapv(|b| 1.0 / b)), (*r, d_right)]
        }
        Op::Pow(b, e) => {
            let (bv, ev) = (val(b)?, val(e)?);
            let d_base = tensor::binary(&bv, &ev, shape, |b, e| e * b.powf(e - 1.0))?;
            let d_exponent = tensor::binary(&bv, &ev, shape, |b, e| b.powf(e) * b.ln())?;
            vec![(*b, d_base), (*e, d_exponent)]
        }
        Op::ArcTan2(x, y) => {
            let (xv, yv) = (val(x)?, val(y)?);
            let d_x = tensor::binary(&xv, &yv, shape, |x, y| -y / (x * x + y * y))?;
            let d_y = tensor::binary(&xv, &yv, shape, |x, y| x / (x * x + y * y))?;
            vec![(*x, d_x), (*y, d_y)]
        }
        Op::Max(l, r) => {
            let (lv, rv) = (val(l)?, val(r)?);
            let d_left = tensor::binary(&lv, &rv, shape, |a, b| if a >= b { 1.0 } else { 0.0 })?;
            let d_right = d_left.mapv(|d| 1.0 - d);
            vec![(*l, d_left), (*r, d_right)]
        }
        Op::Neg(a) => vec![(*a, tensor::filled(shape, -1.0))],
        Op::Proxy(a) => vec![(*a, ones())],
        Op::Exp(a) => vec![(*a, val(a)?.mapv(f64::exp))],
        Op::Log(a) => vec![(*a, val(a)?.mapv(|x| 1.0 / x))],
        Op::Sin(a) => vec![(*a, val(a)?.mapv(f64::cos))],
        Op::Cos(a) => vec![(*a, val(a)?.mapv(|x| -x.sin()))],
        Op::ArcSin(a) => vec![(*a, val(a)?.mapv(|x| 1.0 / (1.0 - x * x).sqrt()))],
        Op::ArcCos(a) => vec![(*a, val(a)?.mapv(|x| -1.0 / (1.0 - x * x).sqrt()))],
        Op::Sigmoid(a) => vec![(
            *a,
            val(a)?.mapv(|x| {
                let s = sigmoid(x);
                s * (1.0 - s)
            }),
        )],
        _ => return Ok(None),
    };
    Ok(Some(locals))
}

/// Forward-mode rule: combine the parents' partials into the partials of `id`.
///
/// `partials` must already hold an entry for every differentiable parent;
/// parents without an entry contribute nothing.
pub(crate) fn forward_partial(
    graph: &Graph,
    id: VertexId,
    partials: &HashMap<VertexId, PartialDerivatives>,
) -> Result<PartialDerivatives> {
    let vertex = graph.vertex(id);
    match &vertex.op {
        Op::Constant(_) | Op::Random(_) => return Ok(PartialDerivatives::new()),
        Op::Abs(_) => return Err(not_differentiable(graph, id)),
        Op::Sum(a) => return forward_sum(graph, *a, partials),
        Op::MatMul(l, r) => return forward_matmul(graph, *l, *r, partials),
        _ => {}
    }

    let locals = elementwise_locals(graph, id)?.ok_or_else(|| not_differentiable(graph, id))?;
    let mut result = PartialDerivatives::new();
    for (parent, local) in locals {
        if let Some(parent_partial) = partials.get(&parent) {
            let scaled = parent_partial.multiply_along_of_dimensions(&local, graph.shape(parent))?;
            result = result.add(scaled)?;
        }
    }
    Ok(result)
}

fn forward_sum(
    graph: &Graph,
    input: VertexId,
    partials: &HashMap<VertexId, PartialDerivatives>,
) -> Result<PartialDerivatives> {
    let mut result = PartialDerivatives::new();
    let Some(input_partial) = partials.get(&input) else {
        return Ok(result);
    };
    let n_in = tensor::element_count(graph.shape(input));
    for (&wrt, partial) in input_partial.iter() {
        let wrt_shape = partial.shape()[graph.shape(input).len()..].to_vec();
        let m = tensor::to_matrix(partial, n_in, tensor::element_count(&wrt_shape))?;
        let summed: Vec<f64> = m.sum_axis(Axis(0)).iter().copied().collect();
        result.accumulate(wrt, tensor::create(summed, &wrt_shape)?)?;
    }
    Ok(result)
}

fn forward_matmul(
    graph: &Graph,
    left: VertexId,
    right: VertexId,
    partials: &HashMap<VertexId, PartialDerivatives>,
) -> Result<PartialDerivatives> {
    let a = as_matrix(graph.value_of(left)?)?;
    let b = as_matrix(graph.value_of(right)?)?;
    let (m, k, n) = (a.nrows(), a.ncols(), b.ncols());
    let mut result = PartialDerivatives::new();

    // d(A·B) = dA·B + A·dB, one wrt element (column) at a time.
    let terms: [(Option<&PartialDerivatives>, bool); 2] =
        [(partials.get(&left), true), (partials.get(&right), false)];
    for (source, is_left) in terms {
        let Some(source) = source else { continue };
        let (rows, cols) = if is_left { (m, k) } else { (k, n) };
        for (&wrt, partial) in source.iter() {
            let wrt_shape = partial.shape()[2..].to_vec();
            let n_wrt = tensor::element_count(&wrt_shape);
            let flat = tensor::to_matrix(partial, rows * cols, n_wrt)?;
            let mut out = Array2::<f64>::zeros((m * n, n_wrt));
            for c in 0..n_wrt {
                let column: Vec<f64> = flat.column(c).iter().copied().collect();
                let d = Array2::from_shape_vec((rows, cols), column).map_err(|_| Error::ShapeMismatch {
                    expected: vec![rows, cols],
                    got: partial.shape().to_vec(),
                })?;
                let product = if is_left { d.dot(&b) } else { a.dot(&d) };
                for (i, v) in product.iter().enumerate() {
                    out[[i, c]] = *v;
                }
            }
            let shape = tensor::concat_shapes(&[m, n], &wrt_shape);
            result.accumulate(wrt, tensor::from_matrix(&out, &shape)?)?;
        }
    }
    Ok(result)
}

/// Reverse-mode rule: distribute `upstream` (shaped `of_shape ++ shape(id)`)
/// to each parent of `id`.
///
/// Contributions to a length-one parent may still carry the broadcast output
/// dimensions; the caller collapses them.
pub(crate) fn reverse_partials(
    graph: &Graph,
    id: VertexId,
    upstream: &Tensor,
    of_shape: &[usize],
) -> Result<Vec<(VertexId, Tensor)>> {
    let vertex = graph.vertex(id);
    match &vertex.op {
        Op::Constant(_) | Op::Random(_) => return Ok(Vec::new()),
        Op::Abs(_) => return Err(not_differentiable(graph, id)),
        Op::Sum(a) => {
            let n_of = tensor::element_count(of_shape);
            let n_in = tensor::element_count(graph.shape(*a));
            let mut out = Array2::<f64>::zeros((n_of, n_in));
            for (mut row, g) in out.rows_mut().into_iter().zip(upstream.iter()) {
                row.fill(*g);
            }
            let shape = tensor::concat_shapes(of_shape, graph.shape(*a));
            return Ok(vec![(*a, tensor::from_matrix(&out, &shape)?)]);
        }
        Op::MatMul(l, r) => return reverse_matmul(graph, *l, *r, upstream, of_shape),
        _ => {}
    }

    let locals = elementwise_locals(graph, id)?.ok_or_else(|| not_differentiable(graph, id))?;
    locals
        .into_iter()
        .map(|(parent, local)| Ok((parent, partials::multiply_along_wrt_dimensions(upstream, &local, of_shape)?)))
        .collect()
}

fn reverse_matmul(
    graph: &Graph,
    left: VertexId,
    right: VertexId,
    upstream: &Tensor,
    of_shape: &[usize],
) -> Result<Vec<(VertexId, Tensor)>> {
    let a = as_matrix(graph.value_of(left)?)?;
    let b = as_matrix(graph.value_of(right)?)?;
    let (m, k, n) = (a.nrows(), a.ncols(), b.ncols());
    let n_of = tensor::element_count(of_shape);
    let g = tensor::to_matrix(upstream, n_of, m * n)?;

    let mut d_left = Array2::<f64>::zeros((n_of, m * k));
    let mut d_right = Array2::<f64>::zeros((n_of, k * n));
    for o in 0..n_of {
        let row: Vec<f64> = g.row(o).iter().copied().collect();
        let g_o = Array2::from_shape_vec((m, n), row).map_err(|_| Error::ShapeMismatch {
            expected: vec![m, n],
            got: upstream.shape().to_vec(),
        })?;
        // dL/dA = G·Bᵀ, dL/dB = Aᵀ·G
        let da = g_o.dot(&b.t());
        let db = a.t().dot(&g_o);
        for (i, v) in da.iter().enumerate() {
            d_left[[o, i]] = *v;
        }
        for (i, v) in db.iter().enumerate() {
            d_right[[o, i]] = *v;
        }
    }
    Ok(vec![
        (left, tensor::from_matrix(&d_left, &tensor::concat_shapes(of_shape, &[m, k]))?),
        (right, tensor::from_matrix(&d_right, &tensor::concat_shapes(of_shape, &[k, n]))?),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_elementwise_and_matmul() {
        let mut g = Graph::new();
        let a = g.constant(tensor::create(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap());
        let b = g.constant(tensor::create(vec![5.0, 6.0, 7.0, 8.0], &[2, 2]).unwrap());
        let c = g.matmul(a, b).unwrap();
        let out = calculate(&g, c).unwrap();
        assert_eq!(out.iter().copied().collect::<Vec<_>>(), vec![19.0, 22.0, 43.0, 50.0]);

        let x = g.scalar(1.0);
        let y = g.scalar(1.0);
        let angle = g.atan2(x, y).unwrap();
        assert!((tensor::first(&calculate(&g, angle).unwrap()) - std::f64::consts::FRAC_PI_4).abs() < 1e-12);
    }

    #[test]
    fn test_calculate_requires_parent_values() {
        let mut g = Graph::new();
        let mu = g.scalar(0.0);
        let sigma = g.scalar(1.0);
        let x = g.gaussian(mu, sigma).unwrap();
        let y = g.exp(x).unwrap();
        assert!(matches!(calculate(&g, y), Err(Error::MissingValue(id)) if id == x));
    }

    #[test]
    fn test_max_sends_ties_to_the_left() {
        let mut g = Graph::new();
        let a = g.constant(tensor::create(vec![1.0, 5.0, 2.0], &[3]).unwrap());
        let b = g.constant(tensor::create(vec![3.0, 4.0, 2.0], &[3]).unwrap());
        let m = g.max(a, b).unwrap();
        assert_eq!(calculate(&g, m).unwrap().iter().copied().collect::<Vec<_>>(), vec![3.0, 5.0, 2.0]);

        let locals = elementwise_locals(&g, m).unwrap().unwrap();
        let d = |i: usize| locals[i].1.iter().copied().collect::<Vec<_>>();
        assert_eq!(d(0), vec![0.0, 1.0, 1.0]);
        assert_eq!(d(1), vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_proxy_mirrors_its_input() {
        let mut g = Graph::new();
        let a = g.constant(tensor::create(vec![0.5, -0.25], &[2]).unwrap());
        let p = g.proxy(a).unwrap();
        assert_eq!(g.shape(p), &[2]);
        assert_eq!(&calculate(&g, p).unwrap(), g.value(a).unwrap());
        assert_eq!(g.vertex(p).op.name(), "Proxy");
    }

    #[test]
    fn test_abs_has_no_derivative_rule() {
        let mut g = Graph::new();
        let a = g.scalar(-2.0);
        let b = g.abs(a).unwrap();
        let err = reverse_partials(&g, b, &tensor::scalar(1.0), &[]).unwrap_err();
        assert!(matches!(err, Error::NotDifferentiable { op: "Abs", .. }));
    }
}
