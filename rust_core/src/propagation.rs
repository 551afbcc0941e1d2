//! Value propagation over the vertex graph.
//!
//! Cascades push changes down to deterministic descendants in ascending id
//! order. Eval and lazy eval pull values up through unresolved parents with
//! an explicit stack, so deep graphs never recurse.

use crate::error::Result;
use crate::graph::{Graph, VertexId};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

/// Recompute every deterministic descendant of `roots` exactly once.
///
/// Vertices are visited smallest id first, so a vertex is only recomputed
/// after every queued vertex it depends on. Probabilistic and observed
/// vertices are never recomputed and stop the cascade.
pub fn cascade_update(graph: &mut Graph, roots: &[VertexId]) -> Result<()> {
    for id in cascade_order(graph, roots)? {
        let value = graph.calculate(id)?;
        graph.store(id, value);
    }
    Ok(())
}

/// Clear the value of every deterministic descendant of `roots`.
pub fn uninitialize_downstream(graph: &mut Graph, roots: &[VertexId]) -> Result<()> {
    for id in cascade_order(graph, roots)? {
        graph.clear_value(id);
    }
    Ok(())
}

fn cascade_order(graph: &Graph, roots: &[VertexId]) -> Result<Vec<VertexId>> {
    let mut queue: BinaryHeap<Reverse<VertexId>> = BinaryHeap::new();
    let mut already_queued: HashSet<VertexId> = HashSet::new();

    let mut enqueue_children = |id: VertexId, queue: &mut BinaryHeap<Reverse<VertexId>>| {
        for &child in graph.children(id) {
            let v = graph.vertex(child);
            if !v.is_probabilistic() && !v.is_observed() && already_queued.insert(child) {
                queue.push(Reverse(child));
            }
        }
    };

    for &root in roots {
        graph.get(root)?;
        enqueue_children(root, &mut queue);
    }

    let mut order = Vec::new();
    while let Some(Reverse(id)) = queue.pop() {
        order.push(id);
        enqueue_children(id, &mut queue);
    }
    Ok(order)
}

/// Give every vertex in `vertices` a value, recomputing every deterministic
/// vertex reached on the way exactly once.
pub fn eval(graph: &mut Graph, vertices: &[VertexId]) -> Result<()> {
    resolve(graph, vertices, false)
}

/// Like [`eval`], but reuses any value already present.
pub fn lazy_eval(graph: &mut Graph, vertices: &[VertexId]) -> Result<()> {
    resolve(graph, vertices, true)
}

/// Lazily evaluate every vertex in the graph.
pub fn lazy_eval_all(graph: &mut Graph) -> Result<()> {
    let ids: Vec<VertexId> = graph.ids().collect();
    lazy_eval(graph, &ids)
}

fn resolve(graph: &mut Graph, vertices: &[VertexId], lazy: bool) -> Result<()> {
    let mut calculated: HashSet<VertexId> = HashSet::new();
    let mut stack: Vec<VertexId> = Vec::new();

    for &target in vertices {
        graph.get(target)?;
        stack.push(target);

        while let Some(&head) = stack.last() {
            if calculated.contains(&head) {
                stack.pop();
                continue;
            }
            // Constant, probabilistic and observed vertices that hold a value
            // are leaves. Lazy mode also stops at any parent holding a value, but
            // the head itself is always recomputed.
            let is_fixed = |id: VertexId| {
                let v = graph.vertex(id);
                v.has_value() && (v.op.is_constant() || v.is_probabilistic() || v.is_observed())
            };
            let head_is_leaf = is_fixed(head);
            let pending: Vec<VertexId> = if head_is_leaf {
                Vec::new()
            } else {
                graph
                    .parents(head)
                    .into_iter()
                    .filter(|&p| {
                        !calculated.contains(&p) && !is_fixed(p) && !(lazy && graph.vertex(p).has_value())
                    })
                    .collect()
            };

            if pending.is_empty() {
                stack.pop();
                if !head_is_leaf {
                    update_vertex_value(graph, head)?;
                }
                calculated.insert(head);
            } else {
                stack.extend(pending.into_iter().rev());
            }
        }
    }
    Ok(())
}

fn update_vertex_value(graph: &mut Graph, id: VertexId) -> Result<()> {
    let vertex = graph.vertex(id);
    let value = if vertex.is_probabilistic() {
        graph.sample_with_own_rng(id)?
    } else {
        graph.calculate(id)?
    };
    graph.store(id, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor;

    fn chain() -> (Graph, VertexId, VertexId, VertexId) {
        let mut g = Graph::new();
        let mu = g.scalar(0.0);
        let sigma = g.scalar(1.0);
        let a = g.gaussian(mu, sigma).unwrap();
        let two = g.scalar(2.0);
        let b = g.mul(a, two).unwrap();
        let c = g.exp(b).unwrap();
        (g, a, b, c)
    }

    #[test]
    fn test_cascade_recomputes_descendants() {
        let (mut g, a, b, c) = chain();
        g.set_value(a, tensor::scalar(1.0)).unwrap();
        cascade_update(&mut g, &[a]).unwrap();
        assert_eq!(g.scalar_value(b).unwrap(), 2.0);
        assert!((g.scalar_value(c).unwrap() - 2.0f64.exp()).abs() < 1e-12);
    }

    #[test]
    fn test_cascade_is_idempotent() {
        let (mut g, a, b, c) = chain();
        g.set_and_cascade(a, tensor::scalar(0.3)).unwrap();
        let once = (g.scalar_value(b).unwrap(), g.scalar_value(c).unwrap());
        cascade_update(&mut g, &[a]).unwrap();
        let twice = (g.scalar_value(b).unwrap(), g.scalar_value(c).unwrap());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_cascade_stops_at_probabilistic_children() {
        let mut g = Graph::new();
        let mu = g.scalar(0.0);
        let sigma = g.scalar(1.0);
        let a = g.gaussian(mu, sigma).unwrap();
        let b = g.gaussian(a, sigma).unwrap();
        g.set_value(b, tensor::scalar(4.0)).unwrap();
        g.set_and_cascade(a, tensor::scalar(1.0)).unwrap();
        assert_eq!(g.scalar_value(b).unwrap(), 4.0);
    }

    #[test]
    fn test_uninitialize_downstream_clears_values() {
        let (mut g, a, b, c) = chain();
        g.set_and_cascade(a, tensor::scalar(1.0)).unwrap();
        uninitialize_downstream(&mut g, &[a]).unwrap();
        assert!(g.value(a).is_some());
        assert!(g.value(b).is_none());
        assert!(g.value(c).is_none());
    }

    #[test]
    fn test_eval_samples_missing_latents() {
        let (mut g, a, _, c) = chain();
        eval(&mut g, &[c]).unwrap();
        let a_value = g.scalar_value(a).unwrap();
        assert!(((2.0 * a_value).exp() - g.scalar_value(c).unwrap()).abs() < 1e-9);
    }

    #[test]
    fn test_eval_recomputes_stale_values_but_lazy_eval_reuses_them() {
        let (mut g, a, b, c) = chain();
        g.set_and_cascade(a, tensor::scalar(1.0)).unwrap();
        g.set_value(a, tensor::scalar(2.0)).unwrap();

        lazy_eval(&mut g, &[c]).unwrap();
        assert_eq!(g.scalar_value(b).unwrap(), 2.0);

        eval(&mut g, &[c]).unwrap();
        assert_eq!(g.scalar_value(b).unwrap(), 4.0);
    }

    #[test]
    fn test_lazy_eval_recomputes_the_requested_vertex() {
        let (mut g, _, b, c) = chain();
        g.set_value(b, tensor::scalar(1.0)).unwrap();
        lazy_eval(&mut g, &[c]).unwrap();
        assert!((g.scalar_value(c).unwrap() - 1.0f64.exp()).abs() < 1e-12);

        g.set_value(b, tensor::scalar(0.0)).unwrap();
        lazy_eval(&mut g, &[c]).unwrap();
        assert_eq!(g.scalar_value(c).unwrap(), 1.0);
    }

    #[test]
    fn test_lazy_eval_keeps_latent_values() {
        let (mut g, a, b, _) = chain();
        g.set_value(a, tensor::scalar(0.5)).unwrap();
        lazy_eval(&mut g, &[b]).unwrap();
        assert_eq!(g.scalar_value(a).unwrap(), 0.5);
        assert_eq!(g.scalar_value(b).unwrap(), 1.0);
    }
}
