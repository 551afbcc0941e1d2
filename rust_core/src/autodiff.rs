use crate::error::Result;
use crate::graph::{Graph, VertexId};
use crate::ops;
use crate::partials::{self, PartialDerivatives};
use crate::tensor::{self, Tensor};
use std::collections::{BinaryHeap, HashMap, HashSet};

/// For every vertex, whether its value can change when a probabilistic
/// vertex changes. Constant subgraphs carry no derivatives and are skipped,
/// so a non-differentiable op only fails when a derivative must pass through it.
fn stochastic_mask(graph: &Graph) -> Vec<bool> {
    let mut mask = vec![false; graph.len()];
    for v in graph.vertices() {
        mask[v.id.0] = v.is_probabilistic() || (!v.is_observed() && v.parents().iter().any(|p| mask[p.0]));
    }
    mask
}

/// Reverse-mode derivatives of `of` with respect to each vertex in `wrt`.
///
/// Each returned tensor is shaped `shape(of) ++ shape(wrt)`.
pub fn reverse_mode_autodiff(graph: &Graph, of: VertexId, wrt: &[VertexId]) -> Result<PartialDerivatives> {
    let shape = graph.get(of)?.shape.clone();
    reverse_mode_autodiff_with_seed(graph, of, tensor::identity(&shape), &shape, wrt)
}

/// Reverse-mode derivatives of some quantity `L` with respect to `wrt`,
/// given `seed = dL/d(of)` shaped `of_shape ++ shape(of)`.
pub fn reverse_mode_autodiff_with_seed(
    graph: &Graph,
    of: VertexId,
    seed: Tensor,
    of_shape: &[usize],
    wrt: &[VertexId],
) -> Result<PartialDerivatives> {
    graph.get(of)?;
    reverse_pass(graph, of, seed, of_shape, wrt, &stochastic_mask(graph))
}

fn reverse_pass(
    graph: &Graph,
    of: VertexId,
    seed: Tensor,
    of_shape: &[usize],
    wrt: &[VertexId],
    mask: &[bool],
) -> Result<PartialDerivatives> {
    // Largest id first: every consumer of a vertex has a larger id, so a
    // vertex is only visited once all its upstream contributions are in.
    let mut queue: BinaryHeap<VertexId> = BinaryHeap::new();
    let mut already_queued: HashSet<VertexId> = HashSet::new();
    let mut upstream: HashMap<VertexId, Tensor> = HashMap::new();

    upstream.insert(of, seed);
    queue.push(of);
    already_queued.insert(of);

    while let Some(id) = queue.pop() {
        let vertex = graph.vertex(id);
        // Probabilistic vertices are leaves here; their parameters are
        // reached through their own log density instead.
        if vertex.is_probabilistic() || vertex.is_observed() || !mask[id.0] {
            continue;
        }
        let Some(g) = upstream.get(&id).cloned() else {
            continue;
        };

        for (parent, contribution) in ops::reverse_partials(graph, id, &g, of_shape)? {
            if !mask[parent.0] {
                continue;
            }
            let contribution = partials::collapse_to_parent(contribution, of_shape, graph.shape(parent))?;
            match upstream.get_mut(&parent) {
                Some(existing) => *existing += &contribution,
                None => {
                    upstream.insert(parent, contribution);
                }
            }
            if already_queued.insert(parent) {
                queue.push(parent);
            }
        }
    }

    // Accumulators are keyed by the vertex they were collected at; re-key
    // them by the requested wrt vertices.
    let mut result = PartialDerivatives::new();
    for &w in wrt {
        if let Some(partial) = upstream.remove(&w) {
            result.accumulate(w, partial)?;
        }
    }
    Ok(result)
}

/// Forward-mode derivatives of `of` with respect to every latent vertex it
/// depends on through deterministic vertices.
pub fn forward_mode_autodiff(graph: &Graph, of: VertexId) -> Result<PartialDerivatives> {
    graph.get(of)?;
    let mask = stochastic_mask(graph);
    let mut partials: HashMap<VertexId, PartialDerivatives> = HashMap::new();
    let mut stack = vec![of];

    while let Some(&head) = stack.last() {
        if partials.contains_key(&head) {
            stack.pop();
            continue;
        }
        let vertex = graph.vertex(head);
        if vertex.is_probabilistic() || vertex.is_observed() || !mask[head.0] {
            let seeded = if vertex.is_latent() {
                PartialDerivatives::with_respect_to_self(head, &vertex.shape)
            } else {
                PartialDerivatives::new()
            };
            partials.insert(head, seeded);
            stack.pop();
            continue;
        }

        let pending: Vec<VertexId> = vertex
            .parents()
            .into_iter()
            .filter(|p| !partials.contains_key(p))
            .collect();
        if pending.is_empty() {
            stack.pop();
            let partial = ops::forward_partial(graph, head, &partials)?;
            partials.insert(head, partial);
        } else {
            stack.extend(pending);
        }
    }

    Ok(partials.remove(&of).unwrap_or_default())
}

/// Gradient of a sum of log densities with respect to a set of latents.
///
/// Each probabilistic vertex contributes its derivative with respect to its
/// own value, when it is one of the latents, and its derivatives with respect
/// to its parameters, chained back to the latents by a seeded reverse pass.
#[derive(Debug, Clone)]
pub struct LogProbGradientCalculator {
    of: Vec<VertexId>,
    wrt: Vec<VertexId>,
    /// Parameters of each `of` vertex through which some wrt latent is reached.
    relevant_parameters: HashMap<VertexId, Vec<VertexId>>,
    mask: Vec<bool>,
}

impl LogProbGradientCalculator {
    pub fn new(graph: &Graph, of: &[VertexId], wrt: &[VertexId]) -> Result<Self> {
        let wrt_set: HashSet<VertexId> = wrt.iter().copied().collect();
        let mut relevant_parameters = HashMap::new();
        for &v in of {
            graph.get(v)?;
            let relevant: Vec<VertexId> = graph
                .parents(v)
                .into_iter()
                .filter(|&p| graph.latent_sources(p).iter().any(|s| wrt_set.contains(s)))
                .collect();
            relevant_parameters.insert(v, relevant);
        }
        for &w in wrt {
            graph.get(w)?;
        }
        Ok(Self {
            of: of.to_vec(),
            wrt: wrt.to_vec(),
            relevant_parameters,
            mask: stochastic_mask(graph),
        })
    }

    pub fn wrt(&self) -> &[VertexId] {
        &self.wrt
    }

    /// Gradient at the graph's current values. Every wrt vertex has an
    /// entry, zero when nothing depends on it.
    pub fn gradient(&self, graph: &Graph) -> Result<HashMap<VertexId, Tensor>> {
        let wrt_set: HashSet<VertexId> = self.wrt.iter().copied().collect();
        let mut result = PartialDerivatives::new();

        for &v in &self.of {
            let d = graph.d_log_prob(v)?;
            if wrt_set.contains(&v) {
                result.accumulate(v, d.wrt_value)?;
            }
            let relevant = self.relevant_parameters.get(&v).map(Vec::as_slice).unwrap_or(&[]);
            for (param, d_param) in graph.parents(v).into_iter().zip(d.wrt_params) {
                if !relevant.contains(&param) {
                    continue;
                }
                if wrt_set.contains(&param) {
                    result.accumulate(param, d_param)?;
                    continue;
                }
                let chained = reverse_pass(graph, param, d_param, &[], &self.wrt, &self.mask)?;
                for (w, partial) in chained.into_map() {
                    result.accumulate(w, partial)?;
                }
            }
        }

        let mut gradient = result.into_map();
        for &w in &self.wrt {
            gradient.entry(w).or_insert_with(|| tensor::zeros(graph.shape(w)));
        }
        Ok(gradient)
    }
}
