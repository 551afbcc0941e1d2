use crate::error::{Error, Result};
use crate::graph::VertexId;
use crate::model::ProbabilisticModelWithGradient;
use crate::tensor::{self, Tensor};
use std::collections::HashMap;

/// One point of a simulated Hamiltonian trajectory, keyed by latent vertex.
///
/// Immutable: [`Leapfrog::step`] returns a new point.
#[derive(Debug, Clone)]
pub struct Leapfrog {
    pub position: HashMap<VertexId, Tensor>,
    pub momentum: HashMap<VertexId, Tensor>,
    pub gradient: HashMap<VertexId, Tensor>,
}

impl Leapfrog {
    pub fn new(
        position: HashMap<VertexId, Tensor>,
        momentum: HashMap<VertexId, Tensor>,
        gradient: HashMap<VertexId, Tensor>,
    ) -> Self {
        Self {
            position,
            momentum,
            gradient,
        }
    }

    /// Advance by one step of size `epsilon`. The new position is written to
    /// the model and cascaded before the gradient is recomputed, so the model
    /// is left at the returned position.
    pub fn step<M: ProbabilisticModelWithGradient>(
        &self,
        model: &mut M,
        latents: &[VertexId],
        epsilon: f64,
    ) -> Result<Leapfrog> {
        let half_time_step = epsilon / 2.0;

        let mut half_step_momentum = HashMap::with_capacity(latents.len());
        let mut next_position = HashMap::with_capacity(latents.len());
        for &id in latents {
            let momentum = self.entry(&self.momentum, id)?;
            let gradient = self.entry(&self.gradient, id)?;
            let position = self.entry(&self.position, id)?;

            let p = momentum + &(gradient * half_time_step);
            let q = position + &(&p * half_time_step);
            half_step_momentum.insert(id, p);
            next_position.insert(id, q);
        }

        model.set_values(&next_position)?;
        let next_gradient = model.log_prob_gradients()?;

        let mut next_momentum = HashMap::with_capacity(latents.len());
        for &id in latents {
            let gradient = next_gradient.get(&id).ok_or(Error::MissingValue(id))?;
            let p = &half_step_momentum[&id] + &(gradient * half_time_step);
            next_momentum.insert(id, p);
        }

        Ok(Leapfrog {
            position: next_position,
            momentum: next_momentum,
            gradient: next_gradient,
        })
    }

    /// Kinetic energy: ½ Σ p² over every latent.
    pub fn half_dot_product_momentum(&self) -> f64 {
        let mut ids: Vec<&VertexId> = self.momentum.keys().collect();
        ids.sort();
        0.5 * ids.into_iter().map(|id| tensor::dot(&self.momentum[id], &self.momentum[id])).sum::<f64>()
    }

    /// Same point with every momentum negated.
    pub fn with_negated_momentum(&self) -> Leapfrog {
        Leapfrog {
            position: self.position.clone(),
            momentum: self.momentum.iter().map(|(&id, p)| (id, -p)).collect(),
            gradient: self.gradient.clone(),
        }
    }

    fn entry<'a>(&self, map: &'a HashMap<VertexId, Tensor>, id: VertexId) -> Result<&'a Tensor> {
        map.get(&id).ok_or(Error::MissingValue(id))
    }
}
