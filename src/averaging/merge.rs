use rayon::prelude::*;

use super::Contribution;
use crate::transport::PeerId;

const CHUNK: usize = 1024;

/// The result of merging every valid contribution of a round.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedRound {
    pub gradient: Vec<f32>,
    /// Averaged parameters, only present when at least one participant sent its state.
    pub parameters: Option<Vec<f32>>,
    /// Total samples behind the merged gradient.
    pub samples: u64,
    /// Participants in the order they were reduced.
    pub participants: Vec<PeerId>,
}

/// Averages the contributions weighting each one by its amount of samples.
///
/// Contributions are reduced in peer order regardless of the order they arrived in,
/// so every peer of the round computes bitwise identical results.
///
/// # Arguments
/// * `contributions` - Already validated contributions, all of the same length.
///
/// # Returns
/// The merged round, or `None` if there's nothing to merge.
pub fn weighted_average(contributions: &[Contribution]) -> Option<MergedRound> {
    let mut ordered: Vec<&Contribution> = contributions.iter().collect();
    ordered.sort_by(|a, b| a.peer.cmp(&b.peer));

    let first = ordered.first()?;
    let len = first.gradient.len();

    let samples = ordered.iter().map(|c| c.samples).sum::<u64>();
    if samples == 0 {
        return None;
    }

    let weighted: Vec<_> = ordered
        .iter()
        .map(|c| (c.samples as f32 / samples as f32, c.gradient.as_slice()))
        .collect();
    let gradient = reduce(len, &weighted);

    let with_state: Vec<_> = ordered
        .iter()
        .filter_map(|c| c.parameters.as_deref().map(|p| (c.samples, p)))
        .collect();

    let parameters = if with_state.is_empty() {
        None
    } else {
        let state_samples = with_state.iter().map(|(s, _)| s).sum::<u64>();
        let weighted: Vec<_> = with_state
            .iter()
            .map(|(s, p)| (*s as f32 / state_samples as f32, *p))
            .collect();
        Some(reduce(len, &weighted))
    };

    Some(MergedRound {
        gradient,
        parameters,
        samples,
        participants: ordered.iter().map(|c| c.peer.clone()).collect(),
    })
}

fn reduce(len: usize, weighted: &[(f32, &[f32])]) -> Vec<f32> {
    let mut out = vec![0.; len];

    out.par_chunks_mut(CHUNK)
        .enumerate()
        .for_each(|(i, chunk)| {
            let offset = i * CHUNK;
            for (weight, values) in weighted {
                let values = &values[offset..offset + chunk.len()];
                chunk
                    .iter_mut()
                    .zip(values)
                    .for_each(|(acc, v)| *acc += weight * v);
            }
        });

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contribution(peer: &str, samples: u64, gradient: Vec<f32>) -> Contribution {
        Contribution {
            peer: PeerId::new(peer),
            run_id: "run".into(),
            epoch: 0,
            samples,
            gradient,
            parameters: None,
        }
    }

    #[test]
    fn weights_by_samples() {
        let merged = weighted_average(&[
            contribution("a", 75, vec![1.0, 0.0]),
            contribution("b", 25, vec![5.0, 4.0]),
        ])
        .unwrap();

        assert_eq!(merged.gradient, vec![2.0, 1.0]);
        assert_eq!(merged.samples, 100);
        assert_eq!(merged.participants, vec![PeerId::new("a"), PeerId::new("b")]);
        assert!(merged.parameters.is_none());
    }

    #[test]
    fn arrival_order_is_irrelevant() {
        let a = contribution("a", 7, vec![0.1, 0.3, 0.7]);
        let b = contribution("b", 13, vec![0.2, 0.9, 0.4]);
        let c = contribution("c", 3, vec![0.5, 0.6, 0.8]);

        let forward = weighted_average(&[a.clone(), b.clone(), c.clone()]).unwrap();
        let backward = weighted_average(&[c, a, b]).unwrap();
        assert_eq!(forward, backward);
    }

    #[test]
    fn averages_state_of_senders_only() {
        let mut a = contribution("a", 1, vec![0.0]);
        a.parameters = Some(vec![4.0]);
        let mut b = contribution("b", 3, vec![0.0]);
        b.parameters = Some(vec![8.0]);
        let c = contribution("c", 4, vec![0.0]);

        let merged = weighted_average(&[a, b, c]).unwrap();
        assert_eq!(merged.parameters, Some(vec![7.0]));
    }

    #[test]
    fn spans_multiple_chunks() {
        let len = CHUNK * 2 + 3;
        let merged = weighted_average(&[
            contribution("a", 1, vec![1.0; len]),
            contribution("b", 1, vec![3.0; len]),
        ])
        .unwrap();
        assert!(merged.gradient.iter().all(|g| *g == 2.0));
    }

    #[test]
    fn empty_round_has_nothing_to_merge() {
        assert!(weighted_average(&[]).is_none());
    }
}
