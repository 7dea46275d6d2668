//! Identity clustering over accumulated face embeddings.
//!
//! Density-based: a face whose eps-neighborhood (itself included) holds at
//! least `min_pts` faces is a core point; core points connect transitively
//! into clusters and every other face joins the cluster of the earliest
//! core point that reaches it, or becomes noise. Neighbor sets are
//! precomputed and expansion uses an explicit work-list, so large clusters
//! never deepen the call stack. The whole pass is a pure function of the
//! index and the parameters, which makes labeling reproducible run to run.

use ndarray::{Array2, ArrayView1};
use rayon::prelude::*;
use std::collections::VecDeque;

use crate::config::{ClusteringConfig, DistanceMetric};
use crate::index::EmbeddingIndex;

pub type ClusterLabel = usize;

/// One inferred identity.
#[derive(Debug, Clone)]
pub struct IdentityCluster {
    pub label: ClusterLabel,
    /// Mean of member embeddings, recomputed after labeling.
    pub centroid: Vec<f32>,
    pub member_count: usize,
}

/// Result of a clustering pass: a label (or noise) per observation, in
/// index order, plus per-cluster summaries.
#[derive(Debug, Clone, Default)]
pub struct ClusterAssignment {
    pub labels: Vec<Option<ClusterLabel>>,
    pub clusters: Vec<IdentityCluster>,
}

impl ClusterAssignment {
    pub fn noise_count(&self) -> usize {
        self.labels.iter().filter(|l| l.is_none()).count()
    }
}

/// Cluster the embedding index. Requires the full index (no streaming);
/// runs after the scan phase has drained.
pub fn cluster(index: &EmbeddingIndex, config: &ClusteringConfig) -> ClusterAssignment {
    let n = index.len();
    if n == 0 {
        return ClusterAssignment::default();
    }

    let dim = index.observations()[0].embedding.len();
    let mut matrix = Array2::<f32>::zeros((n, dim));
    for (i, obs) in index.iter().enumerate() {
        for (j, v) in obs.embedding.iter().take(dim).enumerate() {
            matrix[[i, j]] = *v;
        }
    }

    // Neighbor lists (self excluded), ascending by index so "earliest
    // core point" lookups are a plain linear scan.
    let eps = config.eps;
    let metric = config.metric;
    let neighbors: Vec<Vec<usize>> = (0..n)
        .into_par_iter()
        .map(|i| {
            let row = matrix.row(i);
            (0..n)
                .filter(|&j| j != i && distance(metric, row, matrix.row(j)) <= eps)
                .collect()
        })
        .collect();

    // Neighborhood includes the point itself, so min_pts = 1 admits
    // singleton identities.
    let core: Vec<bool> = neighbors
        .iter()
        .map(|ns| ns.len() + 1 >= config.min_pts)
        .collect();

    // Connect core points transitively; explicit work-list, no recursion.
    let mut labels: Vec<Option<ClusterLabel>> = vec![None; n];
    let mut next_label: ClusterLabel = 0;
    let mut queue = VecDeque::new();

    for seed in 0..n {
        if !core[seed] || labels[seed].is_some() {
            continue;
        }

        let label = next_label;
        next_label += 1;
        labels[seed] = Some(label);
        queue.push_back(seed);

        while let Some(point) = queue.pop_front() {
            for &neighbor in &neighbors[point] {
                if core[neighbor] && labels[neighbor].is_none() {
                    labels[neighbor] = Some(label);
                    queue.push_back(neighbor);
                }
            }
        }
    }

    // A non-core point reachable from several clusters joins the cluster
    // of the earliest core point (by insertion order) within eps; points
    // no core point reaches stay noise.
    for i in 0..n {
        if core[i] {
            continue;
        }
        if let Some(&reaching_core) = neighbors[i].iter().find(|&&j| core[j]) {
            labels[i] = labels[reaching_core];
        }
    }

    let clusters = build_clusters(&labels, &matrix, next_label, dim);

    tracing::debug!(
        faces = n,
        clusters = clusters.len(),
        noise = labels.iter().filter(|l| l.is_none()).count(),
        "clustering complete"
    );

    ClusterAssignment { labels, clusters }
}

fn build_clusters(
    labels: &[Option<ClusterLabel>],
    matrix: &Array2<f32>,
    cluster_count: usize,
    dim: usize,
) -> Vec<IdentityCluster> {
    let mut sums = vec![vec![0.0f32; dim]; cluster_count];
    let mut counts = vec![0usize; cluster_count];

    for (i, label) in labels.iter().enumerate() {
        if let Some(label) = label {
            let row = matrix.row(i);
            for (acc, v) in sums[*label].iter_mut().zip(row.iter()) {
                *acc += v;
            }
            counts[*label] += 1;
        }
    }

    sums.into_iter()
        .zip(counts)
        .enumerate()
        .map(|(label, (mut centroid, member_count))| {
            if member_count > 0 {
                for v in &mut centroid {
                    *v /= member_count as f32;
                }
            }
            IdentityCluster {
                label,
                centroid,
                member_count,
            }
        })
        .collect()
}

fn distance(metric: DistanceMetric, a: ArrayView1<'_, f32>, b: ArrayView1<'_, f32>) -> f32 {
    match metric {
        DistanceMetric::Cosine => {
            let dot = a.dot(&b);
            let norm_a = a.dot(&a).sqrt();
            let norm_b = b.dot(&b).sqrt();
            if norm_a > 0.0 && norm_b > 0.0 {
                1.0 - dot / (norm_a * norm_b)
            } else {
                1.0
            }
        }
        DistanceMetric::Euclidean => a
            .iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt(),
    }
}
