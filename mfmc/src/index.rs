// src/index.rs
//
// Nearest-neighbour index over the pre-transition vectors of the database.
//
// A k-d tree built on metric-scaled coordinates: scaling axis i by
// sqrt(w_i) turns the diagonal quadratic-form distance into a Euclidean
// one, so the usual median-split tree and pruning rule apply unchanged.
//
// Construction: O(n log^2 n) (sort per level)
// k-NN query:   O(log n + k) on average
//
// Results are ordered by (distance, position); equal distances resolve to
// the lower database position so rankings are reproducible.

use std::collections::BinaryHeap;

use ordered_float::OrderedFloat;

use crate::normalizer::DiagonalMetric;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    DimensionMismatch {
        position: usize,
        expected: usize,
        found: usize,
    },
}

impl std::fmt::Display for IndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexError::DimensionMismatch {
                position,
                expected,
                found,
            } => write!(
                f,
                "Vector {} has {} features; the metric expects {}",
                position, found, expected
            ),
        }
    }
}

impl std::error::Error for IndexError {}

#[derive(Debug)]
struct KdNode {
    /// Position of the stored vector.
    point: usize,
    split_dim: usize,
    left: Option<Box<KdNode>>,
    right: Option<Box<KdNode>>,
}

/// One ranked neighbour: database position and metric distance.
pub type Neighbor = (usize, f64);

#[derive(Debug)]
pub struct NeighborIndex {
    metric: DiagonalMetric,
    /// Metric-scaled copies of the indexed vectors.
    points: Vec<Vec<f64>>,
    root: Option<Box<KdNode>>,
}

impl NeighborIndex {
    /// Build over `vectors`; position i of the input is reported as index i.
    pub fn build<'a, I>(vectors: I, metric: DiagonalMetric) -> Result<Self, IndexError>
    where
        I: IntoIterator<Item = &'a [f64]>,
    {
        let dim = metric.dim();
        let mut points = Vec::new();
        for (position, v) in vectors.into_iter().enumerate() {
            if v.len() != dim {
                return Err(IndexError::DimensionMismatch {
                    position,
                    expected: dim,
                    found: v.len(),
                });
            }
            points.push(metric.scale(v));
        }

        let mut order: Vec<usize> = (0..points.len()).collect();
        let root = Self::build_recursive(&points, &mut order, 0, dim);

        Ok(Self {
            metric,
            points,
            root,
        })
    }

    fn build_recursive(
        points: &[Vec<f64>],
        order: &mut [usize],
        depth: usize,
        dim: usize,
    ) -> Option<Box<KdNode>> {
        if order.is_empty() {
            return None;
        }
        let split_dim = if dim == 0 { 0 } else { depth % dim };

        order.sort_by(|&a, &b| {
            let ca = points[a].get(split_dim).copied().unwrap_or(0.0);
            let cb = points[b].get(split_dim).copied().unwrap_or(0.0);
            ca.total_cmp(&cb).then(a.cmp(&b))
        });

        let mid = order.len() / 2;
        let (left, rest) = order.split_at_mut(mid);
        let (pivot, right) = rest.split_first_mut()?;

        Some(Box::new(KdNode {
            point: *pivot,
            split_dim,
            left: Self::build_recursive(points, left, depth + 1, dim),
            right: Self::build_recursive(points, right, depth + 1, dim),
        }))
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn metric(&self) -> &DiagonalMetric {
        &self.metric
    }

    /// The `k` closest indexed vectors to `query`, nearest first.
    ///
    /// `k` is clamped to the index size.
    pub fn query(&self, query: &[f64], k: usize) -> Vec<Neighbor> {
        let k = k.min(self.points.len());
        if k == 0 {
            return Vec::new();
        }

        let q = self.metric.scale(query);
        let mut heap: BinaryHeap<(OrderedFloat<f64>, usize)> = BinaryHeap::with_capacity(k + 1);
        if let Some(root) = self.root.as_deref() {
            self.knn_recursive(root, &q, k, &mut heap);
        }

        let mut out: Vec<(OrderedFloat<f64>, usize)> = heap.into_vec();
        out.sort();
        out.into_iter().map(|(d, idx)| (idx, d.0.sqrt())).collect()
    }

    fn knn_recursive(
        &self,
        node: &KdNode,
        q: &[f64],
        k: usize,
        heap: &mut BinaryHeap<(OrderedFloat<f64>, usize)>,
    ) {
        let p = &self.points[node.point];
        let dist_sq: f64 = p.iter().zip(q).map(|(a, b)| (a - b) * (a - b)).sum();
        let candidate = (OrderedFloat(dist_sq), node.point);

        if heap.len() < k {
            heap.push(candidate);
        } else if let Some(&worst) = heap.peek() {
            if candidate < worst {
                heap.pop();
                heap.push(candidate);
            }
        }

        let dim = node.split_dim;
        let diff = q.get(dim).copied().unwrap_or(0.0) - p.get(dim).copied().unwrap_or(0.0);
        let (near, far) = if diff < 0.0 {
            (&node.left, &node.right)
        } else {
            (&node.right, &node.left)
        };

        if let Some(child) = near.as_deref() {
            self.knn_recursive(child, q, k, heap);
        }

        // Ties on the splitting plane may still beat the worst kept entry
        // by position, hence `<=`.
        let must_visit_far = heap.len() < k
            || heap
                .peek()
                .map(|worst| diff * diff <= worst.0 .0)
                .unwrap_or(true);
        if must_visit_far {
            if let Some(child) = far.as_deref() {
                self.knn_recursive(child, q, k, heap);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn brute_force(points: &[Vec<f64>], metric: &DiagonalMetric, q: &[f64], k: usize) -> Vec<Neighbor> {
        let mut all: Vec<(OrderedFloat<f64>, usize)> = points
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let s: f64 = metric
                    .scale(p)
                    .iter()
                    .zip(metric.scale(q))
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum();
                (OrderedFloat(s), i)
            })
            .collect();
        all.sort();
        all.truncate(k);
        all.into_iter().map(|(d, i)| (i, d.0.sqrt())).collect()
    }

    #[test]
    fn one_dimensional_query_uses_weighted_distance() {
        let vectors = vec![vec![0.0], vec![1.0]];
        let index = NeighborIndex::build(
            vectors.iter().map(|v| v.as_slice()),
            DiagonalMetric::new(vec![4.0]),
        )
        .unwrap();
        let got = index.query(&[10.0], 2);
        assert_eq!(got, vec![(1, 18.0), (0, 20.0)]);
    }

    #[test]
    fn k_is_clamped_and_ties_prefer_lower_position() {
        let vectors = vec![vec![1.0, 0.0], vec![-1.0, 0.0], vec![0.0, 1.0]];
        let index = NeighborIndex::build(
            vectors.iter().map(|v| v.as_slice()),
            DiagonalMetric::identity(2),
        )
        .unwrap();
        let got = index.query(&[0.0, 0.0], 50);
        assert_eq!(got.len(), 3);
        assert_eq!(got.iter().map(|n| n.0).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(index.query(&[0.0, 0.0], 0).is_empty());
    }

    #[test]
    fn matches_brute_force_on_random_points() {
        let mut rng = ChaCha8Rng::seed_from_u64(17);
        let points: Vec<Vec<f64>> = (0..300)
            .map(|_| (0..3).map(|_| rng.gen_range(-5.0..5.0)).collect())
            .collect();
        let metric = DiagonalMetric::new(vec![0.5, 2.0, 10.0]);
        let index = NeighborIndex::build(points.iter().map(|v| v.as_slice()), metric.clone()).unwrap();

        for _ in 0..25 {
            let q: Vec<f64> = (0..3).map(|_| rng.gen_range(-6.0..6.0)).collect();
            for k in [1, 7, 40] {
                let got = index.query(&q, k);
                let want = brute_force(&points, &metric, &q, k);
                assert_eq!(
                    got.iter().map(|n| n.0).collect::<Vec<_>>(),
                    want.iter().map(|n| n.0).collect::<Vec<_>>()
                );
                for (g, w) in got.iter().zip(&want) {
                    assert!((g.1 - w.1).abs() < 1e-9);
                }
            }
        }
    }

    #[test]
    fn rejects_wrong_dimension() {
        let vectors = vec![vec![0.0], vec![1.0, 2.0]];
        let err = NeighborIndex::build(
            vectors.iter().map(|v| v.as_slice()),
            DiagonalMetric::identity(1),
        )
        .unwrap_err();
        assert_eq!(
            err,
            IndexError::DimensionMismatch {
                position: 1,
                expected: 1,
                found: 2
            }
        );
    }
}
