//! Isolation forest
//!
//! An ensemble of randomized partitioning trees. Each tree recursively splits
//! a random subsample at uniformly drawn points until every point is alone or
//! the height limit is reached. Points that are isolated after few splits are
//! outliers; the ensemble turns the average isolation depth into a score in
//! (0, 1] normalized by the expected depth of an unsuccessful BST search.

use crate::errors::DetectionError;
use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Ensemble hyper-parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    /// Number of trees in the ensemble
    pub n_estimators: usize,
    /// Subsample drawn for each tree (capped at the training set size)
    pub max_samples: usize,
    /// Seed for subsampling and split choices
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_samples: 256,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
    Leaf {
        size: usize,
    },
}

/// A single randomized partitioning tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationTree {
    root: Node,
}

impl IsolationTree {
    fn grow(points: Vec<&[f64]>, height_limit: usize, rng: &mut StdRng) -> Self {
        Self {
            root: grow_node(points, 0, height_limit, rng),
        }
    }

    /// Isolation depth of `point`, adjusted for the unresolved leaf size
    pub fn path_length(&self, point: &[f64]) -> f64 {
        let mut node = &self.root;
        let mut depth = 0.0;

        loop {
            match node {
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    depth += 1.0;
                    node = if point[*feature] < *threshold {
                        left
                    } else {
                        right
                    };
                }
                Node::Leaf { size } => return depth + average_path_length(*size),
            }
        }
    }
}

fn grow_node(points: Vec<&[f64]>, depth: usize, height_limit: usize, rng: &mut StdRng) -> Node {
    if depth >= height_limit || points.len() <= 1 {
        return Node::Leaf { size: points.len() };
    }

    let feature = rng.gen_range(0..points[0].len());
    let (min, max) = points.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
        (lo.min(p[feature]), hi.max(p[feature]))
    });

    // All points coincide on this feature, or the spread overflows f64
    if !(max > min) || !(max - min).is_finite() {
        return Node::Leaf { size: points.len() };
    }

    let threshold = rng.gen_range(min..max);
    let (left, right): (Vec<&[f64]>, Vec<&[f64]>) =
        points.into_iter().partition(|p| p[feature] < threshold);

    Node::Split {
        feature,
        threshold,
        left: Box::new(grow_node(left, depth + 1, height_limit, rng)),
        right: Box::new(grow_node(right, depth + 1, height_limit, rng)),
    }
}

/// Expected path length of an unsuccessful search in a BST of `n` nodes
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// Trained ensemble
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    params: ForestParams,
    sample_size: usize,
    dimensions: usize,
    trees: Vec<IsolationTree>,
}

impl IsolationForest {
    /// Fit an ensemble on `points`, all of the same dimension
    pub fn fit(points: &[Vec<f64>], params: &ForestParams) -> Result<Self, DetectionError> {
        if params.n_estimators == 0 {
            return Err(DetectionError::InvalidParameter(
                "n_estimators must be positive".to_string(),
            ));
        }
        if params.max_samples < 2 {
            return Err(DetectionError::InvalidParameter(
                "max_samples must be at least 2".to_string(),
            ));
        }
        let dimensions = match points.first() {
            Some(first) if !first.is_empty() => first.len(),
            _ => {
                return Err(DetectionError::InvalidParameter(
                    "training set is empty".to_string(),
                ))
            }
        };
        if points.iter().any(|p| p.len() != dimensions) {
            return Err(DetectionError::InvalidParameter(
                "training points differ in dimension".to_string(),
            ));
        }

        let sample_size = params.max_samples.min(points.len());
        let height_limit = (sample_size as f64).log2().ceil().max(1.0) as usize;
        let mut rng = StdRng::seed_from_u64(params.seed);

        let trees = (0..params.n_estimators)
            .map(|_| {
                let subsample: Vec<&[f64]> = index::sample(&mut rng, points.len(), sample_size)
                    .iter()
                    .map(|i| points[i].as_slice())
                    .collect();
                IsolationTree::grow(subsample, height_limit, &mut rng)
            })
            .collect();

        Ok(Self {
            params: params.clone(),
            sample_size,
            dimensions,
            trees,
        })
    }

    /// Mean isolation depth of `point` across the ensemble
    pub fn mean_path_length(&self, point: &[f64]) -> f64 {
        let total: f64 = self.trees.iter().map(|t| t.path_length(point)).sum();
        total / self.trees.len() as f64
    }

    /// Anomaly score in (0, 1]; values near 1 are isolated quickly
    pub fn score(&self, point: &[f64]) -> f64 {
        let normalizer = average_path_length(self.sample_size);
        if normalizer <= 0.0 {
            return 0.5;
        }
        2f64.powf(-self.mean_path_length(point) / normalizer)
    }

    pub fn params(&self) -> &ForestParams {
        &self.params
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }
}
