//! Benchmark clustering
//!
//! Groups valid repetitions with seeded k-means over standardized features and
//! picks the group count with the best silhouette score. Group centers are
//! mapped back to original units and become the benchmark profiles.
//!
//! Pipeline: complete rows → standardize → k-means for each k → silhouette → best k

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::standardize::Standardizer;
use crate::types::{BenchmarkProfile, FeatureTable};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Settings for a single k-means fit
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansConfig {
    pub k: usize,
    pub seed: u64,
    pub restarts: usize,
    pub max_iterations: usize,
    pub tolerance: f64,
}

/// Fitted k-means model over standardized features
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KMeansModel {
    /// Non-empty groups only; may be fewer than the requested k
    pub centroids: Vec<Vec<f64>>,
    /// Sum of squared distances of training points to their centroid
    pub inertia: f64,
    pub iterations: usize,
    pub requested_k: usize,
    pub seed: u64,
}

impl KMeansModel {
    pub fn k(&self) -> usize {
        self.centroids.len()
    }

    /// Index of the nearest centroid and the Euclidean distance to it
    pub fn nearest(&self, point: &[f64]) -> (usize, f64) {
        let (index, dist_sq) = nearest_centroid(point, &self.centroids);
        (index, dist_sq.sqrt())
    }

    pub fn predict(&self, point: &[f64]) -> usize {
        self.nearest(point).0
    }
}

/// Fit k-means with k-means++ initialisation.
///
/// Runs `restarts` initialisations from one seeded generator and keeps the
/// lowest-inertia result. Returns the model and the group label per point.
/// Groups left empty are dropped and labels renumbered.
pub fn fit_kmeans(
    points: &[Vec<f64>],
    config: &KMeansConfig,
) -> Result<(KMeansModel, Vec<usize>), PipelineError> {
    if config.k == 0 || config.k > points.len() {
        return Err(PipelineError::ModelError(format!(
            "k-means needs 1 <= k <= {} rows, got k = {}",
            points.len(),
            config.k
        )));
    }

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut best: Option<(Vec<Vec<f64>>, Vec<usize>, f64, usize)> = None;

    for _ in 0..config.restarts.max(1) {
        let initial = kmeans_plus_plus(points, config.k, &mut rng);
        let (centroids, labels, iterations) =
            lloyd(points, initial, config.max_iterations, config.tolerance);
        let inertia = inertia(points, &centroids, &labels);

        if best.as_ref().map_or(true, |(_, _, b, _)| inertia < *b) {
            best = Some((centroids, labels, inertia, iterations));
        }
    }

    let (centroids, labels, inertia, iterations) = best.ok_or_else(|| {
        PipelineError::ModelError("k-means produced no result".to_string())
    })?;
    let (centroids, labels) = compact(centroids, labels);

    Ok((
        KMeansModel {
            centroids,
            inertia,
            iterations,
            requested_k: config.k,
            seed: config.seed,
        },
        labels,
    ))
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

/// Nearest centroid index (lowest index on ties) and squared distance
fn nearest_centroid(point: &[f64], centroids: &[Vec<f64>]) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (i, centroid) in centroids.iter().enumerate() {
        let d = squared_distance(point, centroid);
        if d < best.1 {
            best = (i, d);
        }
    }
    best
}

fn kmeans_plus_plus(points: &[Vec<f64>], k: usize, rng: &mut ChaCha8Rng) -> Vec<Vec<f64>> {
    let mut centroids = Vec::with_capacity(k);
    centroids.push(points[rng.random_range(0..points.len())].clone());

    let mut min_dist: Vec<f64> = points
        .iter()
        .map(|p| squared_distance(p, &centroids[0]))
        .collect();

    while centroids.len() < k {
        let total: f64 = min_dist.iter().sum();
        let chosen = if total > 0.0 {
            let target = rng.random::<f64>() * total;
            let mut cumulative = 0.0;
            let mut chosen = points.len() - 1;
            for (i, d) in min_dist.iter().enumerate() {
                cumulative += d;
                if cumulative >= target && *d > 0.0 {
                    chosen = i;
                    break;
                }
            }
            chosen
        } else {
            rng.random_range(0..points.len())
        };

        let centroid = points[chosen].clone();
        for (d, p) in min_dist.iter_mut().zip(points) {
            *d = d.min(squared_distance(p, &centroid));
        }
        centroids.push(centroid);
    }

    centroids
}

fn assign(points: &[Vec<f64>], centroids: &[Vec<f64>]) -> Vec<usize> {
    points
        .iter()
        .map(|p| nearest_centroid(p, centroids).0)
        .collect()
}

/// Mean of each group's points. Empty groups are moved onto the point farthest
/// from its own centroid when `relocate_empty` is set, otherwise left in place.
fn update_centroids(
    points: &[Vec<f64>],
    labels: &[usize],
    previous: &[Vec<f64>],
    relocate_empty: bool,
) -> Vec<Vec<f64>> {
    let k = previous.len();
    let dim = previous.first().map_or(0, Vec::len);
    let mut sums = vec![vec![0.0; dim]; k];
    let mut counts = vec![0usize; k];

    for (point, &label) in points.iter().zip(labels) {
        counts[label] += 1;
        for (s, v) in sums[label].iter_mut().zip(point) {
            *s += v;
        }
    }

    let mut taken: Vec<usize> = Vec::new();
    (0..k)
        .map(|j| {
            if counts[j] > 0 {
                sums[j].iter().map(|s| s / counts[j] as f64).collect()
            } else if relocate_empty {
                let far = farthest_point(points, labels, previous, &taken);
                taken.push(far);
                points[far].clone()
            } else {
                previous[j].clone()
            }
        })
        .collect()
}

fn farthest_point(
    points: &[Vec<f64>],
    labels: &[usize],
    centroids: &[Vec<f64>],
    exclude: &[usize],
) -> usize {
    let mut best = (0, -1.0);
    for (i, (point, &label)) in points.iter().zip(labels).enumerate() {
        if exclude.contains(&i) {
            continue;
        }
        let d = squared_distance(point, &centroids[label]);
        if d > best.1 {
            best = (i, d);
        }
    }
    best.0
}

/// Lloyd iterations; the returned centroids are the means of the returned labels
fn lloyd(
    points: &[Vec<f64>],
    mut centroids: Vec<Vec<f64>>,
    max_iterations: usize,
    tolerance: f64,
) -> (Vec<Vec<f64>>, Vec<usize>, usize) {
    let mut labels = assign(points, &centroids);
    let mut iterations = 0;

    while iterations < max_iterations {
        iterations += 1;
        let updated = update_centroids(points, &labels, &centroids, true);
        let shift = centroids
            .iter()
            .zip(&updated)
            .map(|(a, b)| squared_distance(a, b))
            .fold(0.0, f64::max);
        centroids = updated;

        let relabeled = assign(points, &centroids);
        let changed = relabeled != labels;
        labels = relabeled;

        if !changed || shift <= tolerance {
            break;
        }
    }

    let centroids = update_centroids(points, &labels, &centroids, false);
    (centroids, labels, iterations)
}

fn inertia(points: &[Vec<f64>], centroids: &[Vec<f64>], labels: &[usize]) -> f64 {
    points
        .iter()
        .zip(labels)
        .map(|(p, &l)| squared_distance(p, &centroids[l]))
        .sum()
}

/// Drop groups with no members and renumber labels in centroid order
fn compact(centroids: Vec<Vec<f64>>, labels: Vec<usize>) -> (Vec<Vec<f64>>, Vec<usize>) {
    let mut remap = vec![None; centroids.len()];
    let mut kept = Vec::new();

    for (j, centroid) in centroids.into_iter().enumerate() {
        if labels.contains(&j) {
            remap[j] = Some(kept.len());
            kept.push(centroid);
        }
    }

    let labels = labels
        .into_iter()
        .map(|l| remap[l].unwrap_or(0))
        .collect();
    (kept, labels)
}

/// Mean silhouette coefficient over all points (Euclidean distance).
///
/// `None` unless 2 <= number of groups <= points - 1. Points alone in their
/// group score 0.
pub fn silhouette_score(points: &[Vec<f64>], labels: &[usize]) -> Option<f64> {
    let n = points.len();
    let groups = labels.iter().max().map_or(0, |m| m + 1);
    let mut sizes = vec![0usize; groups];
    for &l in labels {
        sizes[l] += 1;
    }
    let distinct = sizes.iter().filter(|&&s| s > 0).count();
    if labels.len() != n || distinct < 2 || distinct >= n {
        return None;
    }

    let mut total = 0.0;
    for i in 0..n {
        let own = labels[i];
        if sizes[own] <= 1 {
            continue;
        }

        let mut sums = vec![0.0; groups];
        for j in 0..n {
            if i != j {
                sums[labels[j]] += squared_distance(&points[i], &points[j]).sqrt();
            }
        }

        let a = sums[own] / (sizes[own] - 1) as f64;
        let b = (0..groups)
            .filter(|&g| g != own && sizes[g] > 0)
            .map(|g| sums[g] / sizes[g] as f64)
            .fold(f64::INFINITY, f64::min);

        let denom = a.max(b);
        if denom > 0.0 {
            total += (b - a) / denom;
        }
    }

    Some(total / n as f64)
}

/// How one candidate group count fared
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterCandidate {
    pub k: usize,
    /// Groups that ended up with members
    pub groups: usize,
    pub silhouette: Option<f64>,
    /// Why the candidate was not scored
    pub skipped: Option<String>,
}

/// Result of a successful benchmark clustering
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkModel {
    pub feature_names: Vec<String>,
    pub standardizer: Standardizer,
    pub kmeans: KMeansModel,
    pub profiles: Vec<BenchmarkProfile>,
    pub silhouette: f64,
    pub candidates: Vec<ClusterCandidate>,
    /// (row index in the input table, group) for every clustered row
    pub assignments: Vec<(usize, usize)>,
    /// Rows dropped for missing feature values
    pub rows_dropped: usize,
}

/// Outcome of benchmark clustering
#[derive(Debug, Clone, PartialEq)]
pub enum ClusteringOutcome {
    Fitted(Box<BenchmarkModel>),
    Unavailable {
        reason: String,
        candidates: Vec<ClusterCandidate>,
    },
}

/// Sweeps candidate group counts and keeps the best-separated grouping
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkClusterer {
    pub k_min: usize,
    pub k_max: usize,
    pub seed: u64,
    pub restarts: usize,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for BenchmarkClusterer {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl BenchmarkClusterer {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            k_min: config.k_min,
            k_max: config.k_max,
            seed: config.seed,
            restarts: config.kmeans_restarts,
            max_iterations: config.kmeans_max_iterations,
            tolerance: config.kmeans_tolerance,
        }
    }

    /// Cluster the rows of `valid` over `features`.
    ///
    /// `valid` is expected to hold benchmark candidates only; rows missing any
    /// feature are dropped first.
    pub fn fit(
        &self,
        valid: &FeatureTable,
        features: &[String],
    ) -> Result<ClusteringOutcome, PipelineError> {
        let complete = valid.complete_rows(features);
        let rows_dropped = valid.len() - complete.len();
        if rows_dropped > 0 {
            tracing::info!(
                "Clustering: dropped {} rows with missing feature values",
                rows_dropped
            );
        }

        if complete.len() < 2 {
            return Ok(ClusteringOutcome::Unavailable {
                reason: format!(
                    "need at least 2 complete rows to cluster, found {}",
                    complete.len()
                ),
                candidates: Vec::new(),
            });
        }

        let raw: Vec<Vec<f64>> = complete.iter().map(|(_, v)| v.clone()).collect();
        let standardizer = Standardizer::fit(features, &raw)?;
        let scaled = standardizer.transform(&raw)?;

        let mut candidates = Vec::new();
        let mut fitted: Vec<(KMeansModel, Vec<usize>, f64)> = Vec::new();

        for k in self.k_min..=self.k_max {
            if k > scaled.len() {
                candidates.push(ClusterCandidate {
                    k,
                    groups: 0,
                    silhouette: None,
                    skipped: Some(format!("only {} rows", scaled.len())),
                });
                continue;
            }

            let config = KMeansConfig {
                k,
                seed: self.seed,
                restarts: self.restarts,
                max_iterations: self.max_iterations,
                tolerance: self.tolerance,
            };
            let (model, labels) = fit_kmeans(&scaled, &config)?;
            let groups = model.k();

            if groups <= 1 {
                candidates.push(ClusterCandidate {
                    k,
                    groups,
                    silhouette: None,
                    skipped: Some("collapsed to a single group".to_string()),
                });
                continue;
            }

            match silhouette_score(&scaled, &labels) {
                Some(score) => {
                    tracing::info!("KMeans with k={}, silhouette={:.3}", k, score);
                    candidates.push(ClusterCandidate {
                        k,
                        groups,
                        silhouette: Some(score),
                        skipped: None,
                    });
                    fitted.push((model, labels, score));
                }
                None => candidates.push(ClusterCandidate {
                    k,
                    groups,
                    silhouette: None,
                    skipped: Some("silhouette undefined: one row per group".to_string()),
                }),
            }
        }

        let scores: Vec<(usize, f64)> = fitted
            .iter()
            .enumerate()
            .map(|(i, (_, _, s))| (i, *s))
            .collect();
        let Some((best_index, silhouette)) = pick_best(&scores) else {
            tracing::info!("Clustering: no valid clustering found");
            return Ok(ClusteringOutcome::Unavailable {
                reason: format!(
                    "no k in {}..={} produced more than one group",
                    self.k_min, self.k_max
                ),
                candidates,
            });
        };

        let (kmeans, labels, _) = fitted.swap_remove(best_index);
        let profiles = build_profiles(&standardizer, &kmeans, &labels)?;
        let assignments = complete
            .iter()
            .zip(&labels)
            .map(|((row, _), &group)| (*row, group))
            .collect();

        tracing::info!(
            "Clustering: selected k={} (silhouette={:.3}) over {} rows",
            kmeans.k(),
            silhouette,
            scaled.len()
        );

        Ok(ClusteringOutcome::Fitted(Box::new(BenchmarkModel {
            feature_names: features.to_vec(),
            standardizer,
            kmeans,
            profiles,
            silhouette,
            candidates,
            assignments,
            rows_dropped,
        })))
    }
}

/// Highest score wins; on equal scores the earlier (smaller k) candidate is kept
pub fn pick_best(scores: &[(usize, f64)]) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for &(index, score) in scores {
        if best.map_or(true, |(_, b)| score > b) {
            best = Some((index, score));
        }
    }
    best
}

fn build_profiles(
    standardizer: &Standardizer,
    kmeans: &KMeansModel,
    labels: &[usize],
) -> Result<Vec<BenchmarkProfile>, PipelineError> {
    kmeans
        .centroids
        .iter()
        .enumerate()
        .map(|(cluster_id, centroid)| {
            Ok(BenchmarkProfile {
                cluster_id,
                size: labels.iter().filter(|&&l| l == cluster_id).count(),
                center: standardizer.inverse_transform_row(centroid)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FeatureRow;
    use std::collections::HashMap;

    fn feature_names() -> Vec<String> {
        vec!["rom_elbow_delta".to_string(), "rom_chest_displacement".to_string()]
    }

    fn table_from_points(points: &[(f64, f64)]) -> FeatureTable {
        let names = feature_names();
        FeatureTable {
            columns: names.clone(),
            rows: points
                .iter()
                .map(|(x, y)| FeatureRow {
                    values: HashMap::from([(names[0].clone(), *x), (names[1].clone(), *y)]),
                    valid_rep: Some(true),
                    ..Default::default()
                })
                .collect(),
        }
    }

    /// Two tight groups far apart; jitter is deterministic
    fn two_groups() -> Vec<(f64, f64)> {
        let mut points = Vec::new();
        for i in 0..20 {
            let jitter = (i as f64 * 1.7).sin() * 0.8;
            let wobble = (i as f64 * 0.9).cos() * 0.8;
            points.push((95.0 + jitter, 45.0 + wobble));
            points.push((40.0 + wobble, 10.0 + jitter));
        }
        points
    }

    fn grid() -> Vec<(f64, f64)> {
        let mut points = Vec::new();
        for i in 0..10 {
            for j in 0..10 {
                points.push((i as f64, j as f64));
            }
        }
        points
    }

    fn fitted(outcome: ClusteringOutcome) -> BenchmarkModel {
        match outcome {
            ClusteringOutcome::Fitted(model) => *model,
            ClusteringOutcome::Unavailable { reason, .. } => {
                panic!("expected a fitted model, got: {}", reason)
            }
        }
    }

    #[test]
    fn test_well_separated_groups() {
        let table = table_from_points(&two_groups());
        let model = fitted(BenchmarkClusterer::default().fit(&table, &feature_names()).unwrap());

        assert_eq!(model.kmeans.k(), 2);
        assert_eq!(model.profiles.len(), 2);
        assert!(model.silhouette > 0.9, "silhouette {}", model.silhouette);
        assert_eq!(model.profiles.iter().map(|p| p.size).sum::<usize>(), 40);
        assert_eq!(model.candidates.len(), 4);
    }

    #[test]
    fn test_centers_match_group_means() {
        let points = two_groups();
        let table = table_from_points(&points);
        let model = fitted(BenchmarkClusterer::default().fit(&table, &feature_names()).unwrap());

        for profile in &model.profiles {
            let members: Vec<&(f64, f64)> = model
                .assignments
                .iter()
                .filter(|(_, group)| *group == profile.cluster_id)
                .map(|(row, _)| &points[*row])
                .collect();
            let n = members.len() as f64;
            let mean_x = members.iter().map(|p| p.0).sum::<f64>() / n;
            let mean_y = members.iter().map(|p| p.1).sum::<f64>() / n;

            assert!((profile.center[0] - mean_x).abs() < 1e-6);
            assert!((profile.center[1] - mean_y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_unstructured_data_scores_low() {
        let table = table_from_points(&grid());
        let model = fitted(BenchmarkClusterer::default().fit(&table, &feature_names()).unwrap());

        assert!(
            model.silhouette < 0.7,
            "uniform grid should not look well separated, got {}",
            model.silhouette
        );
    }

    #[test]
    fn test_identical_rows_are_unavailable() {
        let table = table_from_points(&[(80.0, 30.0); 12]);
        let outcome = BenchmarkClusterer::default().fit(&table, &feature_names()).unwrap();

        match outcome {
            ClusteringOutcome::Unavailable { candidates, .. } => {
                assert_eq!(candidates.len(), 4);
                assert!(candidates.iter().all(|c| c.silhouette.is_none()));
            }
            ClusteringOutcome::Fitted(_) => panic!("identical rows cannot form groups"),
        }
    }

    #[test]
    fn test_rows_with_missing_features_are_dropped() {
        let mut table = table_from_points(&two_groups());
        table.rows[0].values.remove("rom_chest_displacement");
        table.rows[1].values.remove("rom_elbow_delta");

        let model = fitted(BenchmarkClusterer::default().fit(&table, &feature_names()).unwrap());
        assert_eq!(model.rows_dropped, 2);
        assert_eq!(model.assignments.len(), 38);
        assert!(model.assignments.iter().all(|(row, _)| *row >= 2));
    }

    #[test]
    fn test_too_few_rows() {
        let table = table_from_points(&[(1.0, 2.0)]);
        let outcome = BenchmarkClusterer::default().fit(&table, &feature_names()).unwrap();
        assert!(matches!(outcome, ClusteringOutcome::Unavailable { .. }));
    }

    #[test]
    fn test_k_larger_than_rows_is_skipped() {
        let table = table_from_points(&[(0.0, 0.0), (0.1, 0.0), (10.0, 10.0)]);
        let model = fitted(BenchmarkClusterer::default().fit(&table, &feature_names()).unwrap());

        assert_eq!(model.kmeans.k(), 2);
        let skipped: Vec<usize> = model
            .candidates
            .iter()
            .filter(|c| c.skipped.is_some())
            .map(|c| c.k)
            .collect();
        assert_eq!(skipped, vec![3, 4, 5]);
    }

    #[test]
    fn test_fit_is_deterministic() {
        let table = table_from_points(&grid());
        let clusterer = BenchmarkClusterer::default();
        let a = fitted(clusterer.fit(&table, &feature_names()).unwrap());
        let b = fitted(clusterer.fit(&table, &feature_names()).unwrap());

        assert_eq!(a.kmeans, b.kmeans);
        assert_eq!(a.assignments, b.assignments);
    }

    #[test]
    fn test_pick_best_prefers_smaller_k_on_tie() {
        assert_eq!(pick_best(&[]), None);
        assert_eq!(pick_best(&[(0, 0.5), (1, 0.8), (2, 0.8)]), Some((1, 0.8)));
        assert_eq!(pick_best(&[(0, -0.2), (1, -0.1)]), Some((1, -0.1)));
    }

    #[test]
    fn test_silhouette_known_values() {
        let points = vec![vec![0.0], vec![1.0], vec![10.0], vec![11.0]];
        let score = silhouette_score(&points, &[0, 0, 1, 1]).unwrap();
        // outer points: a = 1, b = 10.5; inner points: a = 1, b = 9.5
        let expected = (2.0 * (9.5 / 10.5) + 2.0 * (8.5 / 9.5)) / 4.0;
        assert!((score - expected).abs() < 1e-12);

        assert_eq!(silhouette_score(&points, &[0, 0, 0, 0]), None);
        assert_eq!(silhouette_score(&points, &[0, 1, 2, 3]), None);
    }

    #[test]
    fn test_singleton_group_scores_zero() {
        let points = vec![vec![0.0], vec![1.0], vec![5.0]];
        let score = silhouette_score(&points, &[0, 0, 1]).unwrap();
        // point 0: a = 1, b = 5; point 1: a = 1, b = 4; point 2 alone = 0
        let expected = (0.8 + 0.75 + 0.0) / 3.0;
        assert!((score - expected).abs() < 1e-12);
    }

    #[test]
    fn test_kmeans_rejects_bad_k() {
        let points = vec![vec![0.0], vec![1.0]];
        let config = KMeansConfig {
            k: 3,
            seed: 42,
            restarts: 1,
            max_iterations: 10,
            tolerance: 1e-4,
        };
        assert!(fit_kmeans(&points, &config).is_err());
    }

    #[test]
    fn test_kmeans_nearest() {
        let model = KMeansModel {
            centroids: vec![vec![0.0, 0.0], vec![3.0, 4.0]],
            inertia: 0.0,
            iterations: 1,
            requested_k: 2,
            seed: 42,
        };
        assert_eq!(model.nearest(&[3.0, 3.0]), (1, 1.0));
        assert_eq!(model.predict(&[0.5, 0.0]), 0);
    }
}
