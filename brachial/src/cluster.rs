//! Point-cloud summarization: k-means centers plus a binary proximity graph
//! describing which clusters touch.

use nalgebra::{DMatrix, Vector3};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tracing::debug;

use crate::cloud::PointCloud;
use crate::kmeans::kmeans;

/// Clusters the current point cloud into `k` centers and connects the means
/// into an undirected graph. Buffers are reused between frames.
pub struct Clusterer {
    k: usize,
    points: Vec<Vector3<f32>>,
    /// Cluster id per cloud row, in `[0, k)`.
    pub labels: Vec<i32>,
    /// One row per cluster center.
    pub centers: Vec<Vector3<f32>>,
    /// Symmetric adjacency over centers; entries are 0 or 1 after
    /// [`Clusterer::connect_means`], with a zero diagonal.
    pub adj: DMatrix<f32>,
    rng: SmallRng,
}

impl Clusterer {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            points: Vec::new(),
            labels: Vec::new(),
            centers: Vec::new(),
            adj: DMatrix::zeros(k, k),
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Attaches a fresh cloud. Call this each time the source cloud is
    /// rebuilt, before clustering. The rows are copied so the cloud stays
    /// free to be cleared for the next frame.
    pub fn update_point_cloud(&mut self, cloud: &PointCloud) {
        self.points.clear();
        self.points.extend_from_slice(cloud.points());
        self.labels.resize(self.points.len(), 0);
    }

    /// Runs k-means over the attached cloud. Returns `false` without touching
    /// the centers when the cloud has fewer rows than `k`.
    pub fn cluster(&mut self, attempts: usize, max_iter: usize, epsilon: f64) -> bool {
        if self.points.len() < self.k {
            debug!(
                rows = self.points.len(),
                k = self.k,
                "not enough points to cluster"
            );
            self.labels.clear();
            return false;
        }

        let result = kmeans(
            &self.points,
            self.k,
            attempts,
            max_iter,
            epsilon,
            &mut self.rng,
        );
        self.centers = result.centers;
        self.labels = result.labels;
        true
    }

    /// Builds the proximity graph over the cluster centers.
    ///
    /// Every point votes `1/Δ` into the edge between its home cluster and
    /// each other cluster, where `Δ` is how much farther the other center is;
    /// near-equidistant (boundary) points dominate. The votes are then
    /// normalized by the cluster population histogram and binarized against
    /// `threshold`.
    pub fn connect_means(&mut self, threshold: f32) {
        let k = self.k;
        self.adj.fill(0.0);
        let mut histogram = vec![0.0f32; k];

        for (i, p) in self.points.iter().enumerate() {
            let home = self.labels[i] as usize;
            let home_dist = (self.centers[home] - p).norm();
            histogram[home] += 1.0;

            for c in 0..k {
                if c == home {
                    continue;
                }
                let delta = ((self.centers[c] - p).norm() - home_dist).abs();
                let weight = 1.0 / delta;
                self.adj[(c, home)] += weight;
                self.adj[(home, c)] = self.adj[(c, home)];
            }
        }

        // density compensation; an empty cluster gets a zero row and column
        // (it has no boundary to speak of)
        for i in 0..k {
            for j in 0..k {
                let h = histogram[i] * histogram[j];
                self.adj[(i, j)] = if h > 0.0 { self.adj[(i, j)] / h } else { 0.0 };
            }
        }

        // binarize the upper triangle, mirror it, clear the diagonal
        for r in 0..k {
            for c in (r + 1)..k {
                let connected = if self.adj[(r, c)] > threshold { 1.0 } else { 0.0 };
                self.adj[(r, c)] = connected;
                self.adj[(c, r)] = connected;
            }
            self.adj[(r, r)] = 0.0;
        }
    }

    /// Whether centers `a` and `b` share an edge in the thresholded graph.
    pub fn connected(&self, a: usize, b: usize) -> bool {
        self.adj[(a, b)] != 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_cloud(centers: &[Vector3<f32>], spread: f32, per_cluster: usize) -> PointCloud {
        let mut cloud = PointCloud::new();
        let side = (per_cluster as f32).sqrt().ceil() as usize;
        for center in centers {
            for i in 0..per_cluster {
                let dx = (i % side) as f32 / side as f32 - 0.5;
                let dy = (i / side) as f32 / side as f32 - 0.5;
                cloud.add_point(center + Vector3::new(dx * spread, dy * spread, 0.0));
            }
        }
        cloud
    }

    #[test]
    fn test_insufficient_data_clears_labels() {
        let mut clusterer = Clusterer::new(30);
        let cloud = grid_cloud(&[Vector3::zeros()], 0.1, 10);
        clusterer.update_point_cloud(&cloud);
        assert!(!clusterer.cluster(2, 10, 0.002));
        assert!(clusterer.labels.is_empty());
    }

    #[test]
    fn test_adjacency_is_symmetric_binary_with_zero_diagonal() {
        let truth = [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
        ];
        let cloud = grid_cloud(&truth, 0.06, 100);
        let mut clusterer = Clusterer::new(3);
        clusterer.update_point_cloud(&cloud);
        assert!(clusterer.cluster(4, 50, 1e-4));
        clusterer.connect_means(0.25);

        for r in 0..3 {
            assert_eq!(clusterer.adj[(r, r)], 0.0);
            for c in 0..3 {
                assert_eq!(clusterer.adj[(r, c)], clusterer.adj[(c, r)]);
                let v = clusterer.adj[(r, c)];
                assert!(v == 0.0 || v == 1.0);
            }
        }
    }

    #[test]
    fn test_abutting_segments_connect_but_distant_blob_does_not() {
        // a line of 40 points that k-means halves into two touching segments,
        // plus a tight blob far away in y
        let mut cloud = PointCloud::new();
        for i in 0..40 {
            let x = 0.0125 + i as f32 * 0.025;
            cloud.add_point(Vector3::new(x, 0.0, 0.0));
        }
        for i in 0..20 {
            cloud.add_point(Vector3::new(0.5, 10.0 + (i % 5) as f32 * 0.002, 0.0));
        }

        let mut clusterer = Clusterer::new(3);
        clusterer.update_point_cloud(&cloud);
        assert!(clusterer.cluster(4, 50, 1e-4));
        clusterer.connect_means(0.25);

        // identify the far blob's cluster through a member point
        let far_label = clusterer.labels[45] as usize;
        let segments: Vec<usize> = (0..3).filter(|&c| c != far_label).collect();

        assert!(clusterer.connected(segments[0], segments[1]));
        assert!(!clusterer.connected(far_label, segments[0]));
        assert!(!clusterer.connected(far_label, segments[1]));
    }
}
