//! k-means over 3D point clouds with k-means++ seeding.

use nalgebra::Vector3;
use rand::rngs::SmallRng;
use rand::Rng;

pub struct KmeansResult {
    pub centers: Vec<Vector3<f32>>,
    pub labels: Vec<i32>,
    /// Sum of squared distances of every point to its assigned center.
    pub compactness: f64,
}

/// Runs k-means with `attempts` independent k-means++ starts, keeping the
/// best result by compactness. Each start iterates until `max_iter` passes
/// or until the largest center movement drops below `epsilon`.
///
/// The caller must guarantee `1 <= k <= points.len()`.
pub fn kmeans(
    points: &[Vector3<f32>],
    k: usize,
    attempts: usize,
    max_iter: usize,
    epsilon: f64,
    rng: &mut SmallRng,
) -> KmeansResult {
    debug_assert!(k >= 1 && k <= points.len());

    let mut best: Option<KmeansResult> = None;
    for _ in 0..attempts.max(1) {
        let mut centers = seed_plus_plus(points, k, rng);
        let mut labels = vec![0i32; points.len()];

        for _ in 0..max_iter.max(1) {
            assign_labels(points, &centers, &mut labels);
            let movement = update_centers(points, &mut labels, &mut centers);
            if movement < epsilon {
                break;
            }
        }
        // the final update may have nudged centers after the last assignment
        assign_labels(points, &centers, &mut labels);

        let compactness = points
            .iter()
            .zip(labels.iter())
            .map(|(p, &label)| (p - centers[label as usize]).norm_squared() as f64)
            .sum();

        if best
            .as_ref()
            .map_or(true, |prev| compactness < prev.compactness)
        {
            best = Some(KmeansResult {
                centers,
                labels,
                compactness,
            });
        }
    }

    best.unwrap_or_else(|| unreachable!("attempts is at least 1"))
}

/// k-means++: each successive seed is chosen with probability proportional to
/// its squared distance from the nearest already-chosen seed.
fn seed_plus_plus(points: &[Vector3<f32>], k: usize, rng: &mut SmallRng) -> Vec<Vector3<f32>> {
    let mut centers = Vec::with_capacity(k);
    centers.push(points[rng.gen_range(0..points.len())]);

    let mut dist_sq: Vec<f32> = points
        .iter()
        .map(|p| (p - centers[0]).norm_squared())
        .collect();

    while centers.len() < k {
        let total: f32 = dist_sq.iter().sum();
        let chosen = if total <= f32::EPSILON {
            // all remaining mass is on already-chosen points
            rng.gen_range(0..points.len())
        } else {
            let mut target = rng.gen::<f32>() * total;
            let mut index = points.len() - 1;
            for (i, &weight) in dist_sq.iter().enumerate() {
                if target <= weight {
                    index = i;
                    break;
                }
                target -= weight;
            }
            index
        };

        let center = points[chosen];
        centers.push(center);
        for (i, p) in points.iter().enumerate() {
            let d = (p - center).norm_squared();
            if d < dist_sq[i] {
                dist_sq[i] = d;
            }
        }
    }

    centers
}

fn assign_labels(points: &[Vector3<f32>], centers: &[Vector3<f32>], labels: &mut [i32]) {
    for (p, label) in points.iter().zip(labels.iter_mut()) {
        let mut best = 0;
        let mut best_dist = f32::MAX;
        for (c, center) in centers.iter().enumerate() {
            let d = (p - center).norm_squared();
            if d < best_dist {
                best_dist = d;
                best = c;
            }
        }
        *label = best as i32;
    }
}

/// Recomputes each center as the mean of its assigned points and returns the
/// largest center movement. A cluster left empty steals the point farthest
/// from its center within the currently largest cluster.
fn update_centers(
    points: &[Vector3<f32>],
    labels: &mut [i32],
    centers: &mut [Vector3<f32>],
) -> f64 {
    let k = centers.len();
    let mut sums = vec![Vector3::<f32>::zeros(); k];
    let mut counts = vec![0usize; k];
    for (p, &label) in points.iter().zip(labels.iter()) {
        sums[label as usize] += p;
        counts[label as usize] += 1;
    }

    for empty in 0..k {
        if counts[empty] != 0 {
            continue;
        }
        let largest = (0..k).max_by_key(|&c| counts[c]).unwrap_or(0);
        let farthest = points
            .iter()
            .enumerate()
            .filter(|(i, _)| labels[*i] as usize == largest)
            .max_by(|(_, a), (_, b)| {
                let da = (*a - centers[largest]).norm_squared();
                let db = (*b - centers[largest]).norm_squared();
                da.total_cmp(&db)
            })
            .map(|(i, _)| i);
        let Some(farthest) = farthest else { continue };
        labels[farthest] = empty as i32;
        sums[largest] -= points[farthest];
        counts[largest] -= 1;
        sums[empty] += points[farthest];
        counts[empty] += 1;
    }

    let mut movement = 0.0f64;
    for c in 0..k {
        if counts[c] == 0 {
            continue;
        }
        let new_center = sums[c] / counts[c] as f32;
        movement = movement.max((new_center - centers[c]).norm() as f64);
        centers[c] = new_center;
    }
    movement
}
