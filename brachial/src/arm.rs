//! Arm tracing over the cluster proximity graph.
//!
//! Knowing roughly where a hand is removes most degrees of freedom from the
//! skeleton: the cluster center nearest the seed position is the hand, and
//! walking the graph away from the camera (up in z) recovers the chain of
//! clusters along the arm, ending at the shoulder.

use nalgebra::{DMatrix, Vector3};

/// Tracks one arm across frames. Construct one per arm with its world-frame
/// seed position; the horizontal walking direction is inferred from the sign
/// of the seed's x coordinate.
pub struct Arm {
    seed: Vector3<f32>,
    max_dist_to_start: f32,
    dxdz_threshold: f32,
    /// +1 walks toward +x, -1 toward -x.
    orientation: f32,
    max_missed_steps: u64,
    kmean_ind: Vec<usize>,
    elbow_kmean_ind: Option<usize>,
    tracking_step: u64,
    last_tracked_step: Option<u64>,
    hand_loc: Vector3<f32>,
    elbow_loc: Vector3<f32>,
    shoulder_loc: Vector3<f32>,
}

impl Arm {
    /// `max_dist_to_start` bounds the seed-to-hand search radius;
    /// `dxdz_threshold` terminates the shoulder walk when the lateral slope
    /// gets too steep; `max_missed_steps` is the grace window (in frames)
    /// before the smoothed state is considered stale.
    pub fn new(
        seed: Vector3<f32>,
        max_dist_to_start: f32,
        dxdz_threshold: f32,
        max_missed_steps: u64,
    ) -> Self {
        let orientation = if seed.x < 0.0 { 1.0 } else { -1.0 };
        Self {
            seed,
            max_dist_to_start,
            dxdz_threshold,
            orientation,
            max_missed_steps,
            kmean_ind: Vec::new(),
            elbow_kmean_ind: None,
            tracking_step: 0,
            last_tracked_step: None,
            hand_loc: Vector3::zeros(),
            elbow_loc: Vector3::zeros(),
            shoulder_loc: Vector3::zeros(),
        }
    }

    /// Smoothed joint locations, valid while the arm reports tracked.
    pub fn hand_loc(&self) -> Vector3<f32> {
        self.hand_loc
    }

    pub fn elbow_loc(&self) -> Vector3<f32> {
        self.elbow_loc
    }

    pub fn shoulder_loc(&self) -> Vector3<f32> {
        self.shoulder_loc
    }

    /// Cluster indices along the arm, hand at the front, shoulder at the back.
    pub fn kmean_ind(&self) -> &[usize] {
        &self.kmean_ind
    }

    pub fn elbow_kmean_ind(&self) -> Option<usize> {
        self.elbow_kmean_ind
    }

    /// Angle at the elbow between the forearm and the upper arm, in degrees.
    /// A straight arm reads close to 180.
    pub fn bend_angle(&self) -> f32 {
        let forearm = self.hand_loc - self.elbow_loc;
        let upper_arm = self.shoulder_loc - self.elbow_loc;
        let denom = forearm.norm() * upper_arm.norm();
        if denom <= f32::EPSILON {
            return 0.0;
        }
        (forearm.dot(&upper_arm) / denom)
            .clamp(-1.0, 1.0)
            .acos()
            .to_degrees()
    }

    /// Runs one frame of arm tracking against the cluster centers and their
    /// thresholded adjacency. Returns whether the arm is currently tracked:
    /// either updated this frame, or still inside the grace window after a
    /// recent success.
    pub fn update_joints(
        &mut self,
        centers: &[Vector3<f32>],
        adj: &DMatrix<f32>,
        smoothing_factor: f32,
    ) -> bool {
        self.tracking_step += 1;
        self.kmean_ind.clear();
        self.elbow_kmean_ind = None;

        let Some(hand) = self.find_closest_center_hand(centers) else {
            return self.in_grace_window();
        };
        self.trace_chain(centers, adj, hand);
        if self.kmean_ind.len() < 3 {
            return self.in_grace_window();
        }

        let hand = self.kmean_ind[0];
        let shoulder = self.kmean_ind[self.kmean_ind.len() - 1];
        let Some(elbow) = self.pick_elbow(centers) else {
            return self.in_grace_window();
        };
        self.elbow_kmean_ind = Some(elbow);

        let gap = match self.last_tracked_step {
            Some(step) => self.tracking_step - step,
            None => u64::MAX,
        };
        if gap > self.max_missed_steps {
            // lost for too long; snap to the new detection instead of
            // dragging the stale locations across the scene
            self.hand_loc = centers[hand];
            self.elbow_loc = centers[elbow];
            self.shoulder_loc = centers[shoulder];
        } else {
            let t = smoothing_factor;
            self.hand_loc = self.hand_loc * (1.0 - t) + centers[hand] * t;
            self.elbow_loc = self.elbow_loc * (1.0 - t) + centers[elbow] * t;
            self.shoulder_loc = self.shoulder_loc * (1.0 - t) + centers[shoulder] * t;
        }
        self.last_tracked_step = Some(self.tracking_step);
        true
    }

    fn in_grace_window(&self) -> bool {
        match self.last_tracked_step {
            Some(step) => self.tracking_step - step <= self.max_missed_steps,
            None => false,
        }
    }

    /// The center closest to the seed position among those at least as far
    /// from the camera plane (`z >= seed.z`), within the search radius.
    fn find_closest_center_hand(&self, centers: &[Vector3<f32>]) -> Option<usize> {
        let mut closest: Option<(usize, f32)> = None;
        for (i, center) in centers.iter().enumerate() {
            if center.z < self.seed.z {
                continue;
            }
            let dist = (center - self.seed).norm();
            if dist > self.max_dist_to_start {
                continue;
            }
            if closest.map_or(true, |(_, best)| dist < best) {
                closest = Some((i, dist));
            }
        }
        closest.map(|(i, _)| i)
    }

    /// Walks the graph from the hand toward the shoulder: always step to a
    /// strictly-greater-z neighbor, preferring the one farthest outward in
    /// the arm's direction, and stop when the lateral slope dx/dz crosses the
    /// threshold (the next cluster is likely off the arm).
    fn trace_chain(&mut self, centers: &[Vector3<f32>], adj: &DMatrix<f32>, hand: usize) {
        self.kmean_ind.push(hand);
        let mut cur = hand;
        let mut x_last = centers[hand].x;
        let mut z_last = centers[hand].z;

        loop {
            let mut next: Option<usize> = None;
            let mut best_reach = f32::NEG_INFINITY;
            for n in 0..centers.len() {
                if adj[(cur, n)] == 0.0 || centers[n].z <= centers[cur].z {
                    continue;
                }
                let reach = -self.orientation * centers[n].x;
                if reach > best_reach {
                    best_reach = reach;
                    next = Some(n);
                }
            }
            let Some(n) = next else { break };

            let (x_cur, z_cur) = (centers[n].x, centers[n].z);
            let dxdz = self.orientation * (x_cur - x_last) / (z_cur - z_last);
            if dxdz.abs() >= self.dxdz_threshold {
                break;
            }

            self.kmean_ind.push(n);
            cur = n;
            x_last = x_cur;
            z_last = z_cur;
        }
    }

    /// The chain entry farthest from both endpoints: maximize the product of
    /// the distances to the hand and to the shoulder. Endpoints score zero,
    /// so any chain of three or more yields an interior elbow.
    fn pick_elbow(&self, centers: &[Vector3<f32>]) -> Option<usize> {
        let hand = centers[*self.kmean_ind.first()?];
        let shoulder = centers[*self.kmean_ind.last()?];
        let mut best: Option<usize> = None;
        let mut best_score = -1.0f32;
        for &i in &self.kmean_ind {
            let score = (centers[i] - hand).norm() * (centers[i] - shoulder).norm();
            if score > best_score {
                best_score = score;
                best = Some(i);
            }
        }
        best
    }
}
