//! Foreground isolation: keep only the largest depth-connected region of a
//! frame and zero out everything else.
//!
//! Depth frames are downsampled first with an area average over source boxes.
//! No-data zeros are excluded from the average since mixing them in would
//! fabricate geometry between the subject and the background; a box with no
//! valid samples stays 0.

use std::collections::VecDeque;

use image::GrayImage;

/// Sentinel stamped into the cluster map for pixels of the winning component.
pub const FOREGROUND: i32 = 50000;

/// Borrowed view of the segmenter's output, valid until the next frame.
pub struct SegmentedFrame<'a> {
    pub width: usize,
    pub height: usize,
    /// [`FOREGROUND`] where the largest component was retained, 0 elsewhere.
    pub cluster_map: &'a [i32],
    /// The downsampled depth grid with its original values intact, so that
    /// retained pixels can still be deprojected.
    pub depth: &'a [u16],
    /// Pixel count of the retained component.
    pub retained: usize,
}

impl SegmentedFrame<'_> {
    /// Iterates over `(x, y, depth)` of every retained pixel.
    pub fn retained_pixels(&self) -> impl Iterator<Item = (usize, usize, u16)> + '_ {
        let width = self.width;
        self.cluster_map
            .iter()
            .zip(self.depth.iter())
            .enumerate()
            .filter_map(move |(i, (&id, &d))| {
                (id == FOREGROUND && d != 0).then_some((i % width, i / width, d))
            })
    }

    /// Renders the retained mask as an 8-bit image for debugging consumers.
    pub fn mask_image(&self) -> GrayImage {
        GrayImage::from_fn(self.width as u32, self.height as u32, |x, y| {
            let id = self.cluster_map[y as usize * self.width + x as usize];
            image::Luma([if id == FOREGROUND { 255 } else { 0 }])
        })
    }
}

/// Reduces a raw depth image to its largest depth-connected region.
///
/// Connectivity is a non-recursive breadth-first flood fill: a neighbor within
/// the Manhattan radius joins the component when its depth is within
/// `max_dist` meters of its *parent* pixel (the one popped from the queue),
/// which follows smoothly curved surfaces while still cutting across depth
/// discontinuities. Visited pixels are zeroed in the working grid, so the
/// grid doubles as the visited set.
pub struct FrameSegmenter {
    scale_factor: f32,
    max_dist: f32,
    manhattan: usize,
    width: usize,
    height: usize,
    scaled: Vec<u16>,
    work: Vec<u16>,
    cluster_map: Vec<i32>,
    sums: Vec<u32>,
    counts: Vec<u32>,
    queue: VecDeque<(usize, usize, u16)>,
}

impl FrameSegmenter {
    /// `scale_factor` in (0, 1] downsamples the frame before segmentation;
    /// `max_dist` is the per-step depth tolerance in meters; `manhattan` is
    /// the neighborhood radius in pixels.
    pub fn new(scale_factor: f32, max_dist: f32, manhattan: usize) -> Self {
        Self {
            scale_factor,
            max_dist,
            manhattan,
            width: 0,
            height: 0,
            scaled: Vec::new(),
            work: Vec::new(),
            cluster_map: Vec::new(),
            sums: Vec::new(),
            counts: Vec::new(),
            queue: VecDeque::new(),
        }
    }

    /// Segments one frame. `src` is row-major `src_width × src_height`.
    pub fn segment(
        &mut self,
        src: &[u16],
        src_width: usize,
        src_height: usize,
        depth_scale: f32,
    ) -> SegmentedFrame<'_> {
        debug_assert_eq!(src.len(), src_width * src_height);
        self.downsample(src, src_width, src_height);

        let (width, height) = (self.width, self.height);
        self.work.clear();
        self.work.extend_from_slice(&self.scaled);
        self.cluster_map.clear();
        self.cluster_map.resize(width * height, -1);

        let mut largest_id = -1;
        let mut largest_area = 0usize;
        let mut next_id = 0;
        for y in 0..height {
            for x in 0..width {
                if self.work[y * width + x] == 0 {
                    continue;
                }
                let area = self.flood(x, y, next_id, depth_scale);
                if area > largest_area {
                    largest_area = area;
                    largest_id = next_id;
                }
                next_id += 1;
            }
        }

        for id in &mut self.cluster_map {
            *id = if *id == largest_id && largest_id >= 0 {
                FOREGROUND
            } else {
                0
            };
        }

        SegmentedFrame {
            width,
            height,
            cluster_map: &self.cluster_map,
            depth: &self.scaled,
            retained: if largest_id >= 0 { largest_area } else { 0 },
        }
    }

    fn downsample(&mut self, src: &[u16], src_width: usize, src_height: usize) {
        let width = ((src_width as f32 * self.scale_factor).round() as usize).max(1);
        let height = ((src_height as f32 * self.scale_factor).round() as usize).max(1);
        self.width = width;
        self.height = height;

        self.sums.clear();
        self.sums.resize(width * height, 0);
        self.counts.clear();
        self.counts.resize(width * height, 0);

        for y in 0..src_height {
            let oy = (y * height / src_height).min(height - 1);
            for x in 0..src_width {
                let d = src[y * src_width + x];
                if d == 0 {
                    continue;
                }
                let ox = (x * width / src_width).min(width - 1);
                self.sums[oy * width + ox] += d as u32;
                self.counts[oy * width + ox] += 1;
            }
        }

        self.scaled.clear();
        self.scaled.extend(
            self.sums
                .iter()
                .zip(self.counts.iter())
                .map(|(&sum, &count)| if count == 0 { 0 } else { (sum / count) as u16 }),
        );
    }

    fn flood(&mut self, x: usize, y: usize, id: i32, depth_scale: f32) -> usize {
        let (width, height) = (self.width, self.height);
        let manhattan = self.manhattan;

        let seed_depth = self.work[y * width + x];
        self.work[y * width + x] = 0;
        self.cluster_map[y * width + x] = id;
        self.queue.clear();
        self.queue.push_back((x, y, seed_depth));
        let mut area = 1usize;

        while let Some((cx, cy, center_depth)) = self.queue.pop_front() {
            let y_lo = cy.saturating_sub(manhattan);
            let y_hi = (cy + manhattan).min(height - 1);
            for ny in y_lo..=y_hi {
                // horizontal budget left after spending |dy| of the radius
                let dx_lim = manhattan - ny.abs_diff(cy);
                let x_lo = cx.saturating_sub(dx_lim);
                let x_hi = (cx + dx_lim).min(width - 1);
                for nx in x_lo..=x_hi {
                    let i = ny * width + nx;
                    let d = self.work[i];
                    if d == 0 {
                        continue;
                    }
                    if d.abs_diff(center_depth) as f32 * depth_scale > self.max_dist {
                        continue;
                    }
                    self.work[i] = 0;
                    self.cluster_map[i] = id;
                    self.queue.push_back((nx, ny, d));
                    area += 1;
                }
            }
        }

        area
    }
}
