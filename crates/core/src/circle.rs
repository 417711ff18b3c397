//! SocialCircle and PhysicalCircle context descriptors.
//!
//! Both circles split the plane around the target's last observed position
//! into `partitions` equal angular sectors, measured from the target's
//! observed heading when rotation preprocessing is on. Each sector gets a
//! handful of scalar factors; rows are zero-padded up to `obs_frames` so the
//! circle can be encoded like a trajectory.
//!
//! The factors are non-differentiable functions of the raw inputs, so they
//! are computed on the CPU and returned as constant tensors.

use std::f32::consts::TAU;

use candle_core::{Device, Result, Tensor};

use traj_common::{ModelConfig, PADDING_THRESHOLD};

/// Obstacle cells are those with a segmentation value at or above this.
const OBSTACLE_THRESHOLD: f32 = 0.5;

/// Wrap an angle into `[0, 2π)`.
fn wrap(angle: f32) -> f32 {
    let a = angle.rem_euclid(TAU);
    if a >= TAU { 0.0 } else { a }
}

fn sector(angle: f32, partitions: usize) -> usize {
    ((angle / (TAU / partitions as f32)) as usize).min(partitions - 1)
}

fn is_padding(p: &[f32]) -> bool {
    p.iter().any(|v| v.abs() > PADDING_THRESHOLD)
}

/// Per-sample heading offsets (zero without rotation).
fn offsets(angles: Option<&[f32]>, batch: usize) -> Vec<f32> {
    match angles {
        Some(a) => a.to_vec(),
        None => vec![0.0; batch],
    }
}

// ── SocialCircle ────────────────────────────────────────────────────────────

/// Neighbour-interaction descriptor.
///
/// Per sector, averaged over the valid neighbours falling in it:
///
/// | factor | value |
/// |--------|-------|
/// | velocity | neighbour travel length (÷ target travel if `rel_speed`) |
/// | distance | distance between last observed positions |
/// | direction | bearing of the neighbour seen from the target |
/// | move direction | heading of the neighbour's own motion |
#[derive(Debug, Clone)]
pub struct SocialCircleLayer {
    partitions: usize,
    max_partitions: usize,
    use_velocity: bool,
    use_distance: bool,
    use_direction: bool,
    rel_speed: bool,
    use_move_direction: bool,
}

impl SocialCircleLayer {
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            partitions: config.partitions.max(1),
            max_partitions: config.obs_frames.max(config.partitions),
            use_velocity: config.use_velocity,
            use_distance: config.use_distance,
            use_direction: config.use_direction,
            rel_speed: config.rel_speed,
            use_move_direction: config.use_move_direction,
        }
    }

    /// Factors per sector.
    pub fn dim(&self) -> usize {
        [
            self.use_velocity,
            self.use_distance,
            self.use_direction,
            self.use_move_direction,
        ]
        .iter()
        .filter(|b| **b)
        .count()
    }

    /// `obs`: raw `(b, T, 2)`, `nei`: raw `(b, N, T, 2)`.
    ///
    /// Returns the circle `(b, max_partitions, dim)` and the neighbour
    /// bearings `(b, N)` (0 for padded neighbours).
    pub fn forward(
        &self,
        obs: &Tensor,
        nei: &Tensor,
        angles: Option<&[f32]>,
    ) -> Result<(Tensor, Tensor)> {
        let device = obs.device().clone();
        let obs = obs.to_device(&Device::Cpu)?.to_vec3::<f32>()?;
        let (b, n, t, _) = nei.dims4()?;
        let nei = nei.to_device(&Device::Cpu)?.flatten_all()?.to_vec1::<f32>()?;
        let offsets = offsets(angles, b);

        let p = self.partitions;
        let dim = self.dim();
        let mut circle = vec![0f32; b * self.max_partitions * dim];
        let mut bearings = vec![0f32; b * n];

        for s in 0..b {
            let first = &obs[s][0];
            let last = &obs[s][t - 1];
            let own_travel = ((last[0] - first[0]).powi(2) + (last[1] - first[1]).powi(2)).sqrt();

            // velocity, distance, direction, move direction, count
            let mut acc = vec![[0f32; 5]; p];
            for j in 0..n {
                let base = (s * n + j) * t * 2;
                let n_first = &nei[base..base + 2];
                let n_last = &nei[base + (t - 1) * 2..base + t * 2];
                if is_padding(n_first) || is_padding(n_last) {
                    continue;
                }
                let (mx, my) = (n_last[0] - n_first[0], n_last[1] - n_first[1]);
                let (px, py) = (n_last[0] - last[0], n_last[1] - last[1]);

                let mut velocity = (mx * mx + my * my).sqrt();
                if self.rel_speed {
                    velocity /= own_travel + 1e-4;
                }
                let distance = (px * px + py * py).sqrt();
                let direction = wrap(py.atan2(px) - offsets[s]);
                let move_direction = wrap(my.atan2(mx) - offsets[s]);
                bearings[s * n + j] = direction;

                let a = &mut acc[sector(direction, p)];
                a[0] += velocity;
                a[1] += distance;
                a[2] += direction;
                a[3] += move_direction;
                a[4] += 1.0;
            }

            for (k, a) in acc.iter().enumerate() {
                if a[4] == 0.0 {
                    continue;
                }
                let row = (s * self.max_partitions + k) * dim;
                let factors = [
                    (self.use_velocity, a[0]),
                    (self.use_distance, a[1]),
                    (self.use_direction, a[2]),
                    (self.use_move_direction, a[3]),
                ];
                for (f, (_, sum)) in factors.iter().filter(|(on, _)| *on).enumerate() {
                    circle[row + f] = sum / a[4];
                }
            }
        }

        let circle = Tensor::from_vec(circle, (b, self.max_partitions, dim), &device)?;
        let bearings = Tensor::from_vec(bearings, (b, n), &device)?;
        Ok((circle, bearings))
    }
}

// ── PhysicalCircle ──────────────────────────────────────────────────────────

/// Scene-obstacle descriptor built from a segmentation map.
///
/// Map parameters are `[W0, W1, b0, b1]`: cell `(i, j)` covers world point
/// `((i - b0) / W0, (j - b1) / W1)`. Per sector, inside the vision radius:
/// obstacle size (fraction of occupied cells), nearest obstacle distance
/// (the radius when the sector is clear) and mean obstacle direction.
#[derive(Debug, Clone)]
pub struct PhysicalCircleLayer {
    partitions: usize,
    max_partitions: usize,
    vision_radius: f32,
}

impl PhysicalCircleLayer {
    pub const DIM: usize = 3;

    pub fn new(config: &ModelConfig) -> Self {
        Self {
            partitions: config.partitions.max(1),
            max_partitions: config.obs_frames.max(config.partitions),
            vision_radius: config.vision_radius,
        }
    }

    pub fn dim(&self) -> usize {
        Self::DIM
    }

    /// `seg_maps`: `(b, h, w)`, `paras`: `(b, 4)`, `obs`: raw `(b, T, 2)`.
    /// Returns `(b, max_partitions, 3)`.
    pub fn forward(
        &self,
        seg_maps: &Tensor,
        paras: &Tensor,
        obs: &Tensor,
        angles: Option<&[f32]>,
    ) -> Result<Tensor> {
        let device = obs.device().clone();
        let (b, h, w) = seg_maps.dims3()?;
        let maps = seg_maps.to_device(&Device::Cpu)?.flatten_all()?.to_vec1::<f32>()?;
        let paras = paras.to_device(&Device::Cpu)?.to_vec2::<f32>()?;
        let obs = obs.to_device(&Device::Cpu)?.to_vec3::<f32>()?;
        let offsets = offsets(angles, b);

        let p = self.partitions;
        let mut circle = vec![0f32; b * self.max_partitions * Self::DIM];

        for s in 0..b {
            let t = obs[s].len();
            let (first, last) = (&obs[s][0], &obs[s][t - 1]);
            let travel = ((last[0] - first[0]).powi(2) + (last[1] - first[1]).powi(2)).sqrt();
            let radius = (self.vision_radius * travel).max(self.vision_radius);

            let [w0, w1, b0, b1] = [paras[s][0], paras[s][1], paras[s][2], paras[s][3]];
            if w0 <= 0.0 || w1 <= 0.0 {
                return Err(candle_core::Error::Msg(format!(
                    "invalid map parameters {:?}",
                    paras[s]
                )));
            }
            let cell_range = |centre: f32, scale: f32, bias: f32, limit: usize| {
                let lo = ((centre - radius) * scale + bias).floor().max(0.0) as usize;
                let hi = ((centre + radius) * scale + bias).ceil().max(0.0) as usize;
                lo.min(limit)..(hi + 1).min(limit)
            };

            // cells, obstacles, min distance, direction sum
            let mut acc = vec![[0f32, 0.0, radius, 0.0]; p];
            let map = &maps[s * h * w..(s + 1) * h * w];
            for i in cell_range(last[0], w0, b0, h) {
                let x = (i as f32 - b0) / w0;
                for j in cell_range(last[1], w1, b1, w) {
                    let y = (j as f32 - b1) / w1;
                    let (dx, dy) = (x - last[0], y - last[1]);
                    let d = (dx * dx + dy * dy).sqrt();
                    if d > radius {
                        continue;
                    }
                    let direction = wrap(dy.atan2(dx) - offsets[s]);
                    let a = &mut acc[sector(direction, p)];
                    a[0] += 1.0;
                    if map[i * w + j] >= OBSTACLE_THRESHOLD {
                        a[1] += 1.0;
                        a[2] = a[2].min(d);
                        a[3] += direction;
                    }
                }
            }

            for (k, a) in acc.iter().enumerate() {
                let row = (s * self.max_partitions + k) * Self::DIM;
                circle[row] = if a[0] > 0.0 { a[1] / a[0] } else { 0.0 };
                circle[row + 1] = a[2];
                circle[row + 2] = if a[1] > 0.0 { a[3] / a[1] } else { 0.0 };
            }
        }

        Tensor::from_vec(circle, (b, self.max_partitions, Self::DIM), &device)
    }
}

// ── Fusion ──────────────────────────────────────────────────────────────────

/// Concatenates social and physical factors sector by sector.
#[derive(Debug, Clone, Copy)]
pub struct CircleFusionLayer {
    social_dim: usize,
}

impl CircleFusionLayer {
    pub fn new(social: &SocialCircleLayer) -> Self {
        Self {
            social_dim: social.dim(),
        }
    }

    pub fn dim(&self) -> usize {
        self.social_dim + PhysicalCircleLayer::DIM
    }

    pub fn forward(&self, social: &Tensor, physical: &Tensor) -> Result<Tensor> {
        Tensor::cat(&[social, physical], 2)
    }
}
