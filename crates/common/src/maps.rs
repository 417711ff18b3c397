//! Segmentation maps for the PhysicalCircle.
//!
//! A map file is a safetensors file with two tensors: `map` `(h, w)` and
//! `paras` `(4,)` = `[W0, W1, b0, b1]`, so world point `(x, y)` falls into
//! cell `(W0·x + b0, W1·y + b1)`. Cells at or above 0.5 are obstacles.
//!
//! Clips without a configured map get a trajectory map: every cell starts as
//! an obstacle and the cells any annotated agent walked through (plus a small
//! brush around them) become walkable. It is built once and saved next to the
//! annotation file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{DType, Device, Tensor};

use crate::agent::{read_annotations, Annotation};
use crate::registry::ClipInfo;

pub const OBSTACLE: f32 = 1.0;
pub const WALKABLE: f32 = 0.0;

/// File name of generated trajectory maps.
pub const TRAJECTORY_MAP_FILE: &str = "seg_map.safetensors";

/// Longest side of a generated map, in cells.
const MAX_CELLS: usize = 100;
/// World-unit margin around the annotated area.
const MARGIN: f32 = 2.0;
/// Cells marked walkable on each side of an annotated position.
const BRUSH: i64 = 1;

/// Build a trajectory map covering every annotated position.
pub fn make_trajectory_map(records: &[Annotation]) -> anyhow::Result<(Tensor, Tensor)> {
    if records.is_empty() {
        anyhow::bail!("cannot build a trajectory map without annotations");
    }
    let (mut lo, mut hi) = ([f32::INFINITY; 2], [f32::NEG_INFINITY; 2]);
    for r in records {
        for k in 0..2 {
            lo[k] = lo[k].min(r.pos[k]);
            hi[k] = hi[k].max(r.pos[k]);
        }
    }
    if lo.iter().chain(&hi).any(|v| !v.is_finite()) {
        anyhow::bail!("non-finite annotation positions");
    }

    // one scale for both axes so sectors stay undistorted
    let extent = (hi[0] - lo[0]).max(hi[1] - lo[1]) + 2.0 * MARGIN;
    let scale = (MAX_CELLS - 1) as f32 / extent;
    let bias = [-(lo[0] - MARGIN) * scale, -(lo[1] - MARGIN) * scale];
    let size = |k: usize| {
        ((((hi[k] - lo[k]) + 2.0 * MARGIN) * scale).ceil() as usize + 1).min(MAX_CELLS)
    };
    let (h, w) = (size(0), size(1));

    let mut cells = vec![OBSTACLE; h * w];
    for r in records {
        let ci = (r.pos[0] * scale + bias[0]).round() as i64;
        let cj = (r.pos[1] * scale + bias[1]).round() as i64;
        for i in (ci - BRUSH).max(0)..=(ci + BRUSH).min(h as i64 - 1) {
            for j in (cj - BRUSH).max(0)..=(cj + BRUSH).min(w as i64 - 1) {
                cells[i as usize * w + j as usize] = WALKABLE;
            }
        }
    }

    let map = Tensor::from_vec(cells, (h, w), &Device::Cpu)?;
    let paras = Tensor::new(&[scale, scale, bias[0], bias[1]], &Device::Cpu)?;
    Ok((map, paras))
}

/// Write a map file readable by [`load_seg_map`].
pub fn save_seg_map(path: &Path, map: &Tensor, paras: &Tensor) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tensors = HashMap::from([
        ("map".to_string(), map.clone()),
        ("paras".to_string(), paras.clone()),
    ]);
    candle_core::safetensors::save(&tensors, path)
        .with_context(|| format!("save segmentation map to {}", path.display()))?;
    Ok(())
}

/// Load a map file: tensors `map` `(h, w)` and `paras` `(4,)`.
pub fn load_seg_map(path: &Path) -> anyhow::Result<(Tensor, Tensor)> {
    let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)
        .with_context(|| format!("segmentation map `{}` not found", path.display()))?;
    let map = tensors
        .remove("map")
        .ok_or_else(|| anyhow::anyhow!("{}: missing tensor `map`", path.display()))?
        .to_dtype(DType::F32)?;
    let paras = tensors
        .remove("paras")
        .ok_or_else(|| anyhow::anyhow!("{}: missing tensor `paras`", path.display()))?
        .to_dtype(DType::F32)?;
    if map.rank() != 2 || paras.dims() != [4] {
        anyhow::bail!(
            "{}: expected map (h, w) and paras (4,), got {:?} and {:?}",
            path.display(),
            map.dims(),
            paras.dims()
        );
    }
    Ok((map, paras))
}

pub fn trajectory_map_path(clip: &ClipInfo) -> PathBuf {
    clip.annpath
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default()
        .join(TRAJECTORY_MAP_FILE)
}

/// The clip's configured map, or its trajectory map (built and saved on
/// first use). A configured map that cannot be read is an error.
pub fn load_or_make_map(clip: &ClipInfo) -> anyhow::Result<(Tensor, Tensor)> {
    if let Some(path) = &clip.segmap {
        return load_seg_map(path);
    }
    let path = trajectory_map_path(clip);
    if path.exists() {
        return load_seg_map(&path);
    }
    let records = read_annotations(&clip.annpath)?;
    let (map, paras) = make_trajectory_map(&records)
        .with_context(|| format!("clip `{}`", clip.name))?;
    save_seg_map(&path, &map, &paras)?;
    tracing::info!(clip = %clip.name, dims = ?map.dims(), path = %path.display(), "trajectory map saved");
    Ok((map, paras))
}

/// Pad `(h, w)` maps with obstacles at the high end so they share one shape.
/// Cell indices, and so the map parameters, are unchanged.
pub fn pad_maps(maps: &[Tensor]) -> candle_core::Result<Vec<Tensor>> {
    let mut h = 0;
    let mut w = 0;
    for m in maps {
        let (mh, mw) = m.dims2()?;
        h = h.max(mh);
        w = w.max(mw);
    }
    maps.iter()
        .map(|m| {
            let (mh, mw) = m.dims2()?;
            if (mh, mw) == (h, w) {
                return Ok(m.clone());
            }
            // shift so zero padding lands on OBSTACLE
            let shifted = (m - OBSTACLE as f64)?;
            shifted
                .pad_with_zeros(0, 0, h - mh)?
                .pad_with_zeros(1, 0, w - mw)?
                + OBSTACLE as f64
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walk() -> Vec<Annotation> {
        (0..10)
            .map(|k| Annotation {
                frame: k * 10,
                id: 1,
                pos: [k as f32, 3.0],
            })
            .collect()
    }

    fn cell(map: &Tensor, paras: &Tensor, x: f32, y: f32) -> f32 {
        let p = paras.to_vec1::<f32>().unwrap();
        let i = (x * p[0] + p[2]).round() as usize;
        let j = (y * p[1] + p[3]).round() as usize;
        map.to_vec2::<f32>().unwrap()[i][j]
    }

    #[test]
    fn walked_cells_are_free() {
        let (map, paras) = make_trajectory_map(&walk()).unwrap();
        let (h, w) = map.dims2().unwrap();
        assert!(h <= MAX_CELLS && w <= MAX_CELLS);
        assert_eq!(h, MAX_CELLS);
        for x in [0.0, 4.0, 9.0] {
            assert_eq!(cell(&map, &paras, x, 3.0), WALKABLE);
        }
        // far from the walk along y
        assert_eq!(cell(&map, &paras, 4.0, 3.0 + MARGIN), OBSTACLE);
        assert!(make_trajectory_map(&[]).is_err());
    }

    #[test]
    fn map_files_round_trip_and_bad_shapes_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene.safetensors");
        let map = Tensor::zeros((4, 6), DType::F32, &Device::Cpu).unwrap();
        let paras = Tensor::new(&[1.0f32, 1.0, 0.0, 0.0], &Device::Cpu).unwrap();
        save_seg_map(&path, &map, &paras).unwrap();
        let (m, p) = load_seg_map(&path).unwrap();
        assert_eq!(m.dims(), &[4, 6]);
        assert_eq!(p.dims(), &[4]);

        let flat = Tensor::zeros(24, DType::F32, &Device::Cpu).unwrap();
        save_seg_map(&path, &flat, &paras).unwrap();
        assert!(load_seg_map(&path).is_err());
        assert!(load_seg_map(&dir.path().join("missing.safetensors")).is_err());
    }

    #[test]
    fn padding_keeps_cells_and_fills_obstacles() {
        let a = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((3, 2), DType::F32, &Device::Cpu).unwrap();
        let padded = pad_maps(&[a, b]).unwrap();
        let a = padded[0].to_vec2::<f32>().unwrap();
        assert_eq!(a.len(), 3);
        assert_eq!(a[0], vec![0.0, 0.0, 0.0]);
        assert_eq!(a[2], vec![1.0, 1.0, 1.0]);
        let b = padded[1].to_vec2::<f32>().unwrap();
        assert_eq!(b[0], vec![0.0, 0.0, 1.0]);
    }
}
