//! Cameras: shutter handling and pinhole projection.

use std::path::PathBuf;

use glam::{UVec2, Vec2, Vec3};
use log::warn;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::device::Ray;
use crate::errors::{CandelaError, Result};
use crate::filters::{Filter, FilterSample};
use crate::scene::desc::SceneNodeDesc;

/// A point on the piecewise-linear shutter weighting curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShutterPoint {
    pub time: f32,
    pub weight: f32,
}

/// One scheduled shutter bucket: a time/weight point and the samples
/// rendered at it.
#[derive(Debug, Clone, Copy)]
pub struct ShutterSample {
    pub point: ShutterPoint,
    pub spp: u32,
}

/// Camera description: film, filter, transform, shutter curve, and output.
#[derive(Debug, Clone)]
pub struct CameraNode {
    pub film: usize,
    pub filter: Filter,
    pub transform: Option<usize>,
    pub shutter_span: Vec2,
    shutter_count: u32,
    shutter_points: Vec<ShutterPoint>,
    pub spp: u32,
    pub file: PathBuf,
    pub fov_degrees: f32,
}

impl CameraNode {
    /// Builds the camera from its description. `film` and `transform` are
    /// arena indices resolved by the scene loader.
    pub fn new(
        desc: &SceneNodeDesc,
        film: usize,
        filter: Filter,
        transform: Option<usize>,
    ) -> Result<Self> {
        let spp = desc.property_u32_or("spp", 1024).max(1);
        let shutter_span = match desc.property_v2("shutter_span") {
            Ok(v) => v,
            Err(_) => Vec2::splat(desc.property_f32_or("shutter_span", 0.0)),
        };
        if shutter_span.y < shutter_span.x {
            return Err(CandelaError::Invariant(format!(
                "invalid shutter span [{}, {}] in camera '{}'",
                shutter_span.x,
                shutter_span.y,
                desc.identifier()
            )));
        }

        let mut shutter_count = desc.property_u32_or("shutter_samples", 0);
        let mut shutter_points = Vec::new();
        if shutter_span.x != shutter_span.y {
            if shutter_count == 0 {
                shutter_count = spp.min(256);
            } else if shutter_count > spp {
                warn!(
                    "Too many shutter samples ({shutter_count}), clamping to spp ({spp}) in camera '{}'.",
                    desc.identifier()
                );
                shutter_count = spp;
            }
            let times = desc.property_f32_list_or_empty("shutter_time_points");
            let weights = desc.property_f32_list_or_empty("shutter_weights");
            if times.len() != weights.len() {
                return Err(CandelaError::Invariant(format!(
                    "shutter time point/weight count mismatch in camera '{}'",
                    desc.identifier()
                )));
            }
            if weights.iter().any(|&w| w < 0.0) {
                return Err(CandelaError::Invariant(format!(
                    "negative shutter weight in camera '{}'",
                    desc.identifier()
                )));
            }
            if times.is_empty() {
                shutter_points.push(ShutterPoint {
                    time: shutter_span.x,
                    weight: 1.0,
                });
                shutter_points.push(ShutterPoint {
                    time: shutter_span.y,
                    weight: 1.0,
                });
            } else {
                let mut indices: Vec<usize> = (0..times.len()).collect();
                let in_span = |i: &usize| {
                    times[*i] >= shutter_span.x && times[*i] <= shutter_span.y
                };
                let dropped = indices.iter().filter(|i| !in_span(i)).count();
                if dropped > 0 {
                    warn!(
                        "Out-of-shutter samples (count = {dropped}) are to be removed in camera '{}'.",
                        desc.identifier()
                    );
                    indices.retain(in_span);
                }
                indices.sort_by(|&a, &b| times[a].total_cmp(&times[b]));
                let before = indices.len();
                indices.dedup_by_key(|&mut i| times[i].to_bits());
                if indices.len() != before {
                    warn!(
                        "Duplicate shutter samples (count = {}) are to be removed in camera '{}'.",
                        before - indices.len(),
                        desc.identifier()
                    );
                }
                shutter_points = indices
                    .iter()
                    .map(|&i| ShutterPoint {
                        time: times[i],
                        weight: weights[i],
                    })
                    .collect();
                // pad to the span endpoints
                if let Some(first) = shutter_points.first().copied() {
                    if first.time > shutter_span.x {
                        shutter_points.insert(
                            0,
                            ShutterPoint {
                                time: shutter_span.x,
                                weight: first.weight,
                            },
                        );
                    }
                }
                if let Some(last) = shutter_points.last().copied() {
                    if last.time < shutter_span.y {
                        shutter_points.push(ShutterPoint {
                            time: shutter_span.y,
                            weight: last.weight,
                        });
                    }
                }
                if shutter_points.is_empty() {
                    warn!(
                        "All shutter points fell outside the span in camera '{}'; using a uniform curve.",
                        desc.identifier()
                    );
                    shutter_points.push(ShutterPoint {
                        time: shutter_span.x,
                        weight: 1.0,
                    });
                    shutter_points.push(ShutterPoint {
                        time: shutter_span.y,
                        weight: 1.0,
                    });
                }
            }
        }

        Ok(Self {
            film,
            filter,
            transform,
            shutter_span,
            shutter_count,
            shutter_points,
            spp,
            file: desc.property_path_or("file", "render.exr"),
            fov_degrees: desc.property_f32_or("fov", 35.0).clamp(1.0, 179.0),
        })
    }

    /// Shutter response at `time`: linear interpolation over the shutter
    /// points, zero outside the span, one for a degenerate span.
    pub fn shutter_weight(&self, time: f32) -> f32 {
        if time < self.shutter_span.x || time > self.shutter_span.y {
            return 0.0;
        }
        if self.shutter_span.x == self.shutter_span.y {
            return 1.0;
        }
        let upper = self
            .shutter_points
            .partition_point(|p| p.time < time)
            .clamp(1, self.shutter_points.len() - 1);
        let p0 = self.shutter_points[upper - 1];
        let p1 = self.shutter_points[upper];
        let t = if p1.time > p0.time {
            (time - p0.time) / (p1.time - p0.time)
        } else {
            0.0
        };
        crate::core::lerp(p0.weight, p1.weight, t)
    }

    /// Expands the shutter curve into per-bucket samples. Bucket times are
    /// jittered inside their strata, spp split with a shuffled remainder,
    /// and weights renormalized so `Σ wᵢ·sppᵢ == spp`.
    pub fn shutter_samples(&self) -> Vec<ShutterSample> {
        if self.shutter_span.x == self.shutter_span.y {
            return vec![ShutterSample {
                point: ShutterPoint {
                    time: self.shutter_span.x,
                    weight: 1.0,
                },
                spp: self.spp,
            }];
        }
        let mut rng = rand::thread_rng();
        let n = self.shutter_count.max(1);
        let duration = self.shutter_span.y - self.shutter_span.x;
        let inv_n = 1.0 / n as f32;
        let mut buckets: Vec<ShutterSample> = (0..n)
            .map(|bucket| {
                let ts = bucket as f32 * inv_n * duration;
                let te = (bucket + 1) as f32 * inv_n * duration;
                let t = self.shutter_span.x + crate::core::lerp(ts, te, rng.gen::<f32>());
                ShutterSample {
                    point: ShutterPoint {
                        time: t,
                        weight: self.shutter_weight(t),
                    },
                    spp: 0,
                }
            })
            .collect();
        let mut indices: Vec<usize> = (0..n as usize).collect();
        indices.shuffle(&mut rng);
        let per_bucket = self.spp / n;
        let remainder = (self.spp % n) as usize;
        for (rank, &i) in indices.iter().enumerate() {
            buckets[i].spp = per_bucket + u32::from(rank < remainder);
        }
        let sum: f64 = buckets
            .iter()
            .map(|b| f64::from(b.point.weight) * f64::from(b.spp))
            .sum();
        if sum == 0.0 {
            warn!("Invalid shutter samples generated. Falling back to uniform shutter curve.");
            for b in &mut buckets {
                b.point.weight = 1.0;
            }
        } else {
            let scale = f64::from(self.spp) / sum;
            for b in &mut buckets {
                b.point.weight = (f64::from(b.point.weight) * scale) as f32;
            }
        }
        buckets
    }

    /// Generates a camera-space primary ray for `pixel_coord`. The returned
    /// pixel position includes the filter offset; the pipeline maps the ray
    /// to world space with the camera transform at the sample time.
    pub fn generate_ray(
        &self,
        resolution: UVec2,
        pixel_coord: UVec2,
        filter_sample: FilterSample,
    ) -> CameraSample {
        let pixel = Vec2::new(pixel_coord.x as f32, pixel_coord.y as f32)
            + Vec2::splat(0.5)
            + filter_sample.offset;
        CameraSample {
            ray: self.ray_through(resolution, pixel),
            pixel,
            weight: filter_sample.weight,
        }
    }

    /// Central ray plus one-pixel offsets in x and y, for derivatives.
    pub fn generate_ray_differential(
        &self,
        resolution: UVec2,
        pixel_coord: UVec2,
        filter_sample: FilterSample,
    ) -> CameraSampleDifferential {
        let central = self.generate_ray(resolution, pixel_coord, filter_sample);
        let rx = self.ray_through(resolution, central.pixel + Vec2::new(1.0, 0.0));
        let ry = self.ray_through(resolution, central.pixel + Vec2::new(0.0, 1.0));
        CameraSampleDifferential {
            rx_direction: rx.direction,
            ry_direction: ry.direction,
            sample: central,
        }
    }

    fn ray_through(&self, resolution: UVec2, pixel: Vec2) -> Ray {
        let res = Vec2::new(resolution.x as f32, resolution.y as f32);
        let ndc = (pixel / res) * 2.0 - Vec2::ONE;
        let tan_half = (self.fov_degrees.to_radians() * 0.5).tan();
        let aspect = res.x / res.y;
        // camera space: right-handed, looking down -z, +y up
        let direction = Vec3::new(ndc.x * tan_half * aspect, -ndc.y * tan_half, -1.0).normalize();
        Ray::new(Vec3::ZERO, direction)
    }
}

/// A generated primary ray with its pixel position and filter weight.
#[derive(Debug, Clone, Copy)]
pub struct CameraSample {
    pub ray: Ray,
    pub pixel: Vec2,
    pub weight: f32,
}

/// A camera sample with one-pixel x/y differential directions.
#[derive(Debug, Clone, Copy)]
pub struct CameraSampleDifferential {
    pub sample: CameraSample,
    pub rx_direction: Vec3,
    pub ry_direction: Vec3,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::desc::{SceneNodeTag, SourceLocation, Value};

    fn desc_with(props: &[(&str, Value)]) -> SceneNodeDesc {
        let mut d = SceneNodeDesc::new(
            "cam",
            SceneNodeTag::Camera,
            "pinhole",
            SourceLocation::default(),
        );
        for (k, v) in props {
            d.add_property(*k, v.clone()).unwrap();
        }
        d
    }

    #[test]
    fn degenerate_span_yields_one_full_bucket() {
        let d = desc_with(&[("spp", Value::Numbers(vec![64.0]))]);
        let cam = CameraNode::new(&d, 0, Filter::default_box(), None).unwrap();
        let samples = cam.shutter_samples();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].spp, 64);
        assert_eq!(samples[0].point.weight, 1.0);
        assert_eq!(cam.shutter_weight(0.0), 1.0);
    }

    #[test]
    fn shutter_buckets_partition_spp_inside_span() {
        let d = desc_with(&[
            ("spp", Value::Numbers(vec![100.0])),
            ("shutter_span", Value::Numbers(vec![0.0, 1.0])),
            ("shutter_samples", Value::Numbers(vec![7.0])),
        ]);
        let cam = CameraNode::new(&d, 0, Filter::default_box(), None).unwrap();
        let samples = cam.shutter_samples();
        assert_eq!(samples.len(), 7);
        assert_eq!(samples.iter().map(|s| s.spp).sum::<u32>(), 100);
        for s in &samples {
            assert!(s.point.time >= 0.0 && s.point.time <= 1.0);
        }
        let weighted: f64 = samples
            .iter()
            .map(|s| f64::from(s.point.weight) * f64::from(s.spp))
            .sum();
        assert!((weighted - 100.0).abs() < 1e-3);
    }

    #[test]
    fn inverted_span_is_fatal() {
        let d = desc_with(&[("shutter_span", Value::Numbers(vec![1.0, 0.0]))]);
        assert!(CameraNode::new(&d, 0, Filter::default_box(), None).is_err());
    }

    #[test]
    fn out_of_span_points_are_dropped() {
        let d = desc_with(&[
            ("spp", Value::Numbers(vec![16.0])),
            ("shutter_span", Value::Numbers(vec![0.0, 1.0])),
            ("shutter_time_points", Value::Numbers(vec![-0.5, 0.5, 2.0])),
            ("shutter_weights", Value::Numbers(vec![1.0, 2.0, 3.0])),
        ]);
        let cam = CameraNode::new(&d, 0, Filter::default_box(), None).unwrap();
        // curve is padded to endpoints and only uses t = 0.5
        assert!((cam.shutter_weight(0.0) - 2.0).abs() < 1e-6);
        assert!((cam.shutter_weight(1.0) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn center_pixel_looks_forward() {
        let d = desc_with(&[("fov", Value::Numbers(vec![60.0]))]);
        let cam = CameraNode::new(&d, 0, Filter::default_box(), None).unwrap();
        let s = cam.generate_ray(
            UVec2::new(100, 100),
            UVec2::new(49, 49),
            FilterSample {
                offset: Vec2::splat(0.5),
                weight: 1.0,
            },
        );
        assert!((s.ray.direction - Vec3::NEG_Z).length() < 1e-5);
    }
}
