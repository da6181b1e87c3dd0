//! Nishita-style analytic sky, precomputed into a 2D table.
//!
//! Single-scattering atmosphere model: Rayleigh and Mie scattering with
//! exponential density profiles, integrated along view rays from sea level
//! and resolved to linear sRGB. The precomputed table is indexed by
//! (azimuth, elevation) through the equirectangular mapping used by
//! environment lookups.

use std::f32::consts::PI;

use glam::{UVec2, Vec2, Vec3};

use crate::device::{AddressMode, Device, DeviceImage, FilterMode, TextureSampler};

const RAYLEIGH_SCALE: f32 = 8e3; // Rayleigh scale height (m)
const MIE_SCALE: f32 = 1.2e3; // Mie scale height (m)
const MIE_COEFF: f32 = 2e-5; // Mie scattering coefficient (m^-1)
const MIE_G: f32 = 0.76; // aerosol anisotropy
const EARTH_RADIUS: f32 = 6360e3; // m
const ATMOSPHERE_RADIUS: f32 = 6420e3; // m
const PRIMARY_STEPS: usize = 32;
const LIGHT_STEPS: usize = 8;

// Rayleigh scattering coefficients at representative RGB wavelengths
// (680 / 550 / 440 nm), in m^-1.
const RAYLEIGH_COEFF: Vec3 = Vec3::new(5.802e-6, 1.3558e-5, 3.31e-5);
// Sun irradiance scale resolved to RGB.
const SUN_INTENSITY: f32 = 20.0;

fn density_rayleigh(height: f32) -> f32 {
    (-height / RAYLEIGH_SCALE).exp()
}

fn density_mie(height: f32) -> f32 {
    (-height / MIE_SCALE).exp()
}

fn phase_rayleigh(mu: f32) -> f32 {
    3.0 / (16.0 * PI) * (1.0 + mu * mu)
}

fn phase_mie(mu: f32) -> f32 {
    let g2 = MIE_G * MIE_G;
    (3.0 * (1.0 - g2) * (1.0 + mu * mu))
        / (8.0 * PI * (2.0 + g2) * (1.0 + g2 - 2.0 * MIE_G * mu).powf(1.5))
}

fn atmosphere_intersection(pos: Vec3, dir: Vec3) -> f32 {
    let b = 2.0 * pos.dot(dir);
    let c = pos.dot(pos) - ATMOSPHERE_RADIUS * ATMOSPHERE_RADIUS;
    (-b + (b * b - 4.0 * c).max(0.0).sqrt()) * 0.5
}

/// Radiance arriving from `dir` with the sun toward `sun_dir`, both unit
/// vectors with +z up.
pub fn sky_radiance(dir: Vec3, sun_dir: Vec3) -> Vec3 {
    let origin = Vec3::new(0.0, 0.0, EARTH_RADIUS + 1.0);
    let dir = dir.normalize_or(Vec3::Z);
    // below the horizon the atmosphere fades to ground darkness
    if dir.z < -0.05 {
        return Vec3::ZERO;
    }
    let t_end = atmosphere_intersection(origin, dir);
    let dt = t_end / PRIMARY_STEPS as f32;
    let mu = dir.dot(sun_dir);
    let ph_r = phase_rayleigh(mu);
    let ph_m = phase_mie(mu);

    let mut optical_r = 0.0f32;
    let mut optical_m = 0.0f32;
    let mut sum_r = Vec3::ZERO;
    let mut sum_m = Vec3::ZERO;

    for i in 0..PRIMARY_STEPS {
        let p = origin + dir * ((i as f32 + 0.5) * dt);
        let height = p.length() - EARTH_RADIUS;
        let dr = density_rayleigh(height) * dt;
        let dm = density_mie(height) * dt;
        optical_r += dr;
        optical_m += dm;

        // optical depth toward the sun
        let t_light = atmosphere_intersection(p, sun_dir);
        let dl = t_light / LIGHT_STEPS as f32;
        let mut light_r = 0.0f32;
        let mut light_m = 0.0f32;
        let mut shadowed = false;
        for j in 0..LIGHT_STEPS {
            let q = p + sun_dir * ((j as f32 + 0.5) * dl);
            let h = q.length() - EARTH_RADIUS;
            if h < 0.0 {
                shadowed = true;
                break;
            }
            light_r += density_rayleigh(h) * dl;
            light_m += density_mie(h) * dl;
        }
        if shadowed {
            continue;
        }
        let tau = RAYLEIGH_COEFF * (optical_r + light_r)
            + Vec3::splat(MIE_COEFF * 1.1 * (optical_m + light_m));
        let attenuation = Vec3::new((-tau.x).exp(), (-tau.y).exp(), (-tau.z).exp());
        sum_r += attenuation * dr;
        sum_m += attenuation * dm;
    }

    SUN_INTENSITY * (sum_r * RAYLEIGH_COEFF * ph_r + sum_m * MIE_COEFF * ph_m)
}

/// Precomputes the sky into an equirectangular RGB table.
pub fn precompute_sky_table(device: &Device, resolution: UVec2, sun_dir: Vec3) -> DeviceImage {
    let image = device.create_image(4, resolution);
    for y in 0..resolution.y {
        for x in 0..resolution.x {
            let uv = Vec2::new(
                (x as f32 + 0.5) / resolution.x as f32,
                (y as f32 + 0.5) / resolution.y as f32,
            );
            let dir = direction_from_uv(uv);
            let l = sky_radiance(dir, sun_dir);
            image.write(x, y, glam::Vec4::new(l.x, l.y, l.z, 1.0));
        }
    }
    image
}

/// Equirectangular mapping: u is azimuth over [0, 2π), v is polar angle
/// from +z.
pub fn direction_from_uv(uv: Vec2) -> Vec3 {
    let phi = uv.x * 2.0 * PI;
    let theta = uv.y * PI;
    Vec3::new(
        theta.sin() * phi.cos(),
        theta.sin() * phi.sin(),
        theta.cos(),
    )
}

/// Inverse of [`direction_from_uv`].
pub fn uv_from_direction(dir: Vec3) -> Vec2 {
    let theta = crate::scattering::spherical_theta(dir);
    let phi = crate::scattering::spherical_phi(dir);
    Vec2::new(phi / (2.0 * PI), theta / PI)
}

/// The sampler environment tables are read with.
pub fn table_sampler() -> TextureSampler {
    TextureSampler {
        address: AddressMode::Repeat,
        filter: FilterMode::Bilinear,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uv_mapping_round_trips() {
        for dir in [
            Vec3::new(0.3, 0.5, 0.8).normalize(),
            Vec3::new(-0.7, 0.1, 0.2).normalize(),
            Vec3::new(0.0, -0.9, -0.3).normalize(),
        ] {
            let uv = uv_from_direction(dir);
            let back = direction_from_uv(uv);
            assert!((back - dir).length() < 1e-4, "{dir:?} -> {back:?}");
        }
    }

    #[test]
    fn zenith_is_blue_at_midday() {
        let sun = Vec3::new(0.0, 0.3, 0.95).normalize();
        let zenith = sky_radiance(Vec3::Z, sun);
        assert!(zenith.z > zenith.x, "sky should be blue: {zenith:?}");
        assert!(zenith.min_element() >= 0.0);
    }

    #[test]
    fn below_horizon_is_dark() {
        let sun = Vec3::Z;
        assert_eq!(sky_radiance(Vec3::new(0.0, 0.1, -0.8).normalize(), sun), Vec3::ZERO);
    }
}
