//! Mathematical utilities for packet kinematics.

use nalgebra::Vector3;
use rand::Rng;

use crate::constant::{CLIGHT, CLIGHTSQUARED};

/// Tolerance on the unit-direction invariant, checked after every scatter.
pub const DIR_NORM_TOL: f64 = 1.0e-8;

/// Sample a direction uniformly over the sphere.
pub fn isotropic_direction<R: Rng + ?Sized>(rng: &mut R) -> Vector3<f64> {
    let zrand: f64 = rng.gen::<f64>();
    let zrand2: f64 = rng.gen::<f64>();
    let mu = -1. + (2. * zrand);
    let phi = zrand2 * 2. * crate::constant::PI;
    let sintheta = (1. - mu * mu).sqrt();
    Vector3::new(sintheta * phi.cos(), sintheta * phi.sin(), mu)
}

/// Local fluid velocity at `pos` for homologous expansion, v = r/t.
pub fn velocity(pos: &Vector3<f64>, t: f64) -> Vector3<f64> {
    pos / t
}

/// First-order Doppler factor nu_cmf/nu_rf = 1 - dir.v/c for a packet
/// travelling along `dir` (rest frame) through fluid moving at `vel`.
pub fn doppler(dir_rf: &Vector3<f64>, vel: &Vector3<f64>) -> f64 {
    let ndotv = dir_rf.dot(vel);
    let dopplerfactor = 1. - (ndotv / CLIGHT);
    debug_assert!(dopplerfactor > 0.);
    dopplerfactor
}

/// Aberration of a unit direction into the frame moving at `vel`.
///
/// Uses the exact transformation so the result stays a unit vector to
/// machine precision; pass `-vel` to transform back out of the comoving
/// frame.
pub fn angle_ab(dir: &Vector3<f64>, vel: &Vector3<f64>) -> Vector3<f64> {
    let vsqr = vel.dot(vel) / CLIGHTSQUARED;
    let gamma_rel = 1. / (1. - vsqr).sqrt();
    let ndotv = dir.dot(vel);
    let fact1 = gamma_rel * (1. - (ndotv / CLIGHT));
    let fact2 = (gamma_rel - (gamma_rel * gamma_rel * ndotv / (gamma_rel + 1.) / CLIGHT)) / fact1;
    dir / fact1 - vel * (fact2 / CLIGHT)
}

/// Rotate `dir` by the polar angle with cosine `cos_theta`, at a uniformly
/// random azimuth about `dir`.
pub fn scatter_dir<R: Rng + ?Sized>(
    dir: &Vector3<f64>,
    cos_theta: f64,
    rng: &mut R,
) -> Vector3<f64> {
    // orthonormal basis around the incident direction
    let reference = if dir[0].abs() < 0.9 {
        Vector3::new(1., 0., 0.)
    } else {
        Vector3::new(0., 1., 0.)
    };
    let e1 = dir.cross(&reference).normalize();
    let e2 = dir.cross(&e1);

    let phi: f64 = rng.gen::<f64>() * 2. * crate::constant::PI;
    let sin_theta = (1. - (cos_theta * cos_theta)).max(0.).sqrt();
    dir * cos_theta + e1 * (sin_theta * phi.cos()) + e2 * (sin_theta * phi.sin())
}

/// True when `dir` satisfies the unit-vector invariant.
pub fn is_unit_direction(dir: &Vector3<f64>) -> bool {
    (1. - dir.norm()).abs() <= DIR_NORM_TOL
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    #[test]
    fn test_isotropic_direction_is_unit() {
        let mut rng = Pcg64::seed_from_u64(42);
        for _ in 0..1000 {
            let dir = isotropic_direction(&mut rng);
            assert!(is_unit_direction(&dir));
        }
    }

    #[test]
    fn test_isotropic_direction_mean() {
        let mut rng = Pcg64::seed_from_u64(7);
        let n = 100_000;
        let mut sum = Vector3::new(0., 0., 0.);
        for _ in 0..n {
            sum += isotropic_direction(&mut rng);
        }
        let mean = sum / (n as f64);
        assert!(mean.norm() < 0.02);
    }

    #[test]
    fn test_aberration_round_trip() {
        let mut rng = Pcg64::seed_from_u64(3);
        let vel = Vector3::new(0.05 * CLIGHT, -0.02 * CLIGHT, 0.01 * CLIGHT);
        for _ in 0..100 {
            let dir = isotropic_direction(&mut rng);
            let cmf = angle_ab(&dir, &vel);
            assert!(is_unit_direction(&cmf));
            let back = angle_ab(&cmf, &-vel);
            assert_approx_eq!(back[0], dir[0], 1e-12);
            assert_approx_eq!(back[1], dir[1], 1e-12);
            assert_approx_eq!(back[2], dir[2], 1e-12);
        }
    }

    #[test]
    fn test_scatter_dir_angle() {
        let mut rng = Pcg64::seed_from_u64(11);
        let dir = Vector3::new(0., 0., 1.);
        for &mu in &[-0.9, -0.3, 0., 0.5, 0.99] {
            let new_dir = scatter_dir(&dir, mu, &mut rng);
            assert!(is_unit_direction(&new_dir));
            assert_approx_eq!(new_dir.dot(&dir), mu, 1e-10);
        }
    }

    #[test]
    fn test_doppler_factor() {
        let dir = Vector3::new(1., 0., 0.);
        let vel = Vector3::new(0.1 * CLIGHT, 0., 0.);
        assert_approx_eq!(doppler(&dir, &vel), 0.9, 1e-12);
    }
}
