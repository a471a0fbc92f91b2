//! Gamma-ray packet transport: Compton scattering off all electrons
//! (bound and free) and photoelectric absorption, with an optional grey
//! parameterisation.

use rand::Rng;
use rand_pcg::Pcg64;

use crate::constant::{CLIGHT, H, ME, MEV, SIGMA_T, THOMSON_LIMIT};
use crate::estimators::Estimators;
use crate::maths;
use crate::packet::{Packet, PacketKind};

use super::{apply_crossing, move_packet, TransportContext};

/// Partial Klein-Nishina cross-section integrated over energy-loss factors
/// 1..f, for photon energy `x` in units of the electron rest energy.
pub fn sigma_compton_partial(x: f64, f: f64) -> f64 {
    let term1 = (x * x - 2. * x - 2.) * f.ln() / x / x;
    let term2 = ((f * f - 1.) / (f * f)) / 2.;
    let term3 = ((f - 1.) / x) * (1. / x + 2. / f + 1. / (x * f));
    3. * SIGMA_T * (term1 + term2 + term3) / (8. * x)
}

/// Total Compton cross-section per electron in the comoving frame.
fn sigma_compton_total(x: f64) -> f64 {
    if x < THOMSON_LIMIT {
        SIGMA_T
    } else {
        sigma_compton_partial(x, 1. + 2. * x)
    }
}

/// Choose the energy-loss factor f so that the partial cross-section
/// matches `zrand` of the total, by bisection. Convergence failures keep
/// the last midpoint; that is logged, not fatal.
pub fn choose_f(x: f64, zrand: f64) -> f64 {
    let mut fmax = 1. + 2. * x;
    let mut fmin = 1.;
    let norm = zrand * sigma_compton_partial(x, fmax);

    let mut ftry = 0.5 * (fmax + fmin);
    let mut err = 1e20;
    let mut count = 0;
    while err > 1e-4 && count < 1000 {
        ftry = 0.5 * (fmax + fmin);
        let sigma_try = sigma_compton_partial(x, ftry);
        if sigma_try > norm {
            fmax = ftry;
            err = (sigma_try - norm) / norm;
        } else {
            fmin = ftry;
            err = (norm - sigma_try) / norm;
        }
        count += 1;
    }
    if count == 1000 {
        log::warn!(
            "Compton bisection hit 1000 tries: fmax {} fmin {} norm {}",
            fmax,
            fmin,
            norm
        );
    }
    ftry
}

/// Scattering angle cosine in the Thomson limit, drawn from the
/// (3/8)(1 + cos^2) phase function by the cubic-root construction.
pub fn thomson_angle<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    let zrand: f64 = rng.gen::<f64>();
    let b_coeff = (8. * zrand) - 4.;
    let mut t_coeff = ((b_coeff * b_coeff) + 4.).sqrt();
    t_coeff -= b_coeff;
    t_coeff /= 2.;
    t_coeff = t_coeff.cbrt();
    let mu = (1. / t_coeff) - t_coeff;
    debug_assert!(mu.abs() <= 1.);
    mu
}

/// Compton opacity in the rest frame [1/cm].
fn sigma_compton_rf(ctx: &TransportContext, pkt: &Packet, mgi: usize) -> f64 {
    let x = H * pkt.nu_cmf / (ME * CLIGHT * CLIGHT);
    let sigma_cmf = sigma_compton_total(x) * ctx.model.cells[mgi].nnetot;
    let vel = maths::velocity(&pkt.pos, pkt.prop_time);
    sigma_cmf * maths::doppler(&pkt.dir, &vel)
}

/// Photoelectric opacity in the rest frame [1/cm]; a power-law
/// parameterisation per gram of iron-group dominated ejecta.
fn sigma_photoelectric_rf(ctx: &TransportContext, pkt: &Packet, mgi: usize) -> f64 {
    let rho = ctx.model.rho(mgi, pkt.prop_time, ctx.params.tmin);
    let kappa = 0.0448 * (H * pkt.nu_cmf / MEV).powf(-3.5);
    let vel = maths::velocity(&pkt.pos, pkt.prop_time);
    kappa * rho * maths::doppler(&pkt.dir, &vel)
}

/// One gamma-packet leg: propagate to the next boundary, event, or the end
/// of the timestep.
pub fn do_gamma(ctx: &TransportContext, pkt: &mut Packet, _est: &mut Estimators, rng: &mut Pcg64) {
    let mgi = ctx.mgi_of(pkt);

    let (d_boundary, crossing) = ctx.grid.boundary_distance(
        pkt.cellindex as usize,
        &pkt.pos,
        &pkt.dir,
        pkt.prop_time,
        pkt.last_cross,
    );
    let d_timestep = (ctx.t_end - pkt.prop_time) * CLIGHT;

    // packets in the void are passively advected
    let chi = if ctx.is_void(mgi) {
        0.
    } else if ctx.params.gamma_grey > 0. {
        let rho = ctx.model.rho(mgi, pkt.prop_time, ctx.params.tmin);
        ctx.params.gamma_grey * rho
    } else {
        sigma_compton_rf(ctx, pkt, mgi) + sigma_photoelectric_rf(ctx, pkt, mgi)
    };

    let zrand: f64 = rng.gen::<f64>();
    let d_event = if chi > 0. { -zrand.ln() / chi } else { f64::MAX };

    if d_timestep <= d_boundary && d_timestep <= d_event {
        move_packet(pkt, d_timestep);
        pkt.prop_time = ctx.t_end;
    } else if d_boundary <= d_event {
        move_packet(pkt, d_boundary);
        apply_crossing(pkt, crossing);
    } else {
        move_packet(pkt, d_event);
        pkt.interactions += 1;
        if ctx.params.gamma_grey > 0. {
            // the grey parameterisation deposits on every interaction,
            // through the non-thermal electron channel
            pkt.kind = PacketKind::NtElectron;
            pkt.last_cross = crate::grid::Cross::None;
            return;
        }
        let p_compton = sigma_compton_rf(ctx, pkt, mgi) / chi;
        if rng.gen::<f64>() < p_compton {
            compton_scatter(pkt, rng);
        } else {
            // photoelectric absorption feeds the non-thermal cascade
            pkt.kind = PacketKind::NtElectron;
            pkt.absorptiontype = -4;
            pkt.last_cross = crate::grid::Cross::None;
        }
    }
}

/// A physical Compton scattering event: either the packet stays a gamma
/// with reduced frequency and a new direction, or its energy goes to a
/// non-thermal electron.
fn compton_scatter(pkt: &mut Packet, rng: &mut Pcg64) {
    let x = H * pkt.nu_cmf / (ME * CLIGHT * CLIGHT);

    let (f, prob_gamma) = if x < THOMSON_LIMIT {
        (1.0, 1.0) // no energy loss
    } else {
        let zrand: f64 = rng.gen::<f64>();
        let f = choose_f(x, zrand);
        debug_assert!(f >= 1. && f <= 1. + 2. * x);
        (f, 1. / f)
    };

    let zrand: f64 = rng.gen::<f64>();
    if zrand < prob_gamma {
        // stays a gamma ray: change frequency and direction in the
        // comoving frame, then transform back
        pkt.nu_cmf /= f;

        let vel = maths::velocity(&pkt.pos, pkt.prop_time);
        let cmf_dir = maths::angle_ab(&pkt.dir, &vel);

        let cos_theta = if x < THOMSON_LIMIT {
            thomson_angle(rng)
        } else {
            1. - ((f - 1.) / x)
        };

        let new_dir = maths::scatter_dir(&cmf_dir, cos_theta, rng);
        debug_assert!((new_dir.dot(&cmf_dir) - cos_theta).abs() < 1e-8);

        pkt.dir = maths::angle_ab(&new_dir, &-vel);
        pkt.update_rest_frame();
        pkt.nscatterings += 1;
        // allow it to re-cross the boundary it came through
        pkt.last_cross = crate::grid::Cross::None;
    } else {
        pkt.kind = PacketKind::NtElectron;
        pkt.absorptiontype = -3;
        pkt.last_cross = crate::grid::Cross::None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_sigma_compton_partial_approaches_thomson() {
        // for x -> 0 the full integral tends to the Thomson cross-section
        let x = 1e-4;
        let sigma = sigma_compton_partial(x, 1. + 2. * x);
        assert!((sigma - SIGMA_T).abs() < 0.01 * SIGMA_T);
    }

    #[test]
    fn test_sigma_compton_decreases_with_energy() {
        let s1 = sigma_compton_total(0.1);
        let s2 = sigma_compton_total(1.0);
        let s3 = sigma_compton_total(5.0);
        assert!(s1 > s2 && s2 > s3);
    }

    #[test]
    fn test_choose_f_in_bounds() {
        let mut rng = Pcg64::seed_from_u64(77);
        for _ in 0..2000 {
            let x = 10f64.powf(rng.gen::<f64>() * 3. - 2.); // 0.01 .. 10
            let f = choose_f(x, rng.gen::<f64>());
            assert!(f >= 1.0 && f <= 1. + 2. * x, "f = {} at x = {}", f, x);
        }
    }

    #[test]
    fn test_thomson_angle_distribution() {
        // sampled cos(theta) should match (3/8)(1 + cos^2) by chi-squared
        let mut rng = Pcg64::seed_from_u64(123);
        let n = 100_000;
        let nbins = 20;
        let mut counts = vec![0usize; nbins];
        for _ in 0..n {
            let mu = thomson_angle(&mut rng);
            assert!(mu.abs() <= 1.);
            let bin = (((mu + 1.) / 2. * nbins as f64) as usize).min(nbins - 1);
            counts[bin] += 1;
        }

        let mut chisq = 0.;
        for (bin, &count) in counts.iter().enumerate() {
            let lo = -1. + 2. * bin as f64 / nbins as f64;
            let hi = lo + 2. / nbins as f64;
            // integral of (3/8)(1+mu^2)
            let expected = n as f64 * (3. / 8.) * ((hi - lo) + (hi.powi(3) - lo.powi(3)) / 3.);
            chisq += (count as f64 - expected).powi(2) / expected;
        }
        // 19 dof; 43 is far beyond the 1% tail
        assert!(chisq < 43., "chi-squared {}", chisq);
    }

    #[test]
    fn test_mean_energy_loss_at_x_one() {
        // the mean fractional energy loss at x=1 should match the
        // Klein-Nishina expectation <1 - 1/f>
        let x = 1.0;
        let mut rng = Pcg64::seed_from_u64(55);
        let n = 100_000;
        let mut mean_loss = 0.;
        for _ in 0..n {
            let f = choose_f(x, rng.gen::<f64>());
            mean_loss += 1. - 1. / f;
        }
        mean_loss /= n as f64;

        // analytic mean over the partial cross-section by fine quadrature
        let steps = 20_000;
        let fmax = 1. + 2. * x;
        let total = sigma_compton_partial(x, fmax);
        let mut analytic = 0.;
        let mut prev = 0.;
        for i in 1..=steps {
            let f = 1. + (fmax - 1.) * i as f64 / steps as f64;
            let cdf = sigma_compton_partial(x, f);
            analytic += (1. - 1. / f) * (cdf - prev);
            prev = cdf;
        }
        analytic /= total;

        assert!(
            (mean_loss - analytic).abs() < 0.01 * analytic,
            "sampled {} analytic {}",
            mean_loss,
            analytic
        );
    }

    #[test]
    fn test_low_x_stays_gamma() {
        // S3: in the Thomson limit essentially no packets convert
        let mut rng = Pcg64::seed_from_u64(99);
        let x = 1e-4;
        let n = 100_000;
        let mut converted = 0;
        for _ in 0..n {
            let (_, prob_gamma) = if x < THOMSON_LIMIT {
                (1.0, 1.0)
            } else {
                let f = choose_f(x, rng.gen::<f64>());
                (f, 1. / f)
            };
            if rng.gen::<f64>() >= prob_gamma {
                converted += 1;
            }
        }
        assert!((converted as f64 / n as f64) < 0.01);
    }
}
