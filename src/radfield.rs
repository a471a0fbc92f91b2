//! The multi-bin radiation field model.
//!
//! During transport every packet path segment tallies its contribution into
//! frequency bins; after the timestep barrier each bin is matched to a
//! diluted Planck function by solving for (T_R, W) from the bin's mean
//! intensity and mean frequency. Bins with too few contributions fall back
//! to the cell-wide fit.

use crate::constant::{FOURPI, H, HOVERKB, KB, PI, STEBO, TWOHOVERCLIGHTSQUARED};
use crate::estimators::Estimators;
use crate::options;
use crate::quadrature;

/// <nu> / (kT/h) for a Planck spectrum integrated over all frequencies.
const PLANCK_MEAN_NU_RATIO: f64 = 3.832229494;

/// Planck function B_nu(T) [erg / s / cm^2 / Hz / sr].
pub fn planck(nu: f64, t: f64) -> f64 {
    TWOHOVERCLIGHTSQUARED * nu.powi(3) / ((HOVERKB * nu / t).exp() - 1.)
}

pub fn planck_integral(t: f64, nu1: f64, nu2: f64) -> f64 {
    quadrature::integrate(|nu| planck(nu, t), nu1, nu2, 1e-8)
}

fn planck_nu_moment(t: f64, nu1: f64, nu2: f64) -> f64 {
    quadrature::integrate(|nu| nu * planck(nu, t), nu1, nu2, 1e-8)
}

/// Log-uniform frequency bins over [nu_lower, nu_upper] with one super bin
/// above the last edge.
pub struct RadFieldBins {
    pub nu_edges: Vec<f64>,
}

impl RadFieldBins {
    pub fn new() -> RadFieldBins {
        Self::with_range(
            options::NU_LOWER_FIRST_INITIAL,
            options::NU_UPPER_LAST_INITIAL,
        )
    }

    pub fn with_range(nu_lower: f64, nu_upper: f64) -> RadFieldBins {
        let n = options::RADFIELDBINCOUNT;
        let lgrange = (nu_upper / nu_lower).ln();
        let nu_edges = (0..=n)
            .map(|i| nu_lower * (lgrange * i as f64 / n as f64).exp())
            .collect();
        RadFieldBins { nu_edges }
    }

    pub fn nbins(&self) -> usize {
        self.nu_edges.len() - 1
    }

    /// Bin index of `nu`; frequencies above the last edge land in the super
    /// bin (index nbins), frequencies below the first edge are not binned.
    pub fn select_bin(&self, nu: f64) -> Option<usize> {
        let n = self.nbins();
        if nu < self.nu_edges[0] {
            return None;
        }
        if nu >= self.nu_edges[n] {
            return Some(n);
        }
        // log-uniform edges invert analytically
        let lgrange = (self.nu_edges[n] / self.nu_edges[0]).ln();
        let i = ((nu / self.nu_edges[0]).ln() / lgrange * n as f64) as usize;
        // rounding at the edges
        let i = i.min(n - 1);
        if nu < self.nu_edges[i] {
            Some(i.saturating_sub(1))
        } else if nu >= self.nu_edges[i + 1] {
            Some(i + 1)
        } else {
            Some(i)
        }
    }

    pub fn bin_range(&self, bin: usize) -> (f64, f64) {
        let n = self.nbins();
        if bin >= n {
            // super bin: everything above the last edge
            (self.nu_edges[n], self.nu_edges[n] * 10.)
        } else {
            (self.nu_edges[bin], self.nu_edges[bin + 1])
        }
    }
}

impl Default for RadFieldBins {
    fn default() -> Self {
        RadFieldBins::new()
    }
}

/// Tally a path segment contribution e_rf * dl at comoving frequency
/// `nu_cmf` into the scalar and binned estimators of cell `mgi`.
pub fn update_estimators(
    est: &mut Estimators,
    bins: &RadFieldBins,
    mgi: usize,
    nu_cmf: f64,
    contribution: f64,
) {
    est.j[mgi] += contribution;
    est.nuj[mgi] += contribution * nu_cmf;
    if let Some(bin) = bins.select_bin(nu_cmf) {
        let slot = est.bin_slot(mgi, bin);
        est.radfield_j[slot] += contribution;
        est.radfield_nuj[slot] += contribution * nu_cmf;
        est.radfield_count[slot] += 1;
    }
}

/// Fitted radiation field of one bin.
#[derive(Clone, Copy, Debug, Default)]
pub struct BinFit {
    pub t_r: f64,
    pub w: f64,
    pub contribcount: u32,
}

/// Fitted radiation field of one cell.
#[derive(Clone, Debug, Default)]
pub struct CellRadField {
    pub bins: Vec<BinFit>,
    /// cell-wide fit over the whole spectrum
    pub t_j: f64,
    pub w: f64,
    /// mean intensity of the cell [erg / s / cm^2 / Hz / sr]
    pub j: f64,
}

/// Diluted-Planck mean intensity at `nu` from a cell fit.
pub fn j_nu(field: &CellRadField, bins: &RadFieldBins, nu: f64) -> f64 {
    match bins.select_bin(nu) {
        Some(bin) if bin < field.bins.len() => {
            let fit = field.bins[bin];
            if fit.w > 0. {
                fit.w * planck(nu, fit.t_r)
            } else {
                0.
            }
        }
        _ => {
            if field.w > 0. {
                field.w * planck(nu, field.t_j)
            } else {
                0.
            }
        }
    }
}

/// Reconstruct (T_R, W) for every bin of cell `mgi` from the estimators.
///
/// `volume` is the cell volume at the midpoint of the timestep and
/// `dt` the timestep width; the estimator normalisation is
/// J = sum(e dl) / (4 pi V dt).
pub fn fit_cell(est: &Estimators, bins: &RadFieldBins, mgi: usize, volume: f64, dt: f64) -> CellRadField {
    let norm = 1. / (FOURPI * volume * dt);

    let j_total = est.j[mgi] * norm;
    let (t_j, w_cell) = if j_total > 0. && est.nuj[mgi] > 0. {
        let nu_bar = est.nuj[mgi] / est.j[mgi];
        let t_j = clamp_t_r(H * nu_bar / KB / PLANCK_MEAN_NU_RATIO);
        let w = j_total / (STEBO * t_j.powi(4) / PI);
        (t_j, w)
    } else {
        (0., 0.)
    };

    let nbins = bins.nbins();
    let mut fits = Vec::with_capacity(nbins + 1);
    for bin in 0..=nbins {
        let slot = est.bin_slot(mgi, bin);
        let count = est.radfield_count[slot];
        let j_raw = est.radfield_j[slot];
        if count < options::RADFIELD_MIN_CONTRIBUTIONS || j_raw <= 0. {
            // insufficient samples: fall back to the cell-wide fit
            fits.push(BinFit {
                t_r: t_j,
                w: w_cell,
                contribcount: count,
            });
            continue;
        }

        let j_bin = j_raw * norm;
        let nu_bar = est.radfield_nuj[slot] / j_raw;
        let (nu1, nu2) = bins.bin_range(bin);
        let t_r = solve_bin_temperature(nu_bar, nu1, nu2);
        let b_bar = planck_integral(t_r, nu1, nu2);
        let w = if b_bar > 0. { j_bin / b_bar } else { 0. };
        fits.push(BinFit {
            t_r,
            w,
            contribcount: count,
        });
    }

    CellRadField {
        bins: fits,
        t_j,
        w: w_cell,
        j: j_total,
    }
}

fn clamp_t_r(t: f64) -> f64 {
    if t < options::T_R_MIN {
        options::T_R_MIN
    } else if t > options::T_R_MAX {
        options::T_R_MAX
    } else {
        t
    }
}

/// Solve for the Planck temperature whose mean frequency over [nu1, nu2]
/// matches `nu_bar`; the mean is monotonic in T so bisection converges.
/// The result is clamped into [T_R_MIN, T_R_MAX].
fn solve_bin_temperature(nu_bar: f64, nu1: f64, nu2: f64) -> f64 {
    let mean_at = |t: f64| planck_nu_moment(t, nu1, nu2) / planck_integral(t, nu1, nu2);

    let mut t_low = options::T_R_MIN;
    let mut t_high = options::T_R_MAX;
    if nu_bar <= mean_at(t_low) {
        return t_low;
    }
    if nu_bar >= mean_at(t_high) {
        return t_high;
    }
    for _ in 0..60 {
        let t_mid = 0.5 * (t_low + t_high);
        if mean_at(t_mid) < nu_bar {
            t_low = t_mid;
        } else {
            t_high = t_mid;
        }
        if (t_high - t_low) / t_mid < 1e-6 {
            break;
        }
    }
    0.5 * (t_low + t_high)
}

/// Select lines for detailed J_b,lu estimators. Disabled by default; when
/// enabled the strongest few lines carry their own estimator slots.
pub fn select_detailed_lines(atomic: &crate::atomic::AtomicData) -> Vec<u32> {
    if !options::DETAILED_LINE_ESTIMATORS_ON {
        return Vec::new();
    }
    let mut indices: Vec<u32> = (0..atomic.nlines() as u32).collect();
    indices.sort_by(|&a, &b| {
        atomic.line(b as usize)
            .osc_strength
            .total_cmp(&atomic.line(a as usize).osc_strength)
    });
    indices.truncate(200);
    indices.sort_unstable();
    indices
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_select_bin_edges_and_super_bin() {
        let bins = RadFieldBins::new();
        let n = bins.nbins();
        assert_eq!(n, options::RADFIELDBINCOUNT);
        assert_eq!(bins.select_bin(bins.nu_edges[0] * 0.99), None);
        assert_eq!(bins.select_bin(bins.nu_edges[0]), Some(0));
        assert_eq!(bins.select_bin(bins.nu_edges[n] * 2.), Some(n));
        // bin edges are increasing and log-uniform
        for i in 1..=n {
            assert!(bins.nu_edges[i] > bins.nu_edges[i - 1]);
        }
        // every inner frequency lands in the bin whose edges bracket it
        for bin in 0..n {
            let (nu1, nu2) = bins.bin_range(bin);
            let nu = (nu1 * nu2).sqrt();
            assert_eq!(bins.select_bin(nu), Some(bin));
        }
    }

    #[test]
    fn test_planck_peak_scaling() {
        // B_nu peaks near 5.88e10 * T Hz
        let t = 10000.;
        let nu_peak = 5.879e10 * t;
        assert!(planck(nu_peak, t) > planck(nu_peak * 3., t));
        assert!(planck(nu_peak, t) > planck(nu_peak / 3., t));
    }

    #[test]
    fn test_bin_reconstruction_recovers_planck_field() {
        // inject an undiluted Planck radiation field at T = 10000 K and
        // check the fit recovers T_R within 1% and W within 1%
        let t_true = 10000.;
        let bins = RadFieldBins::new();
        let volume = 1e45;
        let dt = 1e5;
        let norm = FOURPI * volume * dt;

        let mut est = crate::estimators::Estimators {
            ncells: 1,
            nbins: bins.nbins(),
            nslots: 0,
            nbfcontinua: 0,
            j: vec![0.],
            nuj: vec![0.],
            radfield_j: vec![0.; bins.nbins() + 1],
            radfield_nuj: vec![0.; bins.nbins() + 1],
            radfield_count: vec![0; bins.nbins() + 1],
            gamma_dep: vec![0.],
            positron_dep: vec![0.],
            corrphotoion: vec![],
            bfheating: vec![],
            ffheating: vec![0.],
            bfrate: vec![],
            jb_lu: vec![],
            detailed_lines: vec![],
            invariant_failures: 0,
        };

        for bin in 0..bins.nbins() {
            let (nu1, nu2) = bins.bin_range(bin);
            let jb = planck_integral(t_true, nu1, nu2);
            let nujb = planck_nu_moment(t_true, nu1, nu2);
            let slot = est.bin_slot(0, bin);
            est.radfield_j[slot] = jb * norm;
            est.radfield_nuj[slot] = nujb * norm;
            est.radfield_count[slot] = 1000;
            est.j[0] += jb * norm;
            est.nuj[0] += nujb * norm;
        }

        let field = fit_cell(&est, &bins, 0, volume, dt);
        for bin in 0..bins.nbins() {
            let fit = field.bins[bin];
            assert_approx_eq!(fit.t_r, t_true, 0.01 * t_true);
            assert_approx_eq!(fit.w, 1.0, 0.01);
        }
    }

    #[test]
    fn test_t_r_is_clamped() {
        assert_eq!(clamp_t_r(1.), options::T_R_MIN);
        assert_eq!(clamp_t_r(1e9), options::T_R_MAX);
    }
}
