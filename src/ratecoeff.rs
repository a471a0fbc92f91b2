//! Rate coefficients: spontaneous recombination, bound-free cooling and
//! (optionally) photoionisation under a Planck field, precomputed per
//! (element, ion, level, target) on a log-uniform T_e grid and retrieved by
//! linear interpolation in log T_e.

use log::{info, warn};

use crate::atomic::AtomicData;
use crate::constant::{FOURPI, H, HOVERKB, KB, SAHACONST, TWOOVERCLIGHTSQUARED};
use crate::options;
use crate::quadrature;
use crate::radfield::{self, CellRadField, RadFieldBins};

/// Temperature of table entry `i`.
pub fn table_temperature(i: usize) -> f64 {
    let frac = i as f64 / (options::TABLESIZE as f64 - 1.);
    (options::MINTEMP.ln() + frac * (options::MAXTEMP.ln() - options::MINTEMP.ln())).exp()
}

/// Linear interpolation in log T_e; out-of-range temperatures clamp with a
/// warning.
pub fn interpolate_table(table: &[f64], t_e: f64) -> f64 {
    if table.len() < 2 {
        return table.first().copied().unwrap_or(0.);
    }
    let t = if t_e < options::MINTEMP {
        warn!(
            "rate coefficient requested below MINTEMP (T_e = {:.1} K), clamping",
            t_e
        );
        options::MINTEMP
    } else if t_e > options::MAXTEMP {
        warn!(
            "rate coefficient requested above MAXTEMP (T_e = {:.1} K), clamping",
            t_e
        );
        options::MAXTEMP
    } else {
        t_e
    };

    let logmin = options::MINTEMP.ln();
    let logmax = options::MAXTEMP.ln();
    let frac = (t.ln() - logmin) / (logmax - logmin) * (options::TABLESIZE as f64 - 1.);
    let i = (frac as usize).min(options::TABLESIZE - 2);
    let w = frac - i as f64;
    table[i] * (1. - w) + table[i + 1] * w
}

/// Cross-section lookup that owns a copy of the table, so integration can
/// run while the store is being mutated.
#[derive(Clone)]
struct XsTable {
    xs: Vec<f32>,
    nu_edge: f64,
    increment: f64,
    last_ratio: f64,
    npoints: usize,
}

impl XsTable {
    fn from_level(data: &AtomicData, element: usize, ion: usize, level: usize) -> XsTable {
        let lv = data.level(element, ion, level);
        XsTable {
            xs: lv.photoion_xs.clone(),
            nu_edge: lv.phixs_threshold / H,
            increment: data.phixsnuincrement,
            last_ratio: data.last_phixs_nuovernuedge,
            npoints: data.nphixspoints,
        }
    }

    fn sigma(&self, nu: f64) -> f64 {
        if self.nu_edge <= 0. || nu < self.nu_edge || self.xs.is_empty() {
            return 0.;
        }
        let ratio = nu / self.nu_edge;
        if ratio >= self.last_ratio {
            let sigma_max = *self.xs.last().unwrap_or(&0.) as f64;
            let nu_max = self.last_ratio * self.nu_edge;
            return sigma_max * (nu_max / nu).powi(3);
        }
        let i = ((ratio - 1.) / self.increment) as usize;
        self.xs[i.min(self.npoints - 1)] as f64
    }

    fn nu_max(&self) -> f64 {
        self.nu_edge * self.last_ratio
    }
}

/// Saha factor for (lower level, upper level) at T_e, without the
/// exponential (kept inside the integrand for numerical range).
fn sahafactor_prefactor(g_lower: f64, g_upper: f64, t_e: f64) -> f64 {
    SAHACONST * g_lower / g_upper * t_e.powf(-1.5)
}

/// Spontaneous recombination coefficient alpha_sp(T_e) via the Milne
/// relation integrated over the cross-section under a Planck source.
fn alpha_sp_integral(xs: &XsTable, g_lower: f64, g_upper: f64, t_e: f64) -> f64 {
    if xs.nu_edge <= 0. {
        return 0.;
    }
    let integral = quadrature::integrate(
        |nu| {
            xs.sigma(nu) * nu * nu * (-HOVERKB * (nu - xs.nu_edge) / t_e).exp()
        },
        xs.nu_edge,
        xs.nu_max(),
        1e-6,
    );
    FOURPI * sahafactor_prefactor(g_lower, g_upper, t_e) * TWOOVERCLIGHTSQUARED * integral
}

/// Bound-free cooling coefficient: like alpha_sp with the emitted photon
/// carrying h(nu - nu_edge) of electron thermal energy.
fn bfcooling_integral(xs: &XsTable, g_lower: f64, g_upper: f64, t_e: f64) -> f64 {
    if xs.nu_edge <= 0. {
        return 0.;
    }
    let integral = quadrature::integrate(
        |nu| {
            xs.sigma(nu)
                * H
                * (nu - xs.nu_edge)
                * nu
                * nu
                * (-HOVERKB * (nu - xs.nu_edge) / t_e).exp()
        },
        xs.nu_edge,
        xs.nu_max(),
        1e-6,
    );
    FOURPI * sahafactor_prefactor(g_lower, g_upper, t_e) * TWOOVERCLIGHTSQUARED * integral
}

/// Photoionisation coefficient under an undiluted Planck field at T_R
/// (lookup-table mode).
fn corrphotoion_integral(xs: &XsTable, t_r: f64) -> f64 {
    if xs.nu_edge <= 0. {
        return 0.;
    }
    let integral = quadrature::integrate(
        |nu| xs.sigma(nu) / (H * nu) * radfield::planck(nu, t_r),
        xs.nu_edge,
        xs.nu_max(),
        1e-6,
    );
    FOURPI * integral
}

/// Bound-free heating coefficient under an undiluted Planck field at T_R.
fn bfheating_integral(xs: &XsTable, t_r: f64) -> f64 {
    if xs.nu_edge <= 0. {
        return 0.;
    }
    let integral = quadrature::integrate(
        |nu| xs.sigma(nu) * (1. - xs.nu_edge / nu) * radfield::planck(nu, t_r),
        xs.nu_edge,
        xs.nu_max(),
        1e-6,
    );
    FOURPI * integral
}

/// Precompute every rate-coefficient table. Called once after ingest; the
/// store is immutable afterwards.
pub fn setup_tables(data: &mut AtomicData) {
    info!("precomputing rate coefficient tables (TABLESIZE {})", options::TABLESIZE);
    for element in 0..data.nelements() {
        let nions = data.nions(element);
        for ion in 0..nions.saturating_sub(1) {
            let mut ion_alpha = vec![0.; options::TABLESIZE];
            for level in 0..data.ionisinglevels(element, ion) {
                let xs = XsTable::from_level(data, element, ion, level);
                let g_lower = data.stat_weight(element, ion, level);
                let ntargets = data.nphixstargets(element, ion, level);
                for target in 0..ntargets {
                    let upperlevel = data.phixsupperlevel(element, ion, level, target);
                    let probability = data.phixsprobability(element, ion, level, target);
                    let g_upper = data.stat_weight(element, ion + 1, upperlevel);

                    let mut spontrecomb = vec![0.; options::TABLESIZE];
                    let mut bfcooling = vec![0.; options::TABLESIZE];
                    let mut corrphotoion = if options::NO_LUT_PHOTOION {
                        None
                    } else {
                        Some(vec![0.; options::TABLESIZE])
                    };
                    let mut bfheating = if options::NO_LUT_BFHEATING {
                        None
                    } else {
                        Some(vec![0.; options::TABLESIZE])
                    };

                    for i in 0..options::TABLESIZE {
                        let t = table_temperature(i);
                        let a = alpha_sp_integral(&xs, g_lower, g_upper, t) * probability;
                        spontrecomb[i] = a;
                        bfcooling[i] = bfcooling_integral(&xs, g_lower, g_upper, t) * probability;
                        if let Some(tab) = corrphotoion.as_mut() {
                            tab[i] = corrphotoion_integral(&xs, t) * probability;
                        }
                        if let Some(tab) = bfheating.as_mut() {
                            tab[i] = bfheating_integral(&xs, t) * probability;
                        }
                        ion_alpha[i] += a;
                    }

                    let slot = &mut data.elements[element].ions[ion].levels[level].phixstargets
                        [target];
                    slot.spontrecombcoeff = spontrecomb;
                    slot.bfcooling_coeff = bfcooling;
                    slot.corrphotoioncoeff = corrphotoion;
                    slot.bfheating_coeff = bfheating;
                }
            }
            data.elements[element].ions[ion].alpha_sp = ion_alpha;
        }
    }
}

/// alpha_sp for one (element, ion, level, target) at T_e.
pub fn alpha_sp(
    data: &AtomicData,
    element: usize,
    ion: usize,
    level: usize,
    target: usize,
    t_e: f64,
) -> f64 {
    interpolate_table(
        &data.phixstarget(element, ion, level, target).spontrecombcoeff,
        t_e,
    )
}

/// Total recombination coefficient from ion+1 into all levels of `ion`.
pub fn total_alpha_sp(data: &AtomicData, element: usize, ion: usize, t_e: f64) -> f64 {
    interpolate_table(&data.elements[element].ions[ion].alpha_sp, t_e)
}

pub fn bfcooling_coeff(
    data: &AtomicData,
    element: usize,
    ion: usize,
    level: usize,
    target: usize,
    t_e: f64,
) -> f64 {
    interpolate_table(
        &data.phixstarget(element, ion, level, target).bfcooling_coeff,
        t_e,
    )
}

/// Photoionisation rate coefficient of (element, ion, level, target) for
/// the current radiation field: from the binned field when the lookup table
/// is disabled, otherwise from the LUT at the cell's T_R diluted by W.
pub fn corrphotoioncoeff(
    data: &AtomicData,
    field: &CellRadField,
    bins: &RadFieldBins,
    element: usize,
    ion: usize,
    level: usize,
    target: usize,
) -> f64 {
    let probability = data.phixsprobability(element, ion, level, target);
    if options::NO_LUT_PHOTOION {
        let xs = XsTable::from_level(data, element, ion, level);
        if xs.nu_edge <= 0. {
            return 0.;
        }
        let integral = quadrature::integrate(
            |nu| xs.sigma(nu) / (H * nu) * radfield::j_nu(field, bins, nu),
            xs.nu_edge,
            xs.nu_max(),
            1e-5,
        );
        FOURPI * integral * probability
    } else {
        let tab = data
            .phixstarget(element, ion, level, target)
            .corrphotoioncoeff
            .as_ref()
            .expect("photoionisation LUT enabled but not built");
        field.w * interpolate_table(tab, field.t_j.max(options::MINTEMP))
    }
}

/// Bound-free heating rate coefficient for the current radiation field.
pub fn bfheatingcoeff(
    data: &AtomicData,
    field: &CellRadField,
    bins: &RadFieldBins,
    element: usize,
    ion: usize,
    level: usize,
    target: usize,
) -> f64 {
    let probability = data.phixsprobability(element, ion, level, target);
    if options::NO_LUT_BFHEATING {
        let xs = XsTable::from_level(data, element, ion, level);
        if xs.nu_edge <= 0. {
            return 0.;
        }
        let integral = quadrature::integrate(
            |nu| xs.sigma(nu) * (1. - xs.nu_edge / nu) * radfield::j_nu(field, bins, nu),
            xs.nu_edge,
            xs.nu_max(),
            1e-5,
        );
        FOURPI * integral * probability
    } else {
        let tab = data
            .phixstarget(element, ion, level, target)
            .bfheating_coeff
            .as_ref()
            .expect("bf heating LUT enabled but not built");
        field.w * interpolate_table(tab, field.t_j.max(options::MINTEMP))
    }
}

/// Effective collision strength of a line: tabulated when the data carries
/// one, van Regemorter from the oscillator strength for allowed
/// transitions, and a weak constant for forbidden placeholders.
fn effective_collision_strength(
    coll_str: f64,
    osc_strength: f64,
    g_lower: f64,
    de: f64,
) -> f64 {
    if coll_str >= 0. {
        coll_str
    } else if osc_strength > 0. {
        // van Regemorter (1962)
        14.5 * osc_strength * g_lower * (crate::constant::H_IONPOT / de)
    } else {
        0.05
    }
}

/// Collisional excitation rate coefficient q_lu [cm^3/s] of a line at T_e.
pub fn col_excitation_coeff(data: &AtomicData, line: &crate::atomic::Line, t_e: f64) -> f64 {
    let element = line.elementindex as usize;
    let ion = line.ionindex as usize;
    let lower = line.lowerlevelindex as usize;
    let upper = line.upperlevelindex as usize;
    let de = data.epsilon(element, ion, upper) - data.epsilon(element, ion, lower);
    let g_lower = data.stat_weight(element, ion, lower);
    let upsilon = effective_collision_strength(line.coll_str, line.osc_strength, g_lower, de);
    8.629e-6 / (g_lower * t_e.sqrt()) * upsilon * (-de / (KB * t_e)).exp()
}

/// Collisional de-excitation rate coefficient q_ul [cm^3/s].
pub fn col_deexcitation_coeff(data: &AtomicData, line: &crate::atomic::Line, t_e: f64) -> f64 {
    let element = line.elementindex as usize;
    let ion = line.ionindex as usize;
    let lower = line.lowerlevelindex as usize;
    let upper = line.upperlevelindex as usize;
    let de = data.epsilon(element, ion, upper) - data.epsilon(element, ion, lower);
    let g_lower = data.stat_weight(element, ion, lower);
    let g_upper = data.stat_weight(element, ion, upper);
    let upsilon = effective_collision_strength(line.coll_str, line.osc_strength, g_lower, de);
    8.629e-6 / (g_upper * t_e.sqrt()) * upsilon
}

/// Collisional ionisation rate coefficient (Seaton-style from the threshold
/// cross-section).
pub fn col_ionization_coeff(
    data: &AtomicData,
    element: usize,
    ion: usize,
    level: usize,
    t_e: f64,
) -> f64 {
    let lv = data.level(element, ion, level);
    if lv.phixs_threshold <= 0. || lv.photoion_xs.is_empty() {
        return 0.;
    }
    let sigma_edge = lv.photoion_xs[0] as f64;
    let u = lv.phixs_threshold / (KB * t_e);
    // Seaton (1962) empirical rate from the threshold photoionisation
    // cross-section
    1.55e13 * t_e.powf(-0.5) * 0.1 * sigma_edge * (-u).exp() / u
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn hydrogen_ground_xs() -> XsTable {
        // hydrogenic nu^-3 cross-section, 6.3e-18 cm^2 at threshold
        let npoints = 100;
        let increment = 0.1;
        let nu_edge = 3.288e15;
        let xs: Vec<f32> = (0..npoints)
            .map(|i| {
                let ratio = 1. + increment * i as f64;
                (6.3e-18 * ratio.powi(-3)) as f32
            })
            .collect();
        XsTable {
            xs,
            nu_edge,
            increment,
            last_ratio: 1. + increment * (npoints as f64 - 1.),
            npoints,
        }
    }

    #[test]
    fn test_alpha_sp_hydrogen_ground_state() {
        // recombination to the hydrogen ground state at 1e4 K is about
        // 1.6e-13 cm^3/s
        let xs = hydrogen_ground_xs();
        let alpha = alpha_sp_integral(&xs, 2., 1., 1e4);
        assert!(alpha > 1.2e-13 && alpha < 2.1e-13, "alpha = {:e}", alpha);
    }

    #[test]
    fn test_alpha_sp_decreases_with_temperature() {
        let xs = hydrogen_ground_xs();
        let a1 = alpha_sp_integral(&xs, 2., 1., 5e3);
        let a2 = alpha_sp_integral(&xs, 2., 1., 2e4);
        assert!(a1 > a2);
    }

    #[test]
    fn test_bfcooling_scales_with_temperature() {
        // the mean emitted excess energy grows with T_e
        let xs = hydrogen_ground_xs();
        let t1 = 5e3;
        let t2 = 2e4;
        let mean1 = bfcooling_integral(&xs, 2., 1., t1) / alpha_sp_integral(&xs, 2., 1., t1);
        let mean2 = bfcooling_integral(&xs, 2., 1., t2) / alpha_sp_integral(&xs, 2., 1., t2);
        assert!(mean2 > mean1);
        // and sits near kT
        assert!(mean1 > 0.3 * KB * t1 && mean1 < 3. * KB * t1);
    }

    #[test]
    fn test_table_interpolation_reproduces_nodes() {
        let table: Vec<f64> = (0..options::TABLESIZE)
            .map(|i| table_temperature(i).ln())
            .collect();
        for &i in &[0usize, 17, 50, options::TABLESIZE - 1] {
            let t = table_temperature(i);
            assert_approx_eq!(interpolate_table(&table, t), t.ln(), 1e-9);
        }
    }

    #[test]
    fn test_table_temperature_range() {
        assert_approx_eq!(table_temperature(0), options::MINTEMP, 1e-9);
        assert_approx_eq!(
            table_temperature(options::TABLESIZE - 1),
            options::MAXTEMP,
            1e-6
        );
    }
}
