//! Non-thermal electron degradation (Spencer-Fano).
//!
//! Fast electrons injected by gamma-ray interactions slow down on a
//! log-spaced energy grid. Every channel moves electrons strictly downward
//! in energy, so the source operator is triangular and one sweep from the
//! highest energy point to the lowest solves the degradation spectrum by
//! forward substitution. Binning remainders are deposited as heat, which
//! makes the heating/ionisation/excitation split conserve energy exactly.
//!
//! The cascade channels: continuous electron-electron loss (heating),
//! impact ionisation of every ion (Lotz cross-sections, with inner-shell
//! events feeding an Auger cascade), and impact excitation of the first few
//! levels (Bethe-type for allowed lines, constant collision strength for
//! forbidden ones).

use log::info;

use crate::atomic::AtomicData;
use crate::constant::{EV, H, ME, PI, QE};
use crate::options;

/// Number of energy points (descending sweep order is index-descending).
const NPTS: usize = options::SFPTS;

/// pi a_0^2 [cm^2]
const PI_A0_SQ: f64 = 8.7974e-17;

/// Rydberg energy [eV]
const RYDBERG_EV: f64 = 13.605693;

pub struct SfGrid {
    /// energy points [eV], ascending
    pub en: Vec<f64>,
}

impl SfGrid {
    pub fn new() -> SfGrid {
        let lgrange = (options::SF_EMAX / options::SF_EMIN).ln();
        let en = (0..NPTS)
            .map(|i| options::SF_EMIN * (lgrange * i as f64 / (NPTS as f64 - 1.)).exp())
            .collect();
        SfGrid { en }
    }

    /// Highest grid point at or below `e`, if any.
    fn bin_below(&self, e: f64) -> Option<usize> {
        if e < self.en[0] {
            return None;
        }
        let lgrange = (options::SF_EMAX / options::SF_EMIN).ln();
        let frac = (e / options::SF_EMIN).ln() / lgrange * (NPTS as f64 - 1.);
        let mut i = (frac as usize).min(NPTS - 1);
        while self.en[i] > e && i > 0 {
            i -= 1;
        }
        Some(i)
    }
}

impl Default for SfGrid {
    fn default() -> Self {
        SfGrid::new()
    }
}

/// Electron energy loss rate to thermal electrons [erg/cm], after
/// Kozma & Fransson (1992).
pub fn electron_loss_rate(energy_erg: f64, nne: f64) -> f64 {
    if nne <= 0. || energy_erg <= 0. {
        return 0.;
    }
    let omegap = (4. * PI * nne * QE * QE / ME).sqrt();
    let zetae = H * omegap / (2. * PI);
    if energy_erg > 14. * EV {
        nne * 2. * PI * QE.powi(4) / energy_erg * (2. * energy_erg / zetae).ln()
    } else {
        let v = (2. * energy_erg / ME).sqrt();
        nne * 2. * PI * QE.powi(4) / energy_erg
            * (ME * v.powi(3) / (1.28 * QE * QE * omegap)).ln().max(0.)
    }
}

/// Lotz impact-ionisation cross-section [cm^2] for a shell with `q`
/// electrons and potential `ionpot_ev`.
fn xs_impact_ionization(energy_ev: f64, ionpot_ev: f64, q: f64) -> f64 {
    if energy_ev <= ionpot_ev {
        return 0.;
    }
    4.5e-14 * q * (energy_ev / ionpot_ev).ln() / (energy_ev * ionpot_ev)
}

/// Impact-excitation cross-section [cm^2].
fn xs_excitation(energy_ev: f64, de_ev: f64, osc_strength: f64, coll_str: f64, g_lower: f64) -> f64 {
    if energy_ev <= de_ev {
        return 0.;
    }
    if coll_str >= 0. {
        // constant collision strength
        coll_str / g_lower * PI_A0_SQ * RYDBERG_EV / energy_ev
    } else if osc_strength > 0. {
        // Bethe-type form for allowed transitions, gbar = 0.2
        let gbar = 0.2;
        4.62 * PI_A0_SQ * RYDBERG_EV * RYDBERG_EV / (de_ev * energy_ev)
            * osc_strength
            * gbar
            * (energy_ev / de_ev).ln().max(1.)
    } else {
        // forbidden placeholder channel
        0.05 / g_lower * PI_A0_SQ * RYDBERG_EV / energy_ev
    }
}

/// Secondary-energy distribution parameter J ("shape" energy) per
/// Opal et al. (1971).
fn secondary_shape_energy(ionpot_ev: f64) -> f64 {
    0.6 * ionpot_ev
}

struct IonChannel {
    uniqueionindex: usize,
    n_ion: f64,
    /// valence shell
    ionpot_ev: f64,
    q_valence: f64,
    /// inner shell driving the Auger cascade (absent for light ions)
    inner: Option<InnerShell>,
}

struct InnerShell {
    ionpot_ev: f64,
    q: f64,
    n_auger: usize,
    /// energy of each Auger electron [eV]
    e_auger_ev: f64,
}

struct ExcitationChannel {
    n_lower: f64,
    de_ev: f64,
    osc_strength: f64,
    coll_str: f64,
    g_lower: f64,
}

/// Deposition split of the injected non-thermal energy.
#[derive(Clone, Debug)]
pub struct SpencerFanoSolution {
    pub frac_heating: f64,
    /// per unique ion
    pub frac_ionization: Vec<f64>,
    pub frac_excitation: f64,
    /// ionisation events per erg of deposited non-thermal energy, per
    /// unique ion; multiplied by the local deposition rate density this is
    /// the non-thermal ionisation rate
    pub ionization_events_per_erg: Vec<f64>,
}

impl SpencerFanoSolution {
    pub fn zero(nions: usize) -> SpencerFanoSolution {
        SpencerFanoSolution {
            frac_heating: 1.,
            frac_ionization: vec![0.; nions],
            frac_excitation: 0.,
            ionization_events_per_erg: vec![0.; nions],
        }
    }
}

/// Solve the degradation cascade for one cell.
///
/// `ion_pops` holds the ion number densities per unique ion index,
/// `level_pop` returns the population of (element, ion, level) and `nne`
/// is the free electron density.
pub fn solve(
    atomic: &AtomicData,
    grid: &SfGrid,
    ion_pops: &[f64],
    level_pop: &dyn Fn(usize, usize, usize) -> f64,
    nne: f64,
) -> SpencerFanoSolution {
    let ions = collect_ion_channels(atomic, ion_pops);
    let excitations = collect_excitation_channels(atomic, level_pop);

    let e_init_ev = options::SF_EMAX;
    let mut arrivals = vec![0.0f64; NPTS];
    arrivals[NPTS - 1] = 1.0;

    let mut heat_ev = 0.;
    let mut exc_ev = 0.;
    let mut ion_ev = vec![0.; ion_pops.len()];
    let mut ion_events = vec![0.; ion_pops.len()];

    for j in (0..NPTS).rev() {
        let phi = arrivals[j];
        if phi <= 0. {
            continue;
        }
        let e_ev = grid.en[j];

        if j == 0 {
            // below the grid everything thermalises
            heat_ev += phi * e_ev;
            continue;
        }
        let de_down = e_ev - grid.en[j - 1];

        // per-path-length rates of every downward channel
        let loss = electron_loss_rate(e_ev * EV, nne) / EV; // eV/cm
        let a_csd = loss / de_down;

        let mut a_total = a_csd;
        let mut a_ion: Vec<(usize, f64, f64)> = Vec::with_capacity(ions.len() * 2);
        for (k, ch) in ions.iter().enumerate() {
            let a_val = ch.n_ion * xs_impact_ionization(e_ev, ch.ionpot_ev, ch.q_valence);
            if a_val > 0. {
                a_total += a_val;
                a_ion.push((k, a_val, ch.ionpot_ev));
            }
            if let Some(inner) = &ch.inner {
                let a_in = ch.n_ion * xs_impact_ionization(e_ev, inner.ionpot_ev, inner.q);
                if a_in > 0. {
                    a_total += a_in;
                    a_ion.push((k, a_in, inner.ionpot_ev));
                }
            }
        }

        let mut a_exc: Vec<(usize, f64)> = Vec::with_capacity(excitations.len());
        for (t, ch) in excitations.iter().enumerate() {
            let a = ch.n_lower
                * xs_excitation(e_ev, ch.de_ev, ch.osc_strength, ch.coll_str, ch.g_lower);
            if a > 0. {
                a_total += a;
                a_exc.push((t, a));
            }
        }

        if a_total <= 0. {
            heat_ev += phi * e_ev;
            continue;
        }

        // continuous slowing down: drop one grid point, deposit the gap
        let p_csd = a_csd / a_total;
        arrivals[j - 1] += phi * p_csd;
        heat_ev += phi * p_csd * de_down;

        // impact ionisation: the potential is spent, a secondary is born
        for &(k, a, ionpot_ev) in &a_ion {
            let p = phi * a / a_total;
            let ch = &ions[k];
            let is_inner = ch
                .inner
                .as_ref()
                .map(|inner| (inner.ionpot_ev - ionpot_ev).abs() < 1e-12)
                .unwrap_or(false);

            ion_events[ch.uniqueionindex] += p;

            let e_avail = e_ev - ionpot_ev;
            // mean secondary energy of the 1/(1+(E/J)^2) distribution,
            // truncated at half the available energy
            let jshape = secondary_shape_energy(ionpot_ev);
            let emax_half = 0.5 * e_avail;
            let e_secondary =
                jshape * (1. + (emax_half / jshape).powi(2)).ln() / 2.
                    / (emax_half / jshape).atan().max(1e-12);
            let e_secondary = e_secondary.min(emax_half);
            let e_primary = e_avail - e_secondary;

            let mut cost = ionpot_ev;
            deposit(grid, &mut arrivals, &mut heat_ev, p, e_primary);
            deposit(grid, &mut arrivals, &mut heat_ev, p, e_secondary);

            if options::SF_AUGER_CONTRIBUTION_ON && is_inner {
                if let Some(inner) = &ch.inner {
                    for _ in 0..inner.n_auger.min(options::NT_MAX_AUGER_ELECTRONS) {
                        // Auger electrons return part of the shell energy
                        deposit(grid, &mut arrivals, &mut heat_ev, p, inner.e_auger_ev);
                        cost -= inner.e_auger_ev;
                    }
                }
            }
            ion_ev[ch.uniqueionindex] += p * cost;
        }

        // impact excitation: a discrete energy loss
        for &(t, a) in &a_exc {
            let p = phi * a / a_total;
            let ch = &excitations[t];
            exc_ev += p * ch.de_ev;
            deposit(grid, &mut arrivals, &mut heat_ev, p, e_ev - ch.de_ev);
        }
    }

    let frac_heating = heat_ev / e_init_ev;
    let frac_excitation = exc_ev / e_init_ev;
    let frac_ionization: Vec<f64> = ion_ev.iter().map(|v| v / e_init_ev).collect();
    let ionization_events_per_erg: Vec<f64> = ion_events
        .iter()
        .map(|v| v / (e_init_ev * EV))
        .collect();

    SpencerFanoSolution {
        frac_heating,
        frac_ionization,
        frac_excitation,
        ionization_events_per_erg,
    }
}

/// Put a cascading electron of energy `e_ev` back onto the grid at the
/// nearest point below; the binning remainder thermalises.
fn deposit(grid: &SfGrid, arrivals: &mut [f64], heat_ev: &mut f64, weight: f64, e_ev: f64) {
    if weight <= 0. || e_ev <= 0. {
        return;
    }
    match grid.bin_below(e_ev) {
        Some(i) => {
            arrivals[i] += weight;
            *heat_ev += weight * (e_ev - grid.en[i]);
        }
        None => {
            *heat_ev += weight * e_ev;
        }
    }
}

fn collect_ion_channels(atomic: &AtomicData, ion_pops: &[f64]) -> Vec<IonChannel> {
    let mut out = Vec::new();
    for element in 0..atomic.nelements() {
        let z = atomic.anumber(element);
        for ion in 0..atomic.nions(element) {
            let uii = atomic.uniqueionindex(element, ion);
            let n_ion = ion_pops.get(uii).copied().unwrap_or(0.);
            if n_ion <= 0. {
                continue;
            }
            let ionpot_ev = atomic.ion(element, ion).ionpot / EV;
            if ionpot_ev <= 0. {
                continue;
            }
            let nbound = z - atomic.ionstage(element, ion) + 1;
            if nbound <= 0 {
                continue;
            }
            let q_valence = (nbound as f64).min(8.);

            // a crude single inner shell for heavier species; its
            // vacancies relax by Auger emission
            let inner = if nbound > 10 && options::NT_MAX_AUGER_ELECTRONS > 0 {
                let ionpot_inner = 2.5 * ionpot_ev;
                let e_auger = (ionpot_inner - 2. * ionpot_ev).max(0.5 * ionpot_ev);
                Some(InnerShell {
                    ionpot_ev: ionpot_inner,
                    q: 2.,
                    n_auger: 1,
                    e_auger_ev: e_auger,
                })
            } else {
                None
            };

            out.push(IonChannel {
                uniqueionindex: uii,
                n_ion,
                ionpot_ev,
                q_valence,
                inner,
            });
        }
    }
    out
}

fn collect_excitation_channels(
    atomic: &AtomicData,
    level_pop: &dyn Fn(usize, usize, usize) -> f64,
) -> Vec<ExcitationChannel> {
    let mut out = Vec::new();
    for line in &atomic.linelist {
        let lower = line.lowerlevelindex as usize;
        let upper = line.upperlevelindex as usize;
        if lower >= options::NTEXCITATION_MAXNLEVELS_LOWER
            || upper >= options::NTEXCITATION_MAXNLEVELS_UPPER
        {
            continue;
        }
        let element = line.elementindex as usize;
        let ion = line.ionindex as usize;
        let n_lower = level_pop(element, ion, lower);
        if n_lower <= 0. {
            continue;
        }
        let de_ev = (atomic.epsilon(element, ion, upper) - atomic.epsilon(element, ion, lower)) / EV;
        if de_ev <= 0. {
            continue;
        }
        out.push(ExcitationChannel {
            n_lower,
            de_ev,
            osc_strength: line.osc_strength,
            coll_str: line.coll_str,
            g_lower: atomic.stat_weight(element, ion, lower),
        });
    }
    out
}

/// Re-solve policy: at least every MAX_TIMESTEPS_BETWEEN_SOLUTIONS steps,
/// on a large electron-fraction change, or during the first timesteps.
pub fn solution_due(
    timesteps_since_solve: usize,
    nne_per_ion: f64,
    nne_per_ion_at_solve: f64,
    timestep: usize,
) -> bool {
    if timestep <= 3 {
        return true;
    }
    if timesteps_since_solve >= options::MAX_TIMESTEPS_BETWEEN_SOLUTIONS {
        return true;
    }
    if nne_per_ion_at_solve > 0. {
        let fracdiff = (nne_per_ion - nne_per_ion_at_solve).abs() / nne_per_ion_at_solve;
        if fracdiff > options::NT_MAX_FRACDIFF_NNEPERION_BETWEEN_SOLUTIONS {
            return true;
        }
    }
    false
}

pub fn print_solution(solution: &SpencerFanoSolution) {
    info!(
        "Spencer-Fano deposition fractions: heating {:.4}, ionisation {:.4}, excitation {:.4}",
        solution.frac_heating,
        solution.frac_ionization.iter().sum::<f64>(),
        solution.frac_excitation
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::{AtomicData, Element, Ion, Level};

    /// A bare hydrogen model atom: H I with one level, H II as closure.
    fn hydrogen_atom() -> AtomicData {
        let level = Level {
            epsilon: 0.,
            stat_weight: 2.,
            metastable: true,
            ..Default::default()
        };
        let hi = Ion {
            ionstage: 1,
            ionpot: 13.6 * EV,
            levels: vec![level.clone()],
            uniqueionindex: 0,
            uniquelevelindexstart: 0,
            alpha_sp: vec![0.; options::TABLESIZE],
            ..Default::default()
        };
        let hii = Ion {
            ionstage: 2,
            ionpot: 0.,
            levels: vec![Level {
                stat_weight: 1.,
                ..Default::default()
            }],
            uniqueionindex: 1,
            uniquelevelindexstart: 1,
            alpha_sp: vec![0.; options::TABLESIZE],
            ..Default::default()
        };
        let mut data = AtomicData::empty();
        data.homogeneous_abundances = true;
        data.elements = vec![Element {
            anumber: 1,
            abundance: 1.,
            mass: crate::constant::MH,
            ions: vec![hi, hii],
        }];
        data.includedions = 2;
        data.includedlevels = 2;
        data
    }

    fn solve_hydrogen(x_e: f64) -> SpencerFanoSolution {
        let atomic = hydrogen_atom();
        let grid = SfGrid::new();
        let n_h = 1e8;
        let ion_pops = vec![n_h * (1. - x_e), n_h * x_e];
        let nne = n_h * x_e;
        solve(&atomic, &grid, &ion_pops, &|_, _, _| 0., nne)
    }

    #[test]
    fn test_deposition_fractions_conserve_energy() {
        let solution = solve_hydrogen(0.5);
        let total = solution.frac_heating
            + solution.frac_ionization.iter().sum::<f64>()
            + solution.frac_excitation;
        assert!(
            (total - 1.).abs() < 1e-6,
            "deposition fractions sum to {}",
            total
        );
    }

    #[test]
    fn test_half_ionised_hydrogen_heating_fraction() {
        // Kozma & Fransson: at x_e = 0.5 most of the energy thermalises
        let solution = solve_hydrogen(0.5);
        assert!(
            solution.frac_heating > 0.7 && solution.frac_heating < 0.99,
            "heating fraction {}",
            solution.frac_heating
        );
        assert!(solution.frac_ionization[0] > 0.);
    }

    #[test]
    fn test_heating_fraction_grows_with_ionisation() {
        let lo = solve_hydrogen(0.01);
        let hi = solve_hydrogen(0.5);
        assert!(hi.frac_heating > lo.frac_heating);
    }

    #[test]
    fn test_fully_neutral_gas_still_degrades() {
        let solution = solve_hydrogen(1e-6);
        // with almost no free electrons the cascade is ionisation-dominated
        assert!(solution.frac_ionization[0] > solution.frac_heating);
    }

    #[test]
    fn test_solution_trigger_policy() {
        assert!(solution_due(0, 1., 1., 0)); // first timesteps
        assert!(solution_due(10, 1., 1., 50)); // too long since last solve
        assert!(solution_due(0, 2.5, 1., 50)); // electron fraction jumped
    }
}
