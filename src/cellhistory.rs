//! Thread-local cache of expensive per-cell derived quantities.
//!
//! Each worker thread owns one `CellHistory`. When a packet enters a new
//! cell every cached quantity is marked dirty and recomputed on first
//! access: the full per-level populations, the cooling-term vector (with
//! its cumulative form for inverse-CDF channel sampling), and the
//! per-continuum bound-free opacity contributions at the last requested
//! frequency.

use crate::atomic::AtomicData;
use crate::constant::{FF_COOLING_COEFF, HOVERKB, KB};
use crate::model::ModelCell;
use crate::options;
use crate::ratecoeff;

/// Identity of one k-packet cooling channel. The layout is fixed by the
/// atomic data set (ion-major, matching each ion's coolingoffset), so it is
/// computed once and shared by every thread.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CoolingChannel {
    FreeFree {
        element: u32,
        ion: u32,
    },
    BoundFree {
        element: u32,
        ion: u32,
        level: u32,
        target: u32,
    },
    ColIonization {
        element: u32,
        ion: u32,
        level: u32,
        target: u32,
    },
    /// collisional excitation out of one level, all upper levels combined
    ColExcitation {
        element: u32,
        ion: u32,
        level: u32,
    },
}

/// The fixed cooling-channel layout, one entry per cooling term.
pub fn cooling_layout(atomic: &AtomicData) -> Vec<CoolingChannel> {
    let mut layout = Vec::with_capacity(atomic.ncoolingterms);
    for element in 0..atomic.nelements() {
        let nions = atomic.nions(element);
        for ion in 0..nions {
            debug_assert_eq!(layout.len(), atomic.ion(element, ion).coolingoffset);
            if atomic.ionstage(element, ion) > 1 {
                layout.push(CoolingChannel::FreeFree {
                    element: element as u32,
                    ion: ion as u32,
                });
            }
            for level in 0..atomic.nlevels(element, ion) {
                if ion < nions - 1 {
                    for target in 0..atomic.nphixstargets(element, ion, level) {
                        layout.push(CoolingChannel::BoundFree {
                            element: element as u32,
                            ion: ion as u32,
                            level: level as u32,
                            target: target as u32,
                        });
                        layout.push(CoolingChannel::ColIonization {
                            element: element as u32,
                            ion: ion as u32,
                            level: level as u32,
                            target: target as u32,
                        });
                    }
                }
                layout.push(CoolingChannel::ColExcitation {
                    element: element as u32,
                    ion: ion as u32,
                    level: level as u32,
                });
            }
        }
    }
    debug_assert_eq!(layout.len(), atomic.ncoolingterms);
    layout
}

pub struct CellHistory {
    /// model cell currently cached; -99 marks an empty cache
    pub cellnumber: i64,
    pops: Vec<f64>,
    pops_valid: bool,
    cooling: Vec<f64>,
    cooling_cumulative: Vec<f64>,
    cooling_total: f64,
    cooling_valid: bool,
    /// per-continuum bf opacity contributions at `chi_bf_nu`
    chi_bf_contribs: Vec<f64>,
    chi_bf_total: f64,
    chi_bf_nu: f64,
}

impl CellHistory {
    pub fn new(atomic: &AtomicData) -> CellHistory {
        CellHistory {
            cellnumber: -99,
            pops: vec![0.; atomic.total_levels()],
            pops_valid: false,
            cooling: vec![0.; atomic.ncoolingterms],
            cooling_cumulative: vec![0.; atomic.ncoolingterms],
            cooling_total: 0.,
            cooling_valid: false,
            chi_bf_contribs: vec![0.; atomic.allcont.len()],
            chi_bf_total: 0.,
            chi_bf_nu: f64::NAN,
        }
    }

    /// Point the cache at a cell; every quantity goes dirty on a change.
    pub fn enter_cell(&mut self, mgi: usize) {
        if self.cellnumber != mgi as i64 {
            self.cellnumber = mgi as i64;
            self.pops_valid = false;
            self.cooling_valid = false;
            self.chi_bf_nu = f64::NAN;
        }
    }

    /// Full per-level populations of the cached cell [1/cm^3].
    pub fn level_pops(&mut self, atomic: &AtomicData, cell: &ModelCell) -> &[f64] {
        if !self.pops_valid {
            compute_level_pops(atomic, cell, &mut self.pops);
            self.pops_valid = true;
        }
        &self.pops
    }

    pub fn level_pop(
        &mut self,
        atomic: &AtomicData,
        cell: &ModelCell,
        element: usize,
        ion: usize,
        level: usize,
    ) -> f64 {
        let idx = atomic.uniquelevelindex(element, ion, level);
        self.level_pops(atomic, cell)[idx]
    }

    /// Cooling-term vector, its cumulative form and the total [erg/s/cm^3].
    pub fn cooling(
        &mut self,
        atomic: &AtomicData,
        layout: &[CoolingChannel],
        cell: &ModelCell,
    ) -> (&[f64], &[f64], f64) {
        if !self.cooling_valid {
            if !self.pops_valid {
                compute_level_pops(atomic, cell, &mut self.pops);
                self.pops_valid = true;
            }
            compute_cooling(atomic, layout, cell, &self.pops, &mut self.cooling);
            let mut running = 0.;
            for (i, &c) in self.cooling.iter().enumerate() {
                running += c;
                self.cooling_cumulative[i] = running;
            }
            self.cooling_total = running;
            self.cooling_valid = true;
        }
        (&self.cooling, &self.cooling_cumulative, self.cooling_total)
    }

    /// Bound-free opacity at comoving frequency `nu` [1/cm], with the
    /// per-continuum contributions kept for inverse-CDF sampling of the
    /// absorbing continuum.
    pub fn chi_bf(
        &mut self,
        atomic: &AtomicData,
        cell: &ModelCell,
        nu: f64,
    ) -> (f64, &[f64]) {
        if self.chi_bf_nu != nu {
            if !self.pops_valid {
                compute_level_pops(atomic, cell, &mut self.pops);
                self.pops_valid = true;
            }
            let mut total = 0.;
            for (i, cont) in atomic.allcont.iter().enumerate() {
                let contrib = if nu >= cont.nu_edge {
                    let element = cont.element as usize;
                    let ion = cont.ion as usize;
                    let level = cont.level as usize;
                    let n_level =
                        self.pops[atomic.uniquelevelindex(element, ion, level)];
                    let sigma = atomic
                        .photoionization_crosssection(atomic.level(element, ion, level), nu);
                    let probability = atomic.phixsprobability(
                        element,
                        ion,
                        level,
                        cont.phixstargetindex as usize,
                    );
                    // stimulated correction is left to detailed balance in
                    // the solvers; transport sees the raw absorption
                    n_level * sigma * probability
                } else {
                    0.
                };
                total += contrib;
                self.chi_bf_contribs[i] = total; // stored cumulatively
            }
            self.chi_bf_total = total;
            self.chi_bf_nu = nu;
        }
        (self.chi_bf_total, &self.chi_bf_contribs)
    }
}

/// LTE level populations with NLTE overrides where the solver has run.
/// Metastable levels follow a Boltzmann distribution at T_e; radiatively
/// coupled levels are diluted by W at T_R.
pub(crate) fn compute_level_pops(atomic: &AtomicData, cell: &ModelCell, pops: &mut [f64]) {
    for element in 0..atomic.nelements() {
        for ion in 0..atomic.nions(element) {
            let uii = atomic.uniqueionindex(element, ion);
            let n_ground = cell.groundlevelpops.get(uii).copied().unwrap_or(0.);
            let g0 = atomic.stat_weight(element, ion, 0);
            let e0 = atomic.epsilon(element, ion, 0);
            let first_nlte = atomic.ion(element, ion).first_nlte;

            for level in 0..atomic.nlevels(element, ion) {
                let idx = atomic.uniquelevelindex(element, ion, level);
                if level == 0 {
                    pops[idx] = n_ground;
                    continue;
                }

                if atomic.is_nlte(element, ion, level) {
                    let slot = first_nlte + level - 1;
                    if let Some(&pop) = cell.nlte_pops.get(slot) {
                        if pop >= 0. {
                            pops[idx] = pop.max(options::MINPOP);
                            continue;
                        }
                    }
                }

                let lv = atomic.level(element, ion, level);
                let de = lv.epsilon - e0;
                let (t_exc, dilution) = if lv.metastable {
                    (cell.t_e, 1.)
                } else {
                    (cell.t_r, cell.w)
                };
                let pop = if t_exc > 0. {
                    n_ground * dilution * lv.stat_weight / g0 * (-de / (KB * t_exc)).exp()
                } else {
                    0.
                };
                pops[idx] = pop.max(options::MINPOP);
            }
        }
    }
}

pub(crate) fn compute_cooling(
    atomic: &AtomicData,
    layout: &[CoolingChannel],
    cell: &ModelCell,
    pops: &[f64],
    cooling: &mut [f64],
) {
    let t_e = cell.t_e.max(options::MINTEMP);
    let nne = cell.nne;
    for (i, channel) in layout.iter().enumerate() {
        cooling[i] = match *channel {
            CoolingChannel::FreeFree { element, ion } => {
                let charge = (atomic.ionstage(element as usize, ion as usize) - 1) as f64;
                let n_ion = cell
                    .ion_pops
                    .get(atomic.uniqueionindex(element as usize, ion as usize))
                    .copied()
                    .unwrap_or(0.);
                FF_COOLING_COEFF * charge * charge * n_ion * nne * t_e.sqrt()
            }
            CoolingChannel::BoundFree {
                element,
                ion,
                level,
                target,
            } => {
                let (element, ion, level, target) =
                    (element as usize, ion as usize, level as usize, target as usize);
                let upperlevel = atomic.phixsupperlevel(element, ion, level, target);
                let n_upper = pops[atomic.uniquelevelindex(element, ion + 1, upperlevel)];
                n_upper
                    * nne
                    * ratecoeff::bfcooling_coeff(atomic, element, ion, level, target, t_e)
            }
            CoolingChannel::ColIonization {
                element,
                ion,
                level,
                target,
            } => {
                let (element, ion, level, target) =
                    (element as usize, ion as usize, level as usize, target as usize);
                let n_level = pops[atomic.uniquelevelindex(element, ion, level)];
                let e_threshold = atomic.phixs_threshold(element, ion, level);
                let _ = target;
                n_level
                    * nne
                    * ratecoeff::col_ionization_coeff(atomic, element, ion, level, t_e)
                    * e_threshold
            }
            CoolingChannel::ColExcitation {
                element,
                ion,
                level,
            } => {
                let (element, ion, level) = (element as usize, ion as usize, level as usize);
                let n_level = pops[atomic.uniquelevelindex(element, ion, level)];
                let mut c = 0.;
                for &lineidx in &atomic.level(element, ion, level).uptrans_lineindices {
                    let line = atomic.line(lineidx as usize);
                    let de = atomic.epsilon(element, ion, line.upperlevelindex as usize)
                        - atomic.epsilon(element, ion, level);
                    c += n_level * nne * ratecoeff::col_excitation_coeff(atomic, line, t_e) * de;
                }
                c
            }
        };
        if !cooling[i].is_finite() || cooling[i] < 0. {
            cooling[i] = 0.;
        }
    }
}

/// Free-free opacity at comoving frequency `nu` [1/cm] (Kramers form with
/// unit Gaunt factor).
pub fn chi_ff(atomic: &AtomicData, cell: &ModelCell, nu: f64) -> f64 {
    if cell.t_e <= 0. || nu <= 0. {
        return 0.;
    }
    let mut nnionsq = 0.;
    for element in 0..atomic.nelements() {
        for ion in 0..atomic.nions(element) {
            let charge = (atomic.ionstage(element, ion) - 1) as f64;
            if charge <= 0. {
                continue;
            }
            let n_ion = cell
                .ion_pops
                .get(atomic.uniqueionindex(element, ion))
                .copied()
                .unwrap_or(0.);
            nnionsq += charge * charge * n_ion;
        }
    }
    3.69255e8 * nnionsq * cell.nne / nu.powi(3) / cell.t_e.sqrt()
        * (1. - (-HOVERKB * nu / cell.t_e).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_cell_invalidates() {
        let atomic = AtomicData::empty();
        let mut history = CellHistory::new(&atomic);
        assert_eq!(history.cellnumber, -99);
        history.enter_cell(5);
        assert_eq!(history.cellnumber, 5);
        history.pops_valid = true;
        history.cooling_valid = true;
        history.enter_cell(5); // same cell: cache stays warm
        assert!(history.pops_valid);
        history.enter_cell(6); // new cell: everything dirty
        assert!(!history.pops_valid);
        assert!(!history.cooling_valid);
        assert!(history.chi_bf_nu.is_nan());
    }
}
