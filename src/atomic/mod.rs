//! The atomic data store: elements, ions, levels, bound-bound lines and
//! bound-free continua, with the cross-indices every physics kernel needs.
//!
//! The store is built once by `ingest` and is immutable afterwards; all
//! cross-references are plain indices so the hot loops never chase pointers.

pub mod ingest;
pub mod phixslist;

use hashbrown::HashMap;

use crate::constant::H;
use crate::options;

/// Emission-type sentinel for free-free emission; bound-free continuum k is
/// encoded as -1-k and bound-bound lines use their non-negative line index.
pub const EMISSION_FREEFREE: i32 = -9999999;

/// Emission type of a packet that has not emitted yet.
pub const EMISSION_NONE: i32 = i32::MIN;

/// A photoionisation target: one upper-ion level reachable from a lower
/// level, with its branching probability and the rate-coefficient tables
/// attached by the `ratecoeff` module after ingest.
#[derive(Clone, Debug, Default)]
pub struct PhixsTarget {
    pub levelindex: u32,
    pub probability: f64,
    /// spontaneous recombination coefficient over the log-Te grid
    pub spontrecombcoeff: Vec<f64>,
    /// corrected photoionisation coefficient LUT (absent when computed
    /// directly from the binned radiation field)
    pub corrphotoioncoeff: Option<Vec<f64>>,
    /// bound-free heating coefficient LUT
    pub bfheating_coeff: Option<Vec<f64>>,
    /// bound-free cooling coefficient over the log-Te grid
    pub bfcooling_coeff: Vec<f64>,
}

#[derive(Clone, Debug, Default)]
pub struct Level {
    /// energy above the neutral ground state [erg]
    pub epsilon: f64,
    pub stat_weight: f64,
    /// true until a downward radiative transition is recorded
    pub metastable: bool,
    /// photoionisation threshold [erg]; zero when no cross-section table
    pub phixs_threshold: f64,
    /// cross-section table, log-uniform in nu/nu_edge [cm^2]
    pub photoion_xs: Vec<f32>,
    pub phixstargets: Vec<PhixsTarget>,
    /// indices into the sorted line list; during ingest these hold the
    /// negated partner-level index until the sort completes
    pub downtrans_lineindices: Vec<i32>,
    pub uptrans_lineindices: Vec<i32>,
    /// continuum index of the first phixs target, encoded as -1-k
    pub cont_index: i32,
    /// ground-level continuum estimator slot nearest to this level's edge
    pub closestgroundlevelcont: i32,
}

#[derive(Clone, Debug, Default)]
pub struct Ion {
    pub ionstage: i32,
    /// ionisation potential [erg]
    pub ionpot: f64,
    pub levels: Vec<Level>,
    /// levels below the ionisation potential (these have rate coefficients)
    pub ionisinglevels: usize,
    pub maxrecombininglevel: u32,
    pub nlevels_groundterm: usize,
    /// offset of this ion's block in the per-cell cooling-term vector
    pub coolingoffset: usize,
    pub ncoolingterms: usize,
    /// index of this ion's first slot in the NLTE population vector
    pub first_nlte: usize,
    /// number of explicitly tracked excited NLTE levels
    pub nlevels_nlte: usize,
    pub has_superlevel: bool,
    /// total spontaneous recombination coefficient over the log-Te grid
    pub alpha_sp: Vec<f64>,
    pub uniqueionindex: usize,
    pub uniquelevelindexstart: usize,
}

#[derive(Clone, Debug, Default)]
pub struct Element {
    pub anumber: i32,
    /// mass fraction (used when homogeneous abundances are active)
    pub abundance: f64,
    /// atomic mass [g]
    pub mass: f64,
    pub ions: Vec<Ion>,
}

/// One bound-bound transition in the frequency-sorted global line list.
#[derive(Clone, Debug)]
pub struct Line {
    pub elementindex: u32,
    pub ionindex: u32,
    pub lowerlevelindex: u32,
    pub upperlevelindex: u32,
    pub nu: f64,
    pub einstein_a: f64,
    pub osc_strength: f64,
    pub coll_str: f64,
    pub forbidden: bool,
}

/// Ground-level continuum, sorted by ascending edge frequency.
#[derive(Clone, Debug)]
pub struct GroundCont {
    pub element: u32,
    pub ion: u32,
    pub level: u32,
    pub phixstargetindex: u32,
    pub nu_edge: f64,
}

/// Entry in the full continuum list, sorted by ascending edge frequency.
#[derive(Clone, Debug)]
pub struct FullCont {
    pub element: u32,
    pub ion: u32,
    pub level: u32,
    pub phixstargetindex: u32,
    pub nu_edge: f64,
    pub index_in_groundphixslist: i32,
}

/// Reverse map from the global continuum index to its (element, ion, level,
/// target); continuum k is the packet emission type -1-k.
#[derive(Clone, Debug)]
pub struct BfListEntry {
    pub elementindex: u32,
    pub ionindex: u32,
    pub levelindex: u32,
    pub phixstargetindex: u32,
}

pub struct AtomicData {
    pub elements: Vec<Element>,
    pub linelist: Vec<Line>,
    /// (element, ion, lower, upper) -> sorted line index
    line_lookup: HashMap<(u32, u32, u32, u32), u32>,
    pub homogeneous_abundances: bool,
    pub nphixspoints: usize,
    /// spacing of the cross-section table in nu/nu_edge
    pub phixsnuincrement: f64,
    /// nu/nu_edge of the last table point
    pub last_phixs_nuovernuedge: f64,
    pub nbfcontinua: usize,
    pub nbfcontinua_ground: usize,
    pub groundcont: Vec<GroundCont>,
    pub allcont: Vec<FullCont>,
    pub bflist: Vec<BfListEntry>,
    pub includedions: usize,
    pub includedlevels: usize,
    pub ncoolingterms: usize,
    pub total_nlte_levels: usize,
    pub n_super_levels: usize,
}

impl AtomicData {
    /// An empty store: the starting point for ingest and for synthetic
    /// model atoms assembled in tests.
    pub fn empty() -> AtomicData {
        AtomicData {
            elements: Vec::new(),
            linelist: Vec::new(),
            line_lookup: HashMap::new(),
            homogeneous_abundances: false,
            nphixspoints: 0,
            phixsnuincrement: 0.,
            last_phixs_nuovernuedge: 0.,
            nbfcontinua: 0,
            nbfcontinua_ground: 0,
            groundcont: Vec::new(),
            allcont: Vec::new(),
            bflist: Vec::new(),
            includedions: 0,
            includedlevels: 0,
            ncoolingterms: 0,
            total_nlte_levels: 0,
            n_super_levels: 0,
        }
    }

    pub fn nelements(&self) -> usize {
        self.elements.len()
    }

    pub fn nions(&self, element: usize) -> usize {
        self.elements[element].ions.len()
    }

    pub fn ion(&self, element: usize, ion: usize) -> &Ion {
        &self.elements[element].ions[ion]
    }

    pub fn nlevels(&self, element: usize, ion: usize) -> usize {
        self.elements[element].ions[ion].levels.len()
    }

    pub fn level(&self, element: usize, ion: usize, level: usize) -> &Level {
        &self.elements[element].ions[ion].levels[level]
    }

    /// Level energy above the neutral ground state [erg].
    pub fn epsilon(&self, element: usize, ion: usize, level: usize) -> f64 {
        self.elements[element].ions[ion].levels[level].epsilon
    }

    pub fn stat_weight(&self, element: usize, ion: usize, level: usize) -> f64 {
        self.elements[element].ions[ion].levels[level].stat_weight
    }

    pub fn ionstage(&self, element: usize, ion: usize) -> i32 {
        self.elements[element].ions[ion].ionstage
    }

    /// Atomic number of element `element`.
    pub fn anumber(&self, element: usize) -> i32 {
        self.elements[element].anumber
    }

    /// Translate an atomic number into the element index, if included.
    pub fn elementindex(&self, z: i32) -> Option<usize> {
        self.elements.iter().position(|e| e.anumber == z)
    }

    pub fn ionisinglevels(&self, element: usize, ion: usize) -> usize {
        self.elements[element].ions[ion].ionisinglevels
    }

    pub fn nphixstargets(&self, element: usize, ion: usize, level: usize) -> usize {
        let ions = &self.elements[element].ions;
        if ion < ions.len() - 1 {
            ions[ion].levels[level].phixstargets.len()
        } else {
            0
        }
    }

    pub fn phixstarget(
        &self,
        element: usize,
        ion: usize,
        level: usize,
        target: usize,
    ) -> &PhixsTarget {
        &self.elements[element].ions[ion].levels[level].phixstargets[target]
    }

    pub fn phixsupperlevel(&self, element: usize, ion: usize, level: usize, target: usize) -> usize {
        self.phixstarget(element, ion, level, target).levelindex as usize
    }

    pub fn phixsprobability(&self, element: usize, ion: usize, level: usize, target: usize) -> f64 {
        self.phixstarget(element, ion, level, target).probability
    }

    /// Photoionisation threshold energy [erg] of (element, ion, level).
    pub fn phixs_threshold(&self, element: usize, ion: usize, level: usize) -> f64 {
        self.elements[element].ions[ion].levels[level].phixs_threshold
    }

    /// Photoionisation cross-section at rest frequency `nu` [cm^2].
    ///
    /// Below the edge the cross-section is zero; above the last table point
    /// it is extrapolated as nu^-3.
    pub fn photoionization_crosssection(&self, level: &Level, nu: f64) -> f64 {
        let nu_edge = level.phixs_threshold / H;
        if nu_edge <= 0. || nu < nu_edge || level.photoion_xs.is_empty() {
            return 0.;
        }
        let ratio = nu / nu_edge;
        if ratio >= self.last_phixs_nuovernuedge {
            let sigma_max = *level.photoion_xs.last().unwrap_or(&0.) as f64;
            let nu_max = self.last_phixs_nuovernuedge * nu_edge;
            return sigma_max * (nu_max / nu).powi(3);
        }
        let i = ((ratio - 1.) / self.phixsnuincrement) as usize;
        let i = i.min(self.nphixspoints - 1);
        level.photoion_xs[i] as f64
    }

    /// O(1) lookup of the sorted line index of (element, ion, lower, upper).
    pub fn lookup_line(
        &self,
        element: usize,
        ion: usize,
        lower: usize,
        upper: usize,
    ) -> Option<u32> {
        self.line_lookup
            .get(&(element as u32, ion as u32, lower as u32, upper as u32))
            .copied()
    }

    pub fn nlines(&self) -> usize {
        self.linelist.len()
    }

    pub fn line(&self, lineindex: usize) -> &Line {
        &self.linelist[lineindex]
    }

    /// Global continuum index of (element, ion, level, target) in the packet
    /// emission-type encoding -1-k.
    pub fn continuumindex(&self, element: usize, ion: usize, level: usize, target: usize) -> i32 {
        self.elements[element].ions[ion].levels[level].cont_index - target as i32
    }

    /// True when `level` of (element, ion) is tracked explicitly by the
    /// NLTE population solver.
    pub fn is_nlte(&self, element: usize, ion: usize, level: usize) -> bool {
        options::NLTE_POPS_ON
            && level > 0
            && level <= options::NLTE_LEVELS_MAX
            && level < self.nlevels(element, ion)
    }

    pub fn ion_has_superlevel(&self, element: usize, ion: usize) -> bool {
        self.elements[element].ions[ion].has_superlevel
    }

    /// Total number of explicitly tracked levels (flat cell-history index
    /// space).
    pub fn total_levels(&self) -> usize {
        self.includedlevels
    }

    pub fn uniquelevelindex(&self, element: usize, ion: usize, level: usize) -> usize {
        self.elements[element].ions[ion].uniquelevelindexstart + level
    }

    pub fn uniqueionindex(&self, element: usize, ion: usize) -> usize {
        self.elements[element].ions[ion].uniqueionindex
    }

    pub(crate) fn build_line_lookup(&mut self) {
        let mut map = HashMap::with_capacity(self.linelist.len());
        for (k, line) in self.linelist.iter().enumerate() {
            map.insert(
                (
                    line.elementindex,
                    line.ionindex,
                    line.lowerlevelindex,
                    line.upperlevelindex,
                ),
                k as u32,
            );
        }
        self.line_lookup = map;
    }
}
