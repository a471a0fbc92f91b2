//! The macro-atom: internal transitions of an activated level coupling
//! bound-bound, bound-free and collisional channels with detailed balance.
//!
//! An activation walks the internal-transition chain until the atom
//! deactivates radiatively (line or continuum emission) or collisionally
//! (handing the packet energy to the thermal pool).

use rand::Rng;
use rand_pcg::Pcg64;

use crate::atomic::AtomicData;
use crate::model::ModelCell;
use crate::ratecoeff;

/// Where the macro-atom chain ends.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MacroAtomOutcome {
    /// radiative deactivation in a bound-bound line (sorted line index)
    EmitLine(usize),
    /// radiative recombination into (element, ion, level, target)
    EmitContinuum {
        element: usize,
        ion: usize,
        level: usize,
        target: usize,
    },
    /// collisional deactivation: the energy thermalises (k-packet)
    Thermalise,
}

const MAX_INTERNAL_JUMPS: usize = 1000;

/// Process an activation of (element, ion, level).
pub fn do_macroatom(
    atomic: &AtomicData,
    cell: &ModelCell,
    element: usize,
    mut ion: usize,
    mut level: usize,
    rng: &mut Pcg64,
) -> MacroAtomOutcome {
    let t_e = cell.t_e.max(crate::options::MINTEMP);
    let nne = cell.nne;

    for _ in 0..MAX_INTERNAL_JUMPS {
        let epsilon_current = atomic.epsilon(element, ion, level);

        // candidate processes out of the current state; each entry is
        // (rate, outcome-or-internal-target)
        enum Choice {
            DeactivateLine(usize),
            DeactivateColl,
            DeactivateContinuum(usize, usize), // (level, target) of the lower ion
            InternalDown(usize),               // line index
            InternalUp(usize),                 // line index
            InternalIonize(usize, usize),      // (level upper-ion, unused)
        }

        let mut rates: Vec<(f64, Choice)> = Vec::new();

        // bound-bound downward: radiative deactivation carries the
        // transition energy out; the internal share keeps epsilon_lower
        for &lineidx in &atomic.level(element, ion, level).downtrans_lineindices {
            let line = atomic.line(lineidx as usize);
            let lower = line.lowerlevelindex as usize;
            let epsilon_lower = atomic.epsilon(element, ion, lower);
            let de = epsilon_current - epsilon_lower;
            if de <= 0. {
                continue;
            }
            let r_rad = line.einstein_a * de;
            let r_coll = nne * ratecoeff::col_deexcitation_coeff(atomic, line, t_e) * de;
            rates.push((r_rad, Choice::DeactivateLine(lineidx as usize)));
            rates.push((r_coll, Choice::DeactivateColl));
            if epsilon_lower > 0. {
                let internal = (line.einstein_a
                    + nne * ratecoeff::col_deexcitation_coeff(atomic, line, t_e))
                    * epsilon_lower;
                rates.push((internal, Choice::InternalDown(lineidx as usize)));
            }
        }

        // bound-bound upward (collisional)
        for &lineidx in &atomic.level(element, ion, level).uptrans_lineindices {
            let line = atomic.line(lineidx as usize);
            let r = nne * ratecoeff::col_excitation_coeff(atomic, line, t_e) * epsilon_current.max(1e-30);
            rates.push((r, Choice::InternalUp(lineidx as usize)));
        }

        // ionisation upward (collisional; the radiative rate rides on the
        // same internal channel)
        if ion + 1 < atomic.nions(element) && level < atomic.ionisinglevels(element, ion) {
            for target in 0..atomic.nphixstargets(element, ion, level) {
                let upperlevel = atomic.phixsupperlevel(element, ion, level, target);
                let r = nne
                    * ratecoeff::col_ionization_coeff(atomic, element, ion, level, t_e)
                    * atomic.phixsprobability(element, ion, level, target)
                    * epsilon_current.max(1e-30);
                rates.push((r, Choice::InternalIonize(upperlevel, target)));
            }
        }

        // recombination downward (radiative deactivation into the continuum)
        if ion > 0 {
            for lowerlevel in 0..atomic.ionisinglevels(element, ion - 1) {
                for target in 0..atomic.nphixstargets(element, ion - 1, lowerlevel) {
                    if atomic.phixsupperlevel(element, ion - 1, lowerlevel, target) == level {
                        let r = nne
                            * ratecoeff::alpha_sp(atomic, element, ion - 1, lowerlevel, target, t_e)
                            * atomic.phixs_threshold(element, ion - 1, lowerlevel);
                        rates.push((r, Choice::DeactivateContinuum(lowerlevel, target)));
                    }
                }
            }
        }

        let total: f64 = rates.iter().map(|(r, _)| r.max(0.)).sum();
        if total <= 0. {
            // nowhere to go: a ground state with no channels thermalises
            return MacroAtomOutcome::Thermalise;
        }

        let mut zrand = rng.gen::<f64>() * total;
        let mut chosen = None;
        for (r, choice) in rates {
            if r <= 0. {
                continue;
            }
            if zrand < r {
                chosen = Some(choice);
                break;
            }
            zrand -= r;
        }

        match chosen {
            Some(Choice::DeactivateLine(lineidx)) => {
                return MacroAtomOutcome::EmitLine(lineidx);
            }
            Some(Choice::DeactivateColl) => return MacroAtomOutcome::Thermalise,
            Some(Choice::DeactivateContinuum(lowerlevel, target)) => {
                return MacroAtomOutcome::EmitContinuum {
                    element,
                    ion: ion - 1,
                    level: lowerlevel,
                    target,
                };
            }
            Some(Choice::InternalDown(lineidx)) => {
                level = atomic.line(lineidx).lowerlevelindex as usize;
            }
            Some(Choice::InternalUp(lineidx)) => {
                level = atomic.line(lineidx).upperlevelindex as usize;
            }
            Some(Choice::InternalIonize(upperlevel, _)) => {
                ion += 1;
                level = upperlevel;
            }
            None => return MacroAtomOutcome::Thermalise,
        }
    }

    log::warn!(
        "macro-atom chain exceeded {} internal jumps, thermalising",
        MAX_INTERNAL_JUMPS
    );
    MacroAtomOutcome::Thermalise
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::{Element, Ion, Level, Line};
    use crate::constant::EV;
    use crate::decay::RADIONUCLIDE_COUNT;
    use crate::options;
    use rand::SeedableRng;

    /// Two-level single-ion atom with one radiative line.
    fn two_level_atom() -> AtomicData {
        let mut data = AtomicData::empty();
        let de = 2. * EV;
        let ion = Ion {
            ionstage: 1,
            ionpot: 10. * EV,
            levels: vec![
                Level {
                    epsilon: 0.,
                    stat_weight: 2.,
                    metastable: true,
                    uptrans_lineindices: vec![0],
                    ..Default::default()
                },
                Level {
                    epsilon: de,
                    stat_weight: 4.,
                    metastable: false,
                    downtrans_lineindices: vec![0],
                    ..Default::default()
                },
            ],
            uniqueionindex: 0,
            uniquelevelindexstart: 0,
            alpha_sp: vec![0.; options::TABLESIZE],
            ..Default::default()
        };
        data.elements = vec![Element {
            anumber: 8,
            abundance: 1.,
            mass: 16. * crate::constant::MH,
            ions: vec![ion],
        }];
        data.linelist = vec![Line {
            elementindex: 0,
            ionindex: 0,
            lowerlevelindex: 0,
            upperlevelindex: 1,
            nu: de / crate::constant::H,
            einstein_a: 1e8,
            osc_strength: 0.5,
            coll_str: -1.,
            forbidden: false,
        }];
        data.includedions = 1;
        data.includedlevels = 2;
        data.build_line_lookup();
        data
    }

    fn cell() -> ModelCell {
        ModelCell {
            rho_init: 1e-14,
            ffegrp: 0.,
            radioabund_init: [0.; RADIONUCLIDE_COUNT],
            composition: vec![1.],
            t_e: 8000.,
            t_r: 8000.,
            t_j: 8000.,
            w: 1.,
            nne: 1e6,
            nnetot: 1e6,
            thick: false,
            ion_pops: vec![1e5],
            groundlevelpops: vec![1e5],
            nlte_pops: vec![],
        }
    }

    #[test]
    fn test_excited_two_level_atom_emits_its_line() {
        // with a strong A and weak collisions the activation must come out
        // as line emission
        let atomic = two_level_atom();
        let cell = cell();
        let mut rng = Pcg64::seed_from_u64(3);
        let mut line_emissions = 0;
        for _ in 0..200 {
            match do_macroatom(&atomic, &cell, 0, 0, 1, &mut rng) {
                MacroAtomOutcome::EmitLine(0) => line_emissions += 1,
                MacroAtomOutcome::Thermalise => {}
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert!(line_emissions > 190);
    }

    #[test]
    fn test_ground_state_with_no_channels_thermalises() {
        let mut atomic = two_level_atom();
        // strip the line list references so the ground state is isolated
        atomic.elements[0].ions[0].levels[0].uptrans_lineindices.clear();
        let cell = cell();
        let mut rng = Pcg64::seed_from_u64(4);
        assert_eq!(
            do_macroatom(&atomic, &cell, 0, 0, 0, &mut rng),
            MacroAtomOutcome::Thermalise
        );
    }

    #[test]
    fn test_collision_dominated_atom_thermalises_often() {
        let mut atomic = two_level_atom();
        atomic.linelist[0].einstein_a = 1e-3; // radiatively dead line
        let mut cell = cell();
        cell.nne = 1e12;
        let mut rng = Pcg64::seed_from_u64(5);
        let mut thermalised = 0;
        for _ in 0..200 {
            if do_macroatom(&atomic, &cell, 0, 0, 1, &mut rng) == MacroAtomOutcome::Thermalise {
                thermalised += 1;
            }
        }
        assert!(thermalised > 150);
    }
}
