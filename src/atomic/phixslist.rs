//! Bound-free continuum indexing.
//!
//! Assigns the global continuum index of every (element, ion, level, target)
//! in a single deterministic walk, builds the edge-sorted ground-level and
//! full continuum lists used by the transport opacity kernels, sizes the
//! per-cell cooling-term vector, lays out the NLTE population slots, and
//! writes `bflist.dat`.

use std::path::Path;

use log::{info, warn};

use crate::constant::H;
use crate::errors::IngestError;
use crate::options;

use super::{AtomicData, BfListEntry, FullCont, GroundCont};

pub(crate) fn setup(data: &mut AtomicData, dir: &Path, rank: usize) -> Result<(), IngestError> {
    assign_continuum_indices(data);
    setup_coolinglist(data);
    setup_nlte_slots(data);
    setup_ground_and_full_lists(data);
    write_bflist_file(data, dir, rank)?;
    Ok(())
}

/// The global bound-free continuum index for (element, ion, level, target)
/// is assigned by this walk; continuum k doubles as the packet emission
/// type -1-k, distinguishing continuum emission from lines (+line index)
/// and free-free (sentinel).
fn assign_continuum_indices(data: &mut AtomicData) {
    let mut cont_index: i32 = -1;
    let mut bflist = Vec::with_capacity(data.nbfcontinua);
    for element in 0..data.nelements() {
        let nions = data.nions(element);
        for ion in 0..nions {
            for level in 0..data.ionisinglevels(element, ion) {
                let ntargets = data.nphixstargets(element, ion, level);
                data.elements[element].ions[ion].levels[level].cont_index = cont_index;
                for target in 0..ntargets {
                    bflist.push(BfListEntry {
                        elementindex: element as u32,
                        ionindex: ion as u32,
                        levelindex: level as u32,
                        phixstargetindex: target as u32,
                    });
                }
                cont_index -= ntargets as i32;
            }

            // all levels of the ground term should be photoionisation
            // targets from the ground state of the lower ion
            if ion > 0 && ion < nions - 1 && data.nphixstargets(element, ion - 1, 0) > 0 {
                let nlevels_groundterm = data.ion(element, ion).nlevels_groundterm;
                if data.phixsupperlevel(element, ion - 1, 0, 0) == 0 {
                    let ntargets = data.nphixstargets(element, ion - 1, 0);
                    let phixstargetlevels =
                        data.phixsupperlevel(element, ion - 1, 0, ntargets - 1) + 1;
                    if nlevels_groundterm != phixstargetlevels {
                        warn!(
                            "Z={} ion stage {}: nlevels_groundterm {} != phixstargetlevels(ion-1) {}",
                            data.anumber(element),
                            data.ionstage(element, ion),
                            nlevels_groundterm,
                            phixstargetlevels
                        );
                    }
                }
            }
        }
    }
    data.bflist = bflist;
    info!("last continuum index {}", cont_index);
}

/// Number of processes by which k-packets convert to something else: one
/// free-free term for ionised stages, a bound-free and a collisional
/// ionisation term per photoionisation target, and one collisional
/// excitation term per level (all upper levels combined).
fn setup_coolinglist(data: &mut AtomicData) {
    let mut ncoolingterms = 0usize;
    for element in 0..data.nelements() {
        let nions = data.nions(element);
        for ion in 0..nions {
            let mut ionterms = 0usize;
            data.elements[element].ions[ion].coolingoffset = ncoolingterms;
            if data.ionstage(element, ion) > 1 {
                ionterms += 1;
            }
            for level in 0..data.nlevels(element, ion) {
                if ion < nions - 1 {
                    ionterms += 2 * data.nphixstargets(element, ion, level);
                }
                ionterms += 1;
            }
            data.elements[element].ions[ion].ncoolingterms = ionterms;
            ncoolingterms += ionterms;
        }
    }
    data.ncoolingterms = ncoolingterms;
    info!("number of coolingterms {}", ncoolingterms);
}

/// Lay out the per-cell NLTE population vector: one slot per explicitly
/// tracked excited level, plus a superlevel slot for ions with levels
/// beyond the explicit set.
fn setup_nlte_slots(data: &mut AtomicData) {
    let mut total_nlte_levels = 0usize;
    let mut n_super_levels = 0usize;

    if options::NLTE_POPS_ON {
        for element in 0..data.nelements() {
            for ion in 0..data.nions(element) {
                data.elements[element].ions[ion].first_nlte = total_nlte_levels;
                let nlevels = data.nlevels(element, ion);
                let mut fullnlteexcitedlevelcount = 0;
                for level in 1..nlevels {
                    if data.is_nlte(element, ion, level) {
                        fullnlteexcitedlevelcount += 1;
                        total_nlte_levels += 1;
                    }
                }

                let has_superlevel = nlevels > fullnlteexcitedlevelcount + 1;
                if has_superlevel {
                    total_nlte_levels += 1;
                    n_super_levels += 1;
                }

                data.elements[element].ions[ion].nlevels_nlte = fullnlteexcitedlevelcount;
                data.elements[element].ions[ion].has_superlevel = has_superlevel;

                info!(
                    "Z={} ion stage {} has {} NLTE excited levels{}, starting at {}",
                    data.anumber(element),
                    data.ionstage(element, ion),
                    fullnlteexcitedlevelcount,
                    if has_superlevel { " plus a superlevel" } else { "" },
                    data.ion(element, ion).first_nlte
                );
            }
        }
    }

    data.total_nlte_levels = total_nlte_levels;
    data.n_super_levels = n_super_levels;
    info!(
        "total NLTE levels: {}, of which {} are superlevels",
        total_nlte_levels, n_super_levels
    );
}

fn setup_ground_and_full_lists(data: &mut AtomicData) {
    info!("number of bf continua {}", data.nbfcontinua);
    info!("number of ground-level bf continua {}", data.nbfcontinua_ground);

    let mut groundcont = Vec::with_capacity(data.nbfcontinua_ground);
    for element in 0..data.nelements() {
        let nions = data.nions(element);
        for ion in 0..nions.saturating_sub(1) {
            let nlevels_groundterm = data.ion(element, ion).nlevels_groundterm;
            for level in 0..nlevels_groundterm.min(data.nlevels(element, ion)) {
                for target in 0..data.nphixstargets(element, ion, level) {
                    let nu_edge = data.phixs_threshold(element, ion, level) / H;
                    groundcont.push(GroundCont {
                        element: element as u32,
                        ion: ion as u32,
                        level: level as u32,
                        phixstargetindex: target as u32,
                        nu_edge,
                    });
                }
            }
        }
    }
    groundcont.sort_by(|a, b| a.nu_edge.total_cmp(&b.nu_edge));
    data.groundcont = groundcont;

    let mut allcont = Vec::with_capacity(data.nbfcontinua);
    for element in 0..data.nelements() {
        let nions = data.nions(element);
        for ion in 0..nions.saturating_sub(1) {
            for level in 0..data.ionisinglevels(element, ion) {
                for target in 0..data.nphixstargets(element, ion, level) {
                    let nu_edge = data.phixs_threshold(element, ion, level) / H;
                    let (index_in_ground, groundlevelcont) =
                        search_groundphixslist(data, nu_edge, element, ion, level);
                    if target == 0 {
                        data.elements[element].ions[ion].levels[level].closestgroundlevelcont =
                            groundlevelcont;
                    }
                    allcont.push(FullCont {
                        element: element as u32,
                        ion: ion as u32,
                        level: level as u32,
                        phixstargetindex: target as u32,
                        nu_edge,
                        index_in_groundphixslist: index_in_ground,
                    });
                }
            }
        }
    }
    allcont.sort_by(|a, b| a.nu_edge.total_cmp(&b.nu_edge));
    data.allcont = allcont;
}

/// Return the ground-level continuum index closest to the given edge
/// frequency, and the (element*maxion + ion) estimator slot it belongs to.
/// An edge redder than the reddest ground continuum yields (-1, -1).
///
/// When the edge lies above the bluest entry the top index is returned with
/// a warning rather than failing; this is an ingest-data consistency check
/// (it can only trip when a non-ground level has a bluer edge than every
/// ground-term level, e.g. multiple levels at zero energy).
fn search_groundphixslist(
    data: &AtomicData,
    nu_edge: f64,
    el: usize,
    in_ion: usize,
    ll: usize,
) -> (i32, i32) {
    if data.groundcont.is_empty() || nu_edge < data.groundcont[0].nu_edge {
        return (-1, -1);
    }

    let n = data.groundcont.len();
    let mut i = 1;
    while i < n {
        if nu_edge < data.groundcont[i].nu_edge {
            break;
        }
        i += 1;
    }

    let index;
    let element;
    let ion;
    if i == n {
        let top = &data.groundcont[n - 1];
        element = top.element as usize;
        ion = top.ion as usize;
        if !(element == el && ion == in_ion && top.level as usize == ll) {
            warn!(
                "element {} ion {} level {} has edge frequency {:e} above the bluest ground-level continuum (element {} ion {} level {}); taking the top entry - check the atomic data consistency",
                el, in_ion, ll, nu_edge, element, ion, top.level
            );
        }
        index = (n - 1) as i32;
    } else {
        let left_diff = nu_edge - data.groundcont[i - 1].nu_edge;
        let right_diff = data.groundcont[i].nu_edge - nu_edge;
        let idx = if left_diff <= right_diff { i - 1 } else { i };
        element = data.groundcont[idx].element as usize;
        ion = data.groundcont[idx].ion as usize;
        index = idx as i32;
    }

    let estimator_slot = (element * options::MIONS + ion) as i32;
    (index, estimator_slot)
}

/// `bflist.dat`: one line per continuum (global index, element, ion, level,
/// upper level), preceded by the continuum count.
fn write_bflist_file(data: &AtomicData, dir: &Path, rank: usize) -> Result<(), IngestError> {
    if rank != 0 {
        return Ok(());
    }
    let path = dir.join("bflist.dat");
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b' ')
        .has_headers(false)
        .flexible(true)
        .from_path(&path)
        .map_err(|e| IngestError::Inconsistent(format!("cannot write bflist.dat: {}", e)))?;

    writer
        .write_record(&[data.nbfcontinua.to_string()])
        .map_err(|e| IngestError::Inconsistent(format!("cannot write bflist.dat: {}", e)))?;

    for (i, entry) in data.bflist.iter().enumerate() {
        let upperionlevel = data.phixsupperlevel(
            entry.elementindex as usize,
            entry.ionindex as usize,
            entry.levelindex as usize,
            entry.phixstargetindex as usize,
        );
        debug_assert_eq!(
            -1 - (i as i32),
            data.continuumindex(
                entry.elementindex as usize,
                entry.ionindex as usize,
                entry.levelindex as usize,
                entry.phixstargetindex as usize
            )
        );
        writer
            .write_record(&[
                i.to_string(),
                entry.elementindex.to_string(),
                entry.ionindex.to_string(),
                entry.levelindex.to_string(),
                upperionlevel.to_string(),
            ])
            .map_err(|e| IngestError::Inconsistent(format!("cannot write bflist.dat: {}", e)))?;
    }
    writer
        .flush()
        .map_err(|e| IngestError::Inconsistent(format!("cannot write bflist.dat: {}", e)))?;
    Ok(())
}
