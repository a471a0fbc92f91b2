//! The packet pool: pellet initialisation and checkpointing.
//!
//! Pellets are placed by inverse-CDF sampling of the cumulative
//! mass x energy-per-gram table over the propagation cells. A pellet whose
//! decay time falls outside the simulated window is resampled in place;
//! afterwards every pellet's comoving energy is renormalised by
//! N/(N + N_resampled) so the total ejected energy is conserved.

use std::path::{Path, PathBuf};

use log::info;
use rand::Rng;

use crate::decay::{self, Radionuclide};
use crate::errors::IngestError;
use crate::grid::{Cross, PropagationGrid};
use crate::model::Model;
use crate::options;
use crate::packet::{Packet, PacketKind};

/// One candidate decay a pellet can represent, with its energy share.
struct PelletSource {
    nuclide: Radionuclide,
    /// fed by an undecayed parent (two-stage decay time)
    parent: Option<Radionuclide>,
    weight: f64,
}

fn pellet_sources(radioabund_init: &[f64; decay::RADIONUCLIDE_COUNT]) -> Vec<PelletSource> {
    let mut sources = Vec::new();
    for chain in &decay::CHAINS {
        let f_parent = radioabund_init[chain.parent.index()];
        if f_parent > 0. {
            sources.push(PelletSource {
                nuclide: chain.parent,
                parent: None,
                weight: f_parent * chain.parent.endecay_total() / chain.parent.nucmass(),
            });
            sources.push(PelletSource {
                nuclide: chain.daughter,
                parent: Some(chain.parent),
                weight: f_parent * chain.daughter.endecay_total() / chain.parent.nucmass(),
            });
        }
        let f_daughter = radioabund_init[chain.daughter.index()];
        if f_daughter > 0. {
            sources.push(PelletSource {
                nuclide: chain.daughter,
                parent: None,
                weight: f_daughter * chain.daughter.endecay_total() / chain.daughter.nucmass(),
            });
        }
    }
    sources
}

/// Initialise the pellet ensemble for a new simulation.
pub fn setup_packets<R: Rng + ?Sized>(
    npkts: usize,
    model: &Model,
    grid: &PropagationGrid,
    tmin: f64,
    tmax: f64,
    rng: &mut R,
) -> Result<Vec<Packet>, IngestError> {
    if npkts > options::MPKTS {
        return Err(IngestError::ResourceLimit(format!(
            "too many packets ({} > {})",
            npkts,
            options::MPKTS
        )));
    }

    // cumulative mass x energy-per-gram table over the propagation cells
    let mut cont = Vec::with_capacity(grid.ngrid + 1);
    let mut norm = 0.;
    for n in 0..grid.ngrid {
        cont.push(norm);
        let mgi = grid.cell_modelgridindex(n);
        if mgi < model.empty_cell_index() {
            norm += model.rho_init(mgi)
                * grid.cellvolume_init[n]
                * decay::pellet_energy_per_mass(&model.cells[mgi].radioabund_init);
        }
    }
    cont.push(norm);
    if norm <= 0. {
        return Err(IngestError::Inconsistent(
            "no radioactive energy anywhere in the model".to_string(),
        ));
    }

    let etot: f64 = (0..model.npts_model)
        .map(|mgi| {
            model.rho_init(mgi)
                * model.cellvolume_init[mgi]
                * decay::pellet_energy_per_mass(&model.cells[mgi].radioabund_init)
        })
        .sum();
    info!("etot {:e} erg", etot);
    let e0 = etot / npkts as f64;
    info!("e0 {:e} erg", e0);

    let mut packets = Vec::with_capacity(npkts);
    let mut packet_reset = 0u64;

    for n in 0..npkts {
        loop {
            // pick the cell from the cumulative table
            let zrand: f64 = rng.gen::<f64>();
            let target = zrand * norm;
            let cellindex = match cont.binary_search_by(|probe| probe.total_cmp(&target)) {
                Ok(i) => i,
                Err(i) => i - 1,
            }
            .min(grid.ngrid - 1);

            let mgi = grid.cell_modelgridindex(cellindex);
            if mgi >= model.empty_cell_index() {
                continue;
            }

            let mut pkt = Packet::placeholder(n as u32);
            pkt.cellindex = cellindex as u32;
            pkt.pos = grid.sample_pos_in_cell(cellindex, rng);
            pkt.prop_time = tmin;
            pkt.last_cross = Cross::None;
            pkt.e_cmf = e0;

            place_pellet(&mut pkt, &model.cells[mgi].radioabund_init, rng);

            if pkt.tdecay > tmin && pkt.tdecay < tmax {
                packets.push(pkt);
                break;
            }
            packet_reset += 1;
        }
    }

    // energy renormalisation for the resampled fraction
    let renorm = npkts as f64 / (npkts as f64 + packet_reset as f64);
    for pkt in packets.iter_mut() {
        pkt.e_cmf *= renorm;
        pkt.interactions = 0;
    }
    info!(
        "radioactive energy which will be freed during the simulation {:e} erg ({} pellets resampled)",
        etot * renorm,
        packet_reset
    );

    Ok(packets)
}

/// Choose what the pellet represents and when it decays. Chain selection,
/// the decay step within the chain, and the gamma/positron split each
/// consume an independent random draw.
fn place_pellet<R: Rng + ?Sized>(
    pkt: &mut Packet,
    radioabund_init: &[f64; decay::RADIONUCLIDE_COUNT],
    rng: &mut R,
) {
    let sources = pellet_sources(radioabund_init);
    let total: f64 = sources.iter().map(|s| s.weight).sum();

    let mut pick = rng.gen::<f64>() * total;
    let mut chosen = &sources[sources.len() - 1];
    for source in &sources {
        if pick < source.weight {
            chosen = source;
            break;
        }
        pick -= source.weight;
    }

    // gamma or positron pellet, by energy share of that decay
    let e_gamma = chosen.nuclide.endecay_gamma();
    let e_pos = chosen.nuclide.endecay_positron();
    let zrand: f64 = rng.gen::<f64>();
    let positron = e_pos > 0. && zrand < e_pos / (e_gamma + e_pos);

    pkt.kind = PacketKind::Pellet {
        nuclide: chosen.nuclide,
        positron,
    };
    pkt.tdecay = match chosen.parent {
        None => decay::sample_parent_decay_time(chosen.nuclide, rng),
        Some(parent) => {
            let chain = decay::CHAINS
                .iter()
                .find(|c| c.parent == parent)
                .expect("chain of parent nuclide");
            decay::sample_daughter_decay_time(chain, rng)
        }
    };
}

/// `packets{iteration}_{rank}_odd.tmp`
pub fn checkpoint_path(dir: &Path, iteration: usize, rank: usize) -> PathBuf {
    dir.join(format!("packets{}_{}_odd.tmp", iteration, rank))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constant::DAY;
    use crate::model::{read_ejecta_model, ModelType};
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    /// Two shells: all 56Ni in the inner one, nothing in the outer one.
    fn two_cell_model(tmin: f64) -> (Model, PropagationGrid) {
        let path = std::env::temp_dir().join(format!("snmc_pool_{}.txt", std::process::id()));
        std::fs::write(
            &path,
            "2\n1.0\n1 5000 0.0 1.0 1.0 0.0 0.0 0.0\n2 10000 0.0 0.0 0.0 0.0 0.0 0.0\n",
        )
        .unwrap();
        let model = read_ejecta_model(&path, ModelType::Spherical1D, tmin).unwrap();
        std::fs::remove_file(&path).ok();
        let grid = PropagationGrid::new_spherical(&model, tmin).unwrap();
        (model, grid)
    }

    #[test]
    fn test_pellets_land_in_the_radioactive_cell() {
        // S2: with 56Ni only in cell 0, every pellet starts there
        let tmin = 1. * DAY;
        let (model, grid) = two_cell_model(tmin);
        let mut rng = Pcg64::seed_from_u64(21);
        let npkts = 10_000;
        let packets =
            setup_packets(npkts, &model, &grid, tmin, 10_000. * DAY, &mut rng).unwrap();
        assert_eq!(packets.len(), npkts);
        for pkt in &packets {
            assert_eq!(pkt.cellindex, 0);
            assert!(pkt.pos.norm() <= grid.shell_radii_init[0] * (1. + 1e-12));
        }
    }

    #[test]
    fn test_nickel_pellet_decay_time_mean() {
        let tmin = 0.01 * DAY;
        let (model, grid) = two_cell_model(tmin);
        let mut rng = Pcg64::seed_from_u64(22);
        let packets =
            setup_packets(20_000, &model, &grid, tmin, 10_000. * DAY, &mut rng).unwrap();

        // pellets representing the parent decay have mean life tau(56Ni)
        let ni_times: Vec<f64> = packets
            .iter()
            .filter_map(|p| match p.kind {
                PacketKind::Pellet {
                    nuclide: Radionuclide::Ni56,
                    ..
                } => Some(p.tdecay),
                _ => None,
            })
            .collect();
        assert!(ni_times.len() > 1000);
        let mean = ni_times.iter().sum::<f64>() / ni_times.len() as f64;
        let tau = Radionuclide::Ni56.meanlife();
        assert_approx_eq!(mean, tau, 0.05 * tau);

        // and the cobalt pellets are two-stage, so they decay later on
        // average
        let co_times: Vec<f64> = packets
            .iter()
            .filter_map(|p| match p.kind {
                PacketKind::Pellet {
                    nuclide: Radionuclide::Co56,
                    ..
                } => Some(p.tdecay),
                _ => None,
            })
            .collect();
        assert!(!co_times.is_empty());
        let mean_co = co_times.iter().sum::<f64>() / co_times.len() as f64;
        assert!(mean_co > mean);
    }

    #[test]
    fn test_resampling_renormalises_energy() {
        // a narrow decay window forces resampling; the summed pellet
        // energy must come out as etot * N/(N + N_reset)
        let tmin = 1. * DAY;
        let (model, grid) = two_cell_model(tmin);
        let mut rng = Pcg64::seed_from_u64(23);
        let npkts = 5_000;
        let packets = setup_packets(npkts, &model, &grid, tmin, 12. * DAY, &mut rng).unwrap();

        let etot: f64 = (0..model.npts_model)
            .map(|mgi| {
                model.rho_init(mgi)
                    * model.cellvolume_init[mgi]
                    * decay::pellet_energy_per_mass(&model.cells[mgi].radioabund_init)
            })
            .sum();
        let e_sum: f64 = packets.iter().map(|p| p.e_cmf).sum();
        // all pellets within the window, and total below the full etot
        assert!(e_sum < etot);
        for pkt in &packets {
            assert!(pkt.tdecay > tmin && pkt.tdecay < 12. * DAY);
        }
        // consistency of the renormalisation: e_cmf is uniform
        let e0 = packets[0].e_cmf;
        for pkt in &packets {
            assert_approx_eq!(pkt.e_cmf, e0, e0 * 1e-12);
        }
    }
}
