//! The engine: owns the atomic data store, the grids, the packet ensemble
//! and the estimators, and drives the per-timestep control flow
//!
//!   inject pellets -> transport packets -> reduce estimators ->
//!   reconstruct the radiation field -> refresh rate coefficients ->
//!   non-thermal and NLTE solves -> next timestep.

use std::path::PathBuf;

use anyhow::Context;
use log::info;
use rand::SeedableRng;
use rand_pcg::Pcg64;

use crate::atomic::{self, AtomicData};
use crate::cellhistory::{self, CoolingChannel};
use crate::constant::SIGMA_T;
use crate::decay;
use crate::estimators::Estimators;
use crate::grid::PropagationGrid;
use crate::input::{self, RunParameters};
use crate::model::{self, Model, ModelType};
use crate::nonthermal::{self, SfGrid, SpencerFanoSolution};
use crate::nltepop;
use crate::options;
use crate::packet::{self, Packet};
use crate::pool;
use crate::radfield::{self, CellRadField, RadFieldBins};
use crate::ratecoeff;
use crate::timesteps::{self, TimeStep};
use crate::transport::{self, TransportContext};

/// Number of packets of a default run; bounded by the compiled limit.
pub const DEFAULT_NPKTS: usize = options::MPKTS;

/// Initial guess for the matter temperatures before the first radiation
/// field fit exists [K].
const T_INITIAL: f64 = 6000.;

/// Timesteps between packet checkpoints.
const CHECKPOINT_INTERVAL: usize = 10;

pub struct Simulation {
    pub atomic: AtomicData,
    pub model: Model,
    pub grid: PropagationGrid,
    pub bins: RadFieldBins,
    pub cooling_layout: Vec<CoolingChannel>,
    pub params: RunParameters,
    pub timesteps: Vec<TimeStep>,
    pub packets: Vec<Packet>,
    pub estimators: Estimators,
    pub fields: Vec<CellRadField>,
    pub sf_grid: SfGrid,
    pub nt_solutions: Vec<SpencerFanoSolution>,
    nt_steps_since_solve: Vec<usize>,
    nt_nne_per_ion_at_solve: Vec<f64>,
    pub rank: usize,
    pub dir: PathBuf,
}

impl Simulation {
    /// Load every input, build the grids and the packet ensemble.
    pub fn init(dir: PathBuf, rank: usize, npkts: usize) -> anyhow::Result<Simulation> {
        // the parameter file carries the seed on its first line, which the
        // file reader itself needs for the synthesis-direction fallback
        let seed = input::peek_seed(&dir.join("input.txt"))?;
        let mut rng = Pcg64::seed_from_u64(seed ^ (rank as u64).wrapping_mul(13));

        let params = input::read_parameterfile(&dir.join("input.txt"), &mut rng)
            .context("reading input.txt")?;

        let mut atomic =
            atomic::ingest::read_atomic_data(&dir, rank).context("reading the model atom")?;
        ratecoeff::setup_tables(&mut atomic);

        let timesteps = timesteps::time_init(params.tmin, params.tmax, params.ntstep);
        if rank == 0 {
            timesteps::write_timestep_file(&dir.join("timesteps.out"), &timesteps)
                .context("writing timesteps.out")?;
        }

        let mut model = model::read_ejecta_model(
            &dir.join("model.txt"),
            params.model_type,
            params.tmin,
        )
        .context("reading model.txt")?;

        let grid = match params.model_type {
            ModelType::Spherical1D => PropagationGrid::new_spherical(&model, params.tmin)?,
            ModelType::Cylindrical2D => PropagationGrid::new_uniform(&model, params.tmin, 50)?,
            ModelType::Cartesian3D => {
                let ncoord = model.ncoord1;
                PropagationGrid::new_uniform(&model, params.tmin, ncoord)?
            }
        };

        // initial matter state: composition from the decay products at
        // tmin, temperatures from the initial guess, populations from Saha
        for mgi in 0..model.npts_model {
            let rho = model.rho_init(mgi);
            let cell = &mut model.cells[mgi];
            cell.t_e = T_INITIAL;
            cell.t_r = T_INITIAL;
            cell.t_j = T_INITIAL;
            cell.w = 1.;
            update_cell_composition(&atomic, cell, params.tmin);
            nltepop::set_lte_populations(&atomic, cell, rho);
        }

        let detailed_lines = radfield::select_detailed_lines(&atomic);
        let estimators = Estimators::new(model.cells.len(), &atomic, detailed_lines);
        let cooling_layout = cellhistory::cooling_layout(&atomic);
        let bins = RadFieldBins::new();

        let packets = if params.simulation_continued_from_saved {
            let path = pool::checkpoint_path(&dir, 0, rank);
            info!("reading packet checkpoint {}", path.display());
            packet::read_packets_binary(&path)
                .with_context(|| format!("reading {}", path.display()))?
        } else {
            let packets = pool::setup_packets(
                npkts,
                &model,
                &grid,
                params.tmin,
                params.tmax,
                &mut rng,
            )?;
            let path = pool::checkpoint_path(&dir, 0, rank);
            packet::write_packets_binary(&path, &packets)
                .with_context(|| format!("writing {}", path.display()))?;
            packets
        };

        let fields = vec![CellRadField::default(); model.cells.len()];
        let nions = atomic.includedions;
        let ncells = model.cells.len();

        Ok(Simulation {
            atomic,
            model,
            grid,
            bins,
            cooling_layout,
            params,
            timesteps,
            packets,
            estimators,
            fields,
            sf_grid: SfGrid::new(),
            nt_solutions: vec![SpencerFanoSolution::zero(nions); ncells],
            nt_steps_since_solve: vec![usize::MAX / 2; ncells],
            nt_nne_per_ion_at_solve: vec![0.; ncells],
            rank,
            dir,
        })
    }

    /// Run the timestep loop from itstep to ftstep.
    pub fn run(&mut self) -> anyhow::Result<()> {
        let first = self.params.itstep;
        let last = self.params.ftstep.min(self.params.ntstep);

        for nts in first..last {
            let ts = self.timesteps[nts];
            info!(
                "timestep {} of {}: t = {:.3} d, width {:.3} d",
                nts,
                self.params.ntstep,
                ts.start / crate::constant::DAY,
                ts.width / crate::constant::DAY
            );

            self.update_grey_cells(nts, ts.mid);
            self.estimators.zero();

            let ctx = TransportContext {
                atomic: &self.atomic,
                model: &self.model,
                grid: &self.grid,
                bins: &self.bins,
                cooling_layout: &self.cooling_layout,
                params: &self.params,
                nts,
                t_end: ts.start + ts.width,
                ts_width: ts.width,
                rank: self.rank,
            };
            transport::update_packets(&ctx, &mut self.packets, &mut self.estimators);

            if self.estimators.invariant_failures > 0 {
                info!(
                    "{} packets dropped on invariant violations this timestep",
                    self.estimators.invariant_failures
                );
            }

            self.update_matter_state(nts, &ts)?;

            if (nts + 1) % CHECKPOINT_INTERVAL == 0 || nts + 1 == last {
                self.write_checkpoint(nts + 1)?;
            }
        }

        let escaped = self
            .packets
            .iter()
            .filter(|p| matches!(p.kind, crate::packet::PacketKind::Escaped))
            .count();
        info!(
            "simulation finished: {} of {} packets escaped",
            escaped,
            self.packets.len()
        );
        Ok(())
    }

    /// Cells above the Thomson-depth threshold run in the grey
    /// approximation for the first n_grey_timesteps.
    fn update_grey_cells(&mut self, nts: usize, t_mid: f64) {
        let tfact = t_mid / self.params.tmin;
        for mgi in 0..self.model.npts_model {
            let size = match self.grid.grid_type {
                crate::grid::GridType::Uniform3D => self.grid.wid_init * tfact,
                crate::grid::GridType::Spherical1D => {
                    let r_out = self.grid.shell_radii_init[mgi.min(self.grid.ngrid - 1)];
                    let r_in = if mgi == 0 {
                        0.
                    } else {
                        self.grid.shell_radii_init[mgi - 1]
                    };
                    (r_out - r_in) * tfact
                }
            };
            let cell = &mut self.model.cells[mgi];
            let tau_thomson = SIGMA_T * cell.nne * size;
            cell.thick = nts < self.params.n_grey_timesteps
                && tau_thomson > self.params.cell_is_optically_thick;
        }
    }

    /// Everything after the timestep barrier: radiation field fits, the
    /// Spencer-Fano trigger policy, NLTE populations and the T_e balance.
    fn update_matter_state(&mut self, nts: usize, ts: &TimeStep) -> anyhow::Result<()> {
        let t_mid = ts.mid;
        let dt = ts.width;
        let lte_phase = nts < self.params.n_lte_timesteps;

        for mgi in 0..self.model.npts_model {
            let volume =
                self.model.cellvolume_init[mgi] * (t_mid / self.params.tmin).powi(3);

            // radiation-field reconstruction from the estimators
            let field = radfield::fit_cell(&self.estimators, &self.bins, mgi, volume, dt);

            let rho = self.model.rho(mgi, t_mid, self.params.tmin);
            let dep_rate = (self.estimators.gamma_dep[mgi]
                + self.estimators.positron_dep[mgi])
                / volume
                / dt;

            {
                let cell = &mut self.model.cells[mgi];
                update_cell_composition(&self.atomic, cell, t_mid);

                if field.t_j > 0. {
                    cell.t_r = field.t_j;
                    cell.t_j = field.t_j;
                    cell.w = field.w;
                }
            }

            if lte_phase {
                let cell = &mut self.model.cells[mgi];
                if field.t_j > 0. {
                    cell.t_e = field.t_j;
                }
                nltepop::set_lte_populations(&self.atomic, cell, rho);
                self.fields[mgi] = field;
                continue;
            }

            // non-thermal re-solve trigger policy
            let nne_per_ion = {
                let cell = &self.model.cells[mgi];
                let n_ion_tot: f64 = cell.ion_pops.iter().sum();
                if n_ion_tot > 0. {
                    cell.nne / n_ion_tot
                } else {
                    0.
                }
            };
            if options::NT_ON
                && options::NT_SOLVE_SPENCERFANO
                && dep_rate > 0.
                && nonthermal::solution_due(
                    self.nt_steps_since_solve[mgi],
                    nne_per_ion,
                    self.nt_nne_per_ion_at_solve[mgi],
                    nts,
                )
            {
                let cell = &self.model.cells[mgi];
                let mut pops = vec![0.; self.atomic.total_levels()];
                cellhistory::compute_level_pops(&self.atomic, cell, &mut pops);
                let atomic = &self.atomic;
                let solution = nonthermal::solve(
                    atomic,
                    &self.sf_grid,
                    &cell.ion_pops,
                    &|element, ion, level| {
                        pops[atomic.uniquelevelindex(element, ion, level)]
                    },
                    cell.nne,
                );
                nonthermal::print_solution(&solution);
                self.nt_solutions[mgi] = solution;
                self.nt_steps_since_solve[mgi] = 0;
                self.nt_nne_per_ion_at_solve[mgi] = nne_per_ion;
            } else {
                self.nt_steps_since_solve[mgi] =
                    self.nt_steps_since_solve[mgi].saturating_add(1);
            }

            // heating: free-free absorption from the estimators, bound-free
            // heating integrated over the fitted radiation field, and the
            // non-thermal heating share of the deposition
            let bf_heating = {
                let cell = &self.model.cells[mgi];
                let mut pops = vec![0.; self.atomic.total_levels()];
                cellhistory::compute_level_pops(&self.atomic, cell, &mut pops);
                let mut heating = 0.;
                for element in 0..self.atomic.nelements() {
                    for ion in 0..self.atomic.nions(element).saturating_sub(1) {
                        for level in 0..self.atomic.ionisinglevels(element, ion) {
                            let n_level =
                                pops[self.atomic.uniquelevelindex(element, ion, level)];
                            if n_level <= options::MINPOP {
                                continue;
                            }
                            for target in 0..self.atomic.nphixstargets(element, ion, level) {
                                heating += n_level
                                    * ratecoeff::bfheatingcoeff(
                                        &self.atomic,
                                        &field,
                                        &self.bins,
                                        element,
                                        ion,
                                        level,
                                        target,
                                    );
                            }
                        }
                    }
                }
                heating
            };
            let heating_rate = self.estimators.ffheating[mgi] / volume / dt
                + bf_heating
                + dep_rate * self.nt_solutions[mgi].frac_heating;

            let cell = &mut self.model.cells[mgi];
            nltepop::solve_cell(
                &self.atomic,
                &self.cooling_layout,
                cell,
                mgi,
                rho,
                &field,
                &self.bins,
                &self.nt_solutions[mgi],
                dep_rate,
                heating_rate,
            );

            self.fields[mgi] = field;
        }
        Ok(())
    }

    fn write_checkpoint(&self, nts: usize) -> anyhow::Result<()> {
        let path = pool::checkpoint_path(&self.dir, 0, self.rank);
        packet::write_packets_binary(&path, &self.packets)
            .with_context(|| format!("writing {}", path.display()))?;
        if self.rank == 0 {
            input::update_parameterfile(&self.dir.join("input.txt"), nts, self.params.ftstep)
                .context("updating input.txt")?;
        }
        info!("checkpoint written at timestep {}", nts);
        Ok(())
    }
}

/// Current elemental composition of a cell: the iron-group share follows
/// the radioactive decay products, everything else keeps its
/// compositiondata.txt fraction scaled into the non-iron-group remainder.
pub fn update_cell_composition(atomic: &AtomicData, cell: &mut model::ModelCell, t: f64) {
    let nelements = atomic.nelements();
    if cell.composition.len() != nelements {
        cell.composition = vec![0.; nelements];
    }

    let radioabund_init = cell.radioabund_init;
    let current = decay::radioabund_at_time(&radioabund_init, t);

    // per-Z mass fraction deltas from the decay chains
    let fraction_of_z = |z: i32| -> f64 {
        let mut f = 0.;
        for nuc in &decay::RADIONUCLIDES {
            if nuc.z() == z {
                f += current[nuc.index()];
            }
        }
        for chain in &decay::CHAINS {
            if chain.z_final == z {
                let decayed = (radioabund_init[chain.parent.index()]
                    + radioabund_init[chain.daughter.index()])
                    - (current[chain.parent.index()] + current[chain.daughter.index()]);
                f += decayed.max(0.);
            }
        }
        f
    };

    // stable iron-group material beyond the tracked radionuclides
    let radio_init: f64 = radioabund_init.iter().sum();
    let stable_fe = (cell.ffegrp - radio_init).max(0.);

    let mut assigned = 0.;
    for element in 0..nelements {
        let z = atomic.anumber(element);
        let mut f = fraction_of_z(z);
        if z == 26 {
            f += stable_fe;
        }
        cell.composition[element] = f;
        assigned += f;
    }

    // the non-iron-group remainder follows the compositiondata.txt mix
    let remainder = (1. - cell.ffegrp).max(0.);
    let mix_total: f64 = (0..nelements)
        .filter(|&e| atomic.anumber(e) < 21)
        .map(|e| atomic.elements[e].abundance)
        .sum();
    if mix_total > 0. && remainder > 0. {
        for element in 0..nelements {
            if atomic.anumber(element) < 21 {
                cell.composition[element] +=
                    remainder * atomic.elements[element].abundance / mix_total;
            }
        }
    } else if assigned <= 0. {
        // no information at all: fall back to the homogeneous mix
        for element in 0..nelements {
            cell.composition[element] = atomic.elements[element].abundance;
        }
    }
}
