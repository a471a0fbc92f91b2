//! The ejecta model: per-model-cell densities, compositions and matter
//! state, read from `model.txt`.
//!
//! A model is one of 1D spherical shells, 2D cylindrical (r,z) rings or a
//! 3D Cartesian cube grid. Densities are given at the model epoch and are
//! rescaled to the start of the simulation on read; the homologous
//! rho(t) = rho(t_min) (t_min/t)^3 scaling is applied lazily afterwards.
//! One designated empty cell (index `npts_model`) aliases all void regions.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use log::info;

use crate::constant::{DAY, PI};
use crate::decay::{Radionuclide, RADIONUCLIDE_COUNT};
use crate::errors::IngestError;
use crate::options;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelType {
    Spherical1D,
    Cylindrical2D,
    Cartesian3D,
}

#[derive(Clone, Debug)]
pub struct ModelCell {
    /// density at t_min [g/cm^3]
    pub rho_init: f64,
    /// iron-group mass fraction
    pub ffegrp: f64,
    /// initial radionuclide mass fractions
    pub radioabund_init: [f64; RADIONUCLIDE_COUNT],
    /// current elemental mass fractions, one entry per included element
    pub composition: Vec<f64>,
    /// electron temperature [K]
    pub t_e: f64,
    /// radiation temperature [K]
    pub t_r: f64,
    /// full-spectrum fit temperature [K]
    pub t_j: f64,
    /// dilution factor of the cell-wide radiation field fit
    pub w: f64,
    /// free electron number density [1/cm^3]
    pub nne: f64,
    /// total electron number density (free plus bound) [1/cm^3]
    pub nnetot: f64,
    /// treated in the grey approximation this timestep
    pub thick: bool,
    /// total ion number densities, one entry per unique ion
    pub ion_pops: Vec<f64>,
    /// ground state populations, one entry per unique ion
    pub groundlevelpops: Vec<f64>,
    /// NLTE level populations (absent until the solver has run)
    pub nlte_pops: Vec<f64>,
}

impl ModelCell {
    fn empty() -> ModelCell {
        ModelCell {
            rho_init: 0.,
            ffegrp: 0.,
            radioabund_init: [0.; RADIONUCLIDE_COUNT],
            composition: Vec::new(),
            t_e: 0.,
            t_r: 0.,
            t_j: 0.,
            w: 0.,
            nne: 0.,
            nnetot: 0.,
            thick: false,
            ion_pops: Vec::new(),
            groundlevelpops: Vec::new(),
            nlte_pops: Vec::new(),
        }
    }
}

pub struct Model {
    pub model_type: ModelType,
    pub npts_model: usize,
    /// `npts_model` real cells plus the designated empty cell at the end
    pub cells: Vec<ModelCell>,
    /// epoch of the input model [s]
    pub t_model: f64,
    /// maximum ejecta velocity [cm/s]
    pub vmax: f64,
    /// 1D: outer shell velocities [cm/s]
    pub vout: Vec<f64>,
    /// 2D: radial and vertical cell counts
    pub ncoord1: usize,
    pub ncoord2: usize,
    /// 2D: radial and vertical cell sizes at t_model [cm]
    pub dcoord1: f64,
    pub dcoord2: f64,
    /// 3D: model cell index of each input grid cell (empty cells resolve to
    /// the sentinel), in X-fastest order
    pub grid_mapping_3d: Vec<u32>,
    /// cell volumes at t_min [cm^3]
    pub cellvolume_init: Vec<f64>,
    /// minimum nonzero input density [g/cm^3]
    pub min_den: f64,
    pub mtot: f64,
    pub mfeg: f64,
    pub totmassradionuclide: [f64; RADIONUCLIDE_COUNT],
}

impl Model {
    /// Index of the designated empty model cell.
    pub fn empty_cell_index(&self) -> usize {
        self.npts_model
    }

    /// Density under homologous expansion, rho(t) = rho(t_min)(t_min/t)^3.
    pub fn rho(&self, mgi: usize, t: f64, tmin: f64) -> f64 {
        self.cells[mgi].rho_init * (tmin / t).powi(3)
    }

    pub fn rho_init(&self, mgi: usize) -> f64 {
        self.cells[mgi].rho_init
    }

    pub fn t_e(&self, mgi: usize) -> f64 {
        self.cells[mgi].t_e
    }

    pub fn composition(&self, mgi: usize) -> &[f64] {
        &self.cells[mgi].composition
    }

    /// Sum up the total and per-radionuclide masses.
    fn tally_masses(&mut self) {
        self.mtot = 0.;
        self.mfeg = 0.;
        self.totmassradionuclide = [0.; RADIONUCLIDE_COUNT];
        for mgi in 0..self.npts_model {
            let mass = self.cells[mgi].rho_init * self.cellvolume_init[mgi];
            self.mtot += mass;
            self.mfeg += mass * self.cells[mgi].ffegrp;
            for i in 0..RADIONUCLIDE_COUNT {
                self.totmassradionuclide[i] += mass * self.cells[mgi].radioabund_init[i];
            }
        }
        info!("total ejecta mass {:.4e} g", self.mtot);
        for nuc in &crate::decay::RADIONUCLIDES {
            info!(
                "initial {:?} mass {:.4e} g",
                nuc,
                self.totmassradionuclide[nuc.index()]
            );
        }
    }
}

fn open_model(path: &Path) -> Result<BufReader<File>, IngestError> {
    let file = File::open(path).map_err(|source| IngestError::Open {
        path: path.display().to_string(),
        source,
    })?;
    Ok(BufReader::new(file))
}

fn next_data_line(reader: &mut BufReader<File>, path: &Path) -> Result<Vec<f64>, IngestError> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .map_err(|source| IngestError::Read {
                path: path.display().to_string(),
                source,
            })?;
        if n == 0 {
            return Err(IngestError::UnexpectedEof(path.display().to_string()));
        }
        let fields: Result<Vec<f64>, _> = line.split_whitespace().map(|t| t.parse()).collect();
        match fields {
            Ok(v) if !v.is_empty() => return Ok(v),
            Ok(_) => continue,
            Err(_) => {
                return Err(IngestError::Malformed {
                    file: path.display().to_string(),
                    what: "numeric model record",
                    found: Some(line.trim().to_string()),
                })
            }
        }
    }
}

/// Store one abundance row (ffegrp, 56Ni, 56Co, 52Fe, 48Cr and optionally
/// 57Ni, 57Co) into a model cell.
fn apply_abundance_fields(
    cell: &mut ModelCell,
    fields: &[f64],
    path: &Path,
) -> Result<(), IngestError> {
    if fields.len() != 5 && fields.len() != 7 {
        return Err(IngestError::Malformed {
            file: path.display().to_string(),
            what: "5 or 7 abundance columns",
            found: Some(format!("{} values", fields.len())),
        });
    }
    cell.ffegrp = fields[0];
    cell.radioabund_init[Radionuclide::Ni56.index()] = fields[1];
    cell.radioabund_init[Radionuclide::Co56.index()] = fields[2];
    cell.radioabund_init[Radionuclide::Fe52.index()] = fields[3];
    cell.radioabund_init[Radionuclide::Cr48.index()] = fields[4];
    if fields.len() == 7 {
        cell.radioabund_init[Radionuclide::Ni57.index()] = fields[5];
        cell.radioabund_init[Radionuclide::Co57.index()] = fields[6];
    }
    Ok(())
}

/// Read `model.txt` of the given type and rescale densities to `tmin`.
pub fn read_ejecta_model(path: &Path, model_type: ModelType, tmin: f64) -> Result<Model, IngestError> {
    let mut model = match model_type {
        ModelType::Spherical1D => read_1d_model(path, tmin)?,
        ModelType::Cylindrical2D => read_2d_model(path, tmin)?,
        ModelType::Cartesian3D => read_3d_model(path, tmin)?,
    };
    model.tally_masses();
    Ok(model)
}

fn read_1d_model(path: &Path, tmin: f64) -> Result<Model, IngestError> {
    info!("reading 1D model");
    let mut reader = open_model(path)?;

    let header = next_data_line(&mut reader, path)?;
    let npts_model = header[0] as usize;
    if npts_model > options::MMODELGRID {
        return Err(IngestError::ResourceLimit(format!(
            "too many cells in input model ({} > {})",
            npts_model,
            options::MMODELGRID
        )));
    }
    let t_model = next_data_line(&mut reader, path)?[0] * DAY;

    let mut cells = Vec::with_capacity(npts_model + 1);
    let mut vout = Vec::with_capacity(npts_model);
    let mut min_den = f64::MAX;
    for mgi in 0..npts_model {
        let fields = next_data_line(&mut reader, path)?;
        if fields.len() != 8 && fields.len() != 10 {
            return Err(IngestError::Malformed {
                file: path.display().to_string(),
                what: "8 or 10 columns in a 1D model record",
                found: Some(format!("{} values", fields.len())),
            });
        }
        let cellnumber = fields[0] as usize;
        if cellnumber != mgi + 1 {
            return Err(IngestError::Inconsistent(format!(
                "1D model cell number {} out of order (expected {})",
                cellnumber,
                mgi + 1
            )));
        }
        vout.push(fields[1] * 1e5); // km/s -> cm/s
        let rho_tmodel = 10f64.powf(fields[2]);
        let rho_tmin = rho_tmodel * (t_model / tmin).powi(3);
        if rho_tmodel > 0. {
            min_den = min_den.min(rho_tmodel);
        }

        let mut cell = ModelCell::empty();
        cell.rho_init = rho_tmin;
        apply_abundance_fields(&mut cell, &fields[3..], path)?;
        cells.push(cell);
    }
    cells.push(ModelCell::empty());

    let vmax = vout[npts_model - 1];
    let mut cellvolume_init = Vec::with_capacity(npts_model);
    for mgi in 0..npts_model {
        let v_inner = if mgi == 0 { 0. } else { vout[mgi - 1] };
        cellvolume_init
            .push((vout[mgi].powi(3) - v_inner.powi(3)) * 4. * PI * tmin.powi(3) / 3.);
    }

    Ok(Model {
        model_type: ModelType::Spherical1D,
        npts_model,
        cells,
        t_model,
        vmax,
        vout,
        ncoord1: 0,
        ncoord2: 0,
        dcoord1: 0.,
        dcoord2: 0.,
        grid_mapping_3d: Vec::new(),
        cellvolume_init,
        min_den,
        mtot: 0.,
        mfeg: 0.,
        totmassradionuclide: [0.; RADIONUCLIDE_COUNT],
    })
}

fn read_2d_model(path: &Path, tmin: f64) -> Result<Model, IngestError> {
    info!("reading 2D model");
    let mut reader = open_model(path)?;

    let header = next_data_line(&mut reader, path)?;
    let (ncoord1, ncoord2) = (header[0] as usize, header[1] as usize);
    let npts_model = ncoord1 * ncoord2;
    if npts_model > options::MMODELGRID {
        return Err(IngestError::ResourceLimit(format!(
            "too many cells in input model ({} > {})",
            npts_model,
            options::MMODELGRID
        )));
    }
    let t_model = next_data_line(&mut reader, path)?[0] * DAY;
    let vmax = next_data_line(&mut reader, path)?[0];
    let dcoord1 = vmax * t_model / ncoord1 as f64; // dr of the input model
    let dcoord2 = 2. * vmax * t_model / ncoord2 as f64; // dz of the input model

    let mut cells = Vec::with_capacity(npts_model + 1);
    let mut cellvolume_init = Vec::with_capacity(npts_model);
    let mut min_den = f64::MAX;
    for mgi in 0..npts_model {
        let fields = next_data_line(&mut reader, path)?;
        if fields.len() != 4 {
            return Err(IngestError::Malformed {
                file: path.display().to_string(),
                what: "4 columns in a 2D model record",
                found: Some(format!("{} values", fields.len())),
            });
        }
        let cellnumber = fields[0] as usize;
        if cellnumber != mgi + 1 {
            return Err(IngestError::Inconsistent(format!(
                "2D model cell number {} out of order (expected {})",
                cellnumber,
                mgi + 1
            )));
        }
        let rho_tmodel = fields[3];
        if rho_tmodel > 0. {
            min_den = min_den.min(rho_tmodel);
        }

        let mut cell = ModelCell::empty();
        cell.rho_init = rho_tmodel * (t_model / tmin).powi(3);
        let abund = next_data_line(&mut reader, path)?;
        apply_abundance_fields(&mut cell, &abund, path)?;
        cells.push(cell);

        let n1 = mgi % ncoord1;
        cellvolume_init.push(
            (tmin / t_model).powi(3)
                * ((2 * n1) as f64 + 1.)
                * PI
                * dcoord2
                * dcoord1.powi(2),
        );
    }
    cells.push(ModelCell::empty());

    Ok(Model {
        model_type: ModelType::Cylindrical2D,
        npts_model,
        cells,
        t_model,
        vmax,
        vout: Vec::new(),
        ncoord1,
        ncoord2,
        dcoord1,
        dcoord2,
        grid_mapping_3d: Vec::new(),
        cellvolume_init,
        min_den,
        mtot: 0.,
        mfeg: 0.,
        totmassradionuclide: [0.; RADIONUCLIDE_COUNT],
    })
}

fn read_3d_model(path: &Path, tmin: f64) -> Result<Model, IngestError> {
    info!("reading 3D model");
    let mut reader = open_model(path)?;

    let header = next_data_line(&mut reader, path)?;
    let npts_in = header[0] as usize;
    if npts_in > options::MMODELGRID {
        return Err(IngestError::ResourceLimit(format!(
            "too many cells in input model ({} > {})",
            npts_in,
            options::MMODELGRID
        )));
    }
    let t_model = next_data_line(&mut reader, path)?[0] * DAY;
    let vmax = next_data_line(&mut reader, path)?[0];

    let ncoord = (npts_in as f64).cbrt().round() as usize;
    if ncoord * ncoord * ncoord != npts_in {
        return Err(IngestError::Inconsistent(format!(
            "3D model cell count {} is not a cube",
            npts_in
        )));
    }

    // empty input cells all alias the sentinel; every non-empty input cell
    // becomes its own model cell
    let mut cells: Vec<ModelCell> = Vec::new();
    let mut grid_mapping = Vec::with_capacity(npts_in);
    let mut min_den = f64::MAX;
    let cellvolume = (2. * vmax * tmin).powi(3) / npts_in as f64;

    let mut mgi = 0usize;
    for n in 0..npts_in {
        let fields = next_data_line(&mut reader, path)?;
        if fields.len() != 5 {
            return Err(IngestError::Malformed {
                file: path.display().to_string(),
                what: "5 columns in a 3D model record",
                found: Some(format!("{} values", fields.len())),
            });
        }
        let cellnumber = fields[0] as usize;
        if cellnumber != n + 1 {
            return Err(IngestError::Inconsistent(format!(
                "3D model cell number {} out of order (expected {})",
                cellnumber,
                n + 1
            )));
        }
        let rho_model = fields[4];
        if rho_model < 0. {
            return Err(IngestError::Inconsistent(format!(
                "negative input density {} in cell {}",
                rho_model, n
            )));
        }

        let abund = next_data_line(&mut reader, path)?;
        let keepcell = rho_model > 0.;
        if keepcell {
            let mut cell = ModelCell::empty();
            cell.rho_init = rho_model * (t_model / tmin).powi(3);
            apply_abundance_fields(&mut cell, &abund, path)?;
            cells.push(cell);
            min_den = min_den.min(rho_model);
            grid_mapping.push(mgi as u32);
            mgi += 1;
        } else {
            grid_mapping.push(u32::MAX); // patched to the sentinel below
        }
    }

    let npts_model = mgi;
    for entry in grid_mapping.iter_mut() {
        if *entry == u32::MAX {
            *entry = npts_model as u32;
        }
    }
    cells.push(ModelCell::empty());

    info!("min_den {:e}", min_den);
    info!("effectively used model grid cells {}", npts_model);

    let cellvolume_init = vec![cellvolume; npts_model];

    Ok(Model {
        model_type: ModelType::Cartesian3D,
        npts_model,
        cells,
        t_model,
        vmax,
        vout: Vec::new(),
        ncoord1: ncoord,
        ncoord2: ncoord,
        dcoord1: 0.,
        dcoord2: 0.,
        grid_mapping_3d: grid_mapping,
        cellvolume_init,
        min_den,
        mtot: 0.,
        mfeg: 0.,
        totmassradionuclide: [0.; RADIONUCLIDE_COUNT],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("snmc_{}_{}", std::process::id(), name));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_read_1d_model() {
        let path = write_temp(
            "model1d.txt",
            "2\n10.0\n1 5000 -13.0 0.8 0.5 0.1 0.0 0.0\n2 10000 -14.0 0.2 0.0 0.0 0.0 0.0\n",
        );
        let tmin = 5. * DAY;
        let model = read_ejecta_model(&path, ModelType::Spherical1D, tmin).unwrap();
        assert_eq!(model.npts_model, 2);
        assert_eq!(model.cells.len(), 3); // two cells plus the empty sentinel
        assert_approx_eq!(model.vmax, 1e9, 1.);

        // density scaled from the 10 d epoch to tmin = 5 d: factor (10/5)^3
        let rho_expected = 1e-13 * 8.;
        assert_approx_eq!(model.cells[0].rho_init, rho_expected, 1e-18);
        assert_approx_eq!(
            model.cells[0].radioabund_init[Radionuclide::Ni56.index()],
            0.5,
            1e-12
        );
        assert!(model.mtot > 0.);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_homologous_density_scaling() {
        let path = write_temp(
            "model1d_scale.txt",
            "1\n10.0\n1 10000 -13.0 0.0 1.0 0.0 0.0 0.0\n",
        );
        let tmin = 10. * DAY;
        let model = read_ejecta_model(&path, ModelType::Spherical1D, tmin).unwrap();
        for &factor in &[1., 2., 5., 10.] {
            let t = tmin * factor;
            assert_approx_eq!(
                model.rho(0, t, tmin) / model.rho_init(0),
                (tmin / t).powi(3),
                1e-12
            );
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_read_3d_model_empty_cells_alias_sentinel() {
        // 2x2x2 grid with a single non-empty cell
        let mut contents = String::from("8\n10.0\n1.0e9\n");
        for n in 0..8 {
            let rho = if n == 3 { 1e-13 } else { 0.0 };
            contents.push_str(&format!("{} 0 0 0 {:e}\n0.0 1.0 0.0 0.0 0.0\n", n + 1, rho));
        }
        let path = write_temp("model3d.txt", &contents);
        let model = read_ejecta_model(&path, ModelType::Cartesian3D, 10. * DAY).unwrap();
        assert_eq!(model.npts_model, 1);
        assert_eq!(model.grid_mapping_3d.len(), 8);
        assert_eq!(model.grid_mapping_3d[3], 0);
        // every other input cell resolves to the designated empty cell
        for n in [0usize, 1, 2, 4, 5, 6, 7].iter() {
            assert_eq!(model.grid_mapping_3d[*n] as usize, model.empty_cell_index());
        }
        std::fs::remove_file(&path).ok();
    }
}
