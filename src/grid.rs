//! The propagation grid laid over the ejecta model.
//!
//! Either a uniform Cartesian grid or 1D spherical shells. Every
//! propagation cell resolves to a model cell (possibly the designated empty
//! cell); cell boundaries move outward homologously, so the
//! distance-to-boundary kernels solve for the intersection of a ray moving
//! at c with a surface expanding at its own coordinate velocity.

use nalgebra::Vector3;
use rand::Rng;

use crate::constant::CLIGHT;
use crate::errors::IngestError;
use crate::model::{Model, ModelType};
use crate::options;

/// Which boundary a packet crossed last; used to suppress an immediate
/// re-crossing of the same boundary from floating-point error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Cross {
    None,
    NegX,
    PosX,
    NegY,
    PosY,
    NegZ,
    PosZ,
    /// spherical grid: crossed inward
    In,
    /// spherical grid: crossed outward
    Out,
}

impl Cross {
    pub fn to_u8(self) -> u8 {
        match self {
            Cross::None => 0,
            Cross::NegX => 1,
            Cross::PosX => 2,
            Cross::NegY => 3,
            Cross::PosY => 4,
            Cross::NegZ => 5,
            Cross::PosZ => 6,
            Cross::In => 7,
            Cross::Out => 8,
        }
    }

    pub fn from_u8(v: u8) -> Cross {
        match v {
            1 => Cross::NegX,
            2 => Cross::PosX,
            3 => Cross::NegY,
            4 => Cross::PosY,
            5 => Cross::NegZ,
            6 => Cross::PosZ,
            7 => Cross::In,
            8 => Cross::Out,
            _ => Cross::None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GridType {
    Uniform3D,
    Spherical1D,
}

/// Outcome of a boundary crossing.
pub enum CrossingResult {
    /// new propagation cell index and the boundary that was crossed
    Cell(usize, Cross),
    /// the packet left the grid
    Escape,
}

pub struct PropagationGrid {
    pub grid_type: GridType,
    pub ncoordgrid: [usize; 3],
    pub ngrid: usize,
    /// model cell index of each propagation cell
    pub modelgridindex: Vec<u32>,
    /// cube width at t_min [cm]
    pub wid_init: f64,
    /// grid extent at t_min [cm]
    pub rmax: f64,
    /// spherical grid: outer shell radii at t_min [cm]
    pub shell_radii_init: Vec<f64>,
    /// propagation cell volumes at t_min [cm^3]
    pub cellvolume_init: Vec<f64>,
    pub tmin: f64,
}

impl PropagationGrid {
    /// Lay a uniform Cartesian grid of `ncoord`^3 cells over the model.
    pub fn new_uniform(model: &Model, tmin: f64, ncoord: usize) -> Result<Self, IngestError> {
        let ngrid = ncoord * ncoord * ncoord;
        if ngrid > options::MGRID {
            return Err(IngestError::ResourceLimit(format!(
                "too many grid cells ({} > {})",
                ngrid,
                options::MGRID
            )));
        }
        let rmax = model.vmax * tmin;
        let wid_init = 2. * rmax / ncoord as f64;
        let empty = model.empty_cell_index() as u32;

        let mut modelgridindex = Vec::with_capacity(ngrid);
        match model.model_type {
            ModelType::Cartesian3D => {
                if model.grid_mapping_3d.len() != ngrid {
                    return Err(IngestError::Inconsistent(format!(
                        "3D model/grid mismatch: {} != {}",
                        model.grid_mapping_3d.len(),
                        ngrid
                    )));
                }
                modelgridindex.extend_from_slice(&model.grid_mapping_3d);
            }
            ModelType::Spherical1D => {
                for n in 0..ngrid {
                    let center = cell_center(n, ncoord, rmax, wid_init);
                    let v_center = center.norm() / tmin;
                    let mgi = model
                        .vout
                        .iter()
                        .position(|&v| v_center < v)
                        .map(|m| m as u32)
                        .unwrap_or(empty);
                    modelgridindex.push(mgi);
                }
            }
            ModelType::Cylindrical2D => {
                for n in 0..ngrid {
                    let center = cell_center(n, ncoord, rmax, wid_init);
                    let v_cyl = (center[0].powi(2) + center[1].powi(2)).sqrt() / tmin;
                    let v_z = center[2] / tmin;
                    let n1 = (v_cyl / (model.vmax / model.ncoord1 as f64)) as usize;
                    let n2 = ((v_z + model.vmax) / (2. * model.vmax / model.ncoord2 as f64)) as usize;
                    let mgi = if n1 < model.ncoord1 && n2 < model.ncoord2 {
                        (n2 * model.ncoord1 + n1) as u32
                    } else {
                        empty
                    };
                    modelgridindex.push(mgi);
                }
            }
        }

        let cellvolume_init = vec![wid_init.powi(3); ngrid];
        Ok(PropagationGrid {
            grid_type: GridType::Uniform3D,
            ncoordgrid: [ncoord, ncoord, ncoord],
            ngrid,
            modelgridindex,
            wid_init,
            rmax,
            shell_radii_init: Vec::new(),
            cellvolume_init,
            tmin,
        })
    }

    /// Spherical shells matching a 1D model one-to-one.
    pub fn new_spherical(model: &Model, tmin: f64) -> Result<Self, IngestError> {
        if model.model_type != ModelType::Spherical1D {
            return Err(IngestError::Inconsistent(
                "a spherical propagation grid needs a 1D model".to_string(),
            ));
        }
        let ngrid = model.npts_model;
        let shell_radii_init: Vec<f64> = model.vout.iter().map(|&v| v * tmin).collect();
        let modelgridindex: Vec<u32> = (0..ngrid).map(|m| m as u32).collect();
        let mut cellvolume_init = Vec::with_capacity(ngrid);
        for m in 0..ngrid {
            let r_in = if m == 0 { 0. } else { shell_radii_init[m - 1] };
            cellvolume_init.push(
                4. / 3. * crate::constant::PI * (shell_radii_init[m].powi(3) - r_in.powi(3)),
            );
        }
        Ok(PropagationGrid {
            grid_type: GridType::Spherical1D,
            ncoordgrid: [ngrid, 1, 1],
            ngrid,
            modelgridindex,
            wid_init: 0.,
            rmax: model.vmax * tmin,
            shell_radii_init,
            cellvolume_init,
            tmin,
        })
    }

    /// Model cell behind a propagation cell.
    pub fn cell_modelgridindex(&self, cellindex: usize) -> usize {
        self.modelgridindex[cellindex] as usize
    }

    /// Sample a position inside cell `cellindex`, at t_min coordinates.
    pub fn sample_pos_in_cell<R: Rng + ?Sized>(
        &self,
        cellindex: usize,
        rng: &mut R,
    ) -> Vector3<f64> {
        match self.grid_type {
            GridType::Uniform3D => {
                let min = self.cell_pos_min(cellindex);
                Vector3::new(
                    min[0] + rng.gen::<f64>() * self.wid_init,
                    min[1] + rng.gen::<f64>() * self.wid_init,
                    min[2] + rng.gen::<f64>() * self.wid_init,
                )
            }
            GridType::Spherical1D => {
                let r_out = self.shell_radii_init[cellindex];
                let r_in = if cellindex == 0 {
                    0.
                } else {
                    self.shell_radii_init[cellindex - 1]
                };
                let u: f64 = rng.gen::<f64>();
                let r = (r_in.powi(3) + u * (r_out.powi(3) - r_in.powi(3))).cbrt();
                crate::maths::isotropic_direction(rng) * r
            }
        }
    }

    /// Lower corner of a uniform cell at t_min.
    pub fn cell_pos_min(&self, cellindex: usize) -> Vector3<f64> {
        let (ix, iy, iz) = self.cell_coords(cellindex);
        Vector3::new(
            -self.rmax + ix as f64 * self.wid_init,
            -self.rmax + iy as f64 * self.wid_init,
            -self.rmax + iz as f64 * self.wid_init,
        )
    }

    fn cell_coords(&self, cellindex: usize) -> (usize, usize, usize) {
        let nc = self.ncoordgrid[0];
        (cellindex % nc, (cellindex / nc) % nc, cellindex / (nc * nc))
    }

    /// Distance along `dir` from `pos` (at time `t`) to the next cell
    /// boundary, and where that crossing leads. The boundary in
    /// `last_cross` is excluded so floating-point error cannot bounce a
    /// packet straight back.
    pub fn boundary_distance(
        &self,
        cellindex: usize,
        pos: &Vector3<f64>,
        dir: &Vector3<f64>,
        t: f64,
        last_cross: Cross,
    ) -> (f64, CrossingResult) {
        match self.grid_type {
            GridType::Uniform3D => self.boundary_distance_uniform(cellindex, pos, dir, t, last_cross),
            GridType::Spherical1D => {
                self.boundary_distance_spherical(cellindex, pos, dir, t, last_cross)
            }
        }
    }

    fn boundary_distance_uniform(
        &self,
        cellindex: usize,
        pos: &Vector3<f64>,
        dir: &Vector3<f64>,
        t: f64,
        last_cross: Cross,
    ) -> (f64, CrossingResult) {
        let nc = self.ncoordgrid[0];
        let (ix, iy, iz) = self.cell_coords(cellindex);
        let coords = [ix, iy, iz];
        let tfact = t / self.tmin;

        let mut best_d = f64::MAX;
        let mut best: Option<(usize, Cross, bool)> = None; // (axis, cross, positive side)

        for axis in 0..3 {
            let lower = -self.rmax + coords[axis] as f64 * self.wid_init;
            let upper = lower + self.wid_init;

            for &(bound, positive) in &[(lower, false), (upper, true)] {
                let cross = face_cross(axis, positive);
                // the face the packet came through is excluded
                if opposite(cross) == last_cross {
                    continue;
                }
                // boundary coordinate at time t+d/c is bound*(t+d/c)/tmin
                let denom = dir[axis] - bound / (CLIGHT * self.tmin);
                if denom.abs() < 1e-100 {
                    continue;
                }
                let d = (bound * tfact - pos[axis]) / denom;
                if d > 0. && d < best_d {
                    best_d = d;
                    best = Some((axis, cross, positive));
                }
            }
        }

        match best {
            None => (0., CrossingResult::Escape),
            Some((axis, cross, positive)) => {
                let coord = coords[axis];
                let escape = (positive && coord + 1 >= nc) || (!positive && coord == 0);
                if escape {
                    (best_d, CrossingResult::Escape)
                } else {
                    let stride = match axis {
                        0 => 1,
                        1 => nc,
                        _ => nc * nc,
                    };
                    let next = if positive {
                        cellindex + stride
                    } else {
                        cellindex - stride
                    };
                    (best_d, CrossingResult::Cell(next, cross))
                }
            }
        }
    }

    fn boundary_distance_spherical(
        &self,
        cellindex: usize,
        pos: &Vector3<f64>,
        dir: &Vector3<f64>,
        t: f64,
        last_cross: Cross,
    ) -> (f64, CrossingResult) {
        let r_out_init = self.shell_radii_init[cellindex];
        let r_in_init = if cellindex == 0 {
            0.
        } else {
            self.shell_radii_init[cellindex - 1]
        };

        let mut best_d = f64::MAX;
        let mut best: Option<Cross> = None;

        if last_cross != Cross::In {
            // outer shell: the packet is inside it, so exactly one positive root
            if let Some(d) = expanding_sphere_crossing(pos, dir, t, r_out_init / self.tmin, true) {
                if d < best_d {
                    best_d = d;
                    best = Some(Cross::Out);
                }
            }
        }
        if r_in_init > 0. && last_cross != Cross::Out {
            if let Some(d) = expanding_sphere_crossing(pos, dir, t, r_in_init / self.tmin, false) {
                if d < best_d {
                    best_d = d;
                    best = Some(Cross::In);
                }
            }
        }

        match best {
            Some(Cross::Out) => {
                if cellindex + 1 >= self.ngrid {
                    (best_d, CrossingResult::Escape)
                } else {
                    (best_d, CrossingResult::Cell(cellindex + 1, Cross::Out))
                }
            }
            Some(Cross::In) => (best_d, CrossingResult::Cell(cellindex - 1, Cross::In)),
            _ => (0., CrossingResult::Escape),
        }
    }
}

/// Centre of uniform cell `n` at t_min.
fn cell_center(n: usize, ncoord: usize, rmax: f64, wid: f64) -> Vector3<f64> {
    let ix = n % ncoord;
    let iy = (n / ncoord) % ncoord;
    let iz = n / (ncoord * ncoord);
    Vector3::new(
        -rmax + (ix as f64 + 0.5) * wid,
        -rmax + (iy as f64 + 0.5) * wid,
        -rmax + (iz as f64 + 0.5) * wid,
    )
}

fn face_cross(axis: usize, positive: bool) -> Cross {
    match (axis, positive) {
        (0, false) => Cross::NegX,
        (0, true) => Cross::PosX,
        (1, false) => Cross::NegY,
        (1, true) => Cross::PosY,
        (2, false) => Cross::NegZ,
        _ => Cross::PosZ,
    }
}

fn opposite(cross: Cross) -> Cross {
    match cross {
        Cross::NegX => Cross::PosX,
        Cross::PosX => Cross::NegX,
        Cross::NegY => Cross::PosY,
        Cross::PosY => Cross::NegY,
        Cross::NegZ => Cross::PosZ,
        Cross::PosZ => Cross::NegZ,
        Cross::In => Cross::Out,
        Cross::Out => Cross::In,
        Cross::None => Cross::None,
    }
}

/// Distance at which a ray starting at `pos` (time `t`, speed c) meets a
/// sphere expanding at coordinate velocity `s` (radius s*t'). `outward`
/// selects the root for a surface enclosing the start point.
fn expanding_sphere_crossing(
    pos: &Vector3<f64>,
    dir: &Vector3<f64>,
    t: f64,
    s: f64,
    outward: bool,
) -> Option<f64> {
    let a = 1. - (s * s) / CLIGHTSQ;
    let b = 2. * (pos.dot(dir) - s * s * t / CLIGHT);
    let c = pos.dot(pos) - s * s * t * t;
    let disc = b * b - 4. * a * c;
    if disc < 0. {
        return None;
    }
    let sq = disc.sqrt();
    if outward {
        let d = (-b + sq) / (2. * a);
        if d > 0. {
            Some(d)
        } else {
            None
        }
    } else {
        // first contact with an inner shell
        let d = (-b - sq) / (2. * a);
        if d > 0. {
            Some(d)
        } else {
            None
        }
    }
}

const CLIGHTSQ: f64 = CLIGHT * CLIGHT;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constant::DAY;
    use assert_approx_eq::assert_approx_eq;

    fn shell_model() -> Model {
        let path = std::env::temp_dir().join(format!("snmc_grid_{}.txt", std::process::id()));
        std::fs::write(
            &path,
            "2\n10.0\n1 5000 -13.0 0.0 1.0 0.0 0.0 0.0\n2 10000 -14.0 0.0 0.0 0.0 0.0 0.0\n",
        )
        .unwrap();
        let model =
            crate::model::read_ejecta_model(&path, ModelType::Spherical1D, 10. * DAY).unwrap();
        std::fs::remove_file(&path).ok();
        model
    }

    #[test]
    fn test_uniform_grid_maps_every_cell() {
        let model = shell_model();
        let tmin = 10. * DAY;
        let grid = PropagationGrid::new_uniform(&model, tmin, 10).unwrap();
        assert_eq!(grid.ngrid, 1000);
        // every propagation cell resolves to a valid model cell index,
        // the void sentinel included
        for n in 0..grid.ngrid {
            assert!(grid.cell_modelgridindex(n) <= model.empty_cell_index());
        }
        // the grid centre is inside the innermost shell
        let centre = grid.ngrid / 2 + grid.ncoordgrid[0] / 2 + grid.ncoordgrid[0].pow(2) / 2;
        assert!(grid.cell_modelgridindex(centre) < model.empty_cell_index());
    }

    #[test]
    fn test_uniform_boundary_distance_static_limit() {
        let model = shell_model();
        let tmin = 10. * DAY;
        let grid = PropagationGrid::new_uniform(&model, tmin, 4).unwrap();
        // start in the middle of cell (2,1,1) moving along +x at t = tmin:
        // the +x face recedes, so the distance exceeds half a cell width
        let cellindex = 2 + 4 + 16;
        let pos = grid.cell_pos_min(cellindex)
            + nalgebra::Vector3::new(0.5, 0.5, 0.5) * grid.wid_init;
        let dir = nalgebra::Vector3::new(1., 0., 0.);
        let (d, result) = grid.boundary_distance(cellindex, &pos, &dir, tmin, Cross::None);
        assert!(d > 0.5 * grid.wid_init);
        assert!(d < grid.wid_init);
        match result {
            CrossingResult::Cell(next, cross) => {
                assert_eq!(next, cellindex + 1);
                assert_eq!(cross, Cross::PosX);
            }
            _ => panic!("expected a cell crossing"),
        }
    }

    #[test]
    fn test_spherical_boundary_distance_radial() {
        let model = shell_model();
        let tmin = 10. * DAY;
        let grid = PropagationGrid::new_spherical(&model, tmin).unwrap();
        // radial flight from the centre: the first shell lies at
        // r0 (t + d/c)/tmin, so d = r0 / (1 - r0/(c tmin))
        let pos = nalgebra::Vector3::new(0., 0., 1e5);
        let dir = nalgebra::Vector3::new(0., 0., 1.);
        let (d, result) = grid.boundary_distance(0, &pos, &dir, tmin, Cross::None);
        let r0 = grid.shell_radii_init[0];
        let expected = (r0 - 1e5) / (1. - r0 / (CLIGHT * tmin));
        assert_approx_eq!(d, expected, expected * 1e-8);
        match result {
            CrossingResult::Cell(next, cross) => {
                assert_eq!(next, 1);
                assert_eq!(cross, Cross::Out);
            }
            _ => panic!("expected a cell crossing"),
        }

        // from the outer shell the packet escapes
        let pos_out = nalgebra::Vector3::new(0., 0., grid.shell_radii_init[0] * 1.5);
        let (_, result) = grid.boundary_distance(1, &pos_out, &dir, tmin, Cross::None);
        match result {
            CrossingResult::Escape => {}
            _ => panic!("expected escape"),
        }
    }
}
