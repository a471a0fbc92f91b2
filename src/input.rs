//! The free-parameter file `input.txt`.
//!
//! Comment lines begin with `#`; the order of the significant lines is
//! fixed. `update_parameterfile` rewrites the file in place when a
//! checkpoint is written, so a rerun continues from the saved state.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use log::info;
use nalgebra::Vector3;
use rand::Rng;

use crate::constant::{CLIGHT, DAY, MEV, H, PI};
use crate::errors::IngestError;
use crate::model::ModelType;

/// Canonical comments, one per significant line; rewritten on update.
const INPUT_LINE_COMMENTS: [&str; 24] = [
    "pre_zseed: specific random number seed if > 0 or random if negative",
    "ntstep: number of timesteps",
    "itstep ftstep: number of start and end time step",
    "tmin_days tmax_days: start and end times [day]",
    "nusyn_min_mev nusyn_max_mev: lowest and highest frequency to synthesise [MeV]",
    "nsyn_time: number of times for synthesis",
    "start and end times for synthesis",
    "model_type: number of dimensions (1, 2, or 3)",
    "compute r-light curve (1: no estimators, 2: thin cells, 3: thick cells, 4: gamma-ray heating)",
    "n_out_it: number of iterations",
    "CLIGHT_PROP/CLIGHT: change speed of light by some factor",
    "use grey opacity for gammas?",
    "syn_dir: x, y, and z components of unit vector (will be normalised after input or randomised if zero length)",
    "opacity_case: opacity choice",
    "rho_crit_para: free parameter for calculation of rho_crit",
    "UNUSED debug_packet: (>=0: activate debug output for packet id, <0: ignore)",
    "simulation_continued_from_saved: (0: start new simulation, 1: continue from gridsave and packets files)",
    "UNUSED rfcut_angstroms: wavelength (in Angstroms) at which the parameterisation of the radiation field switches from the nebular approximation to LTE.",
    "n_lte_timesteps",
    "cell_is_optically_thick n_grey_timesteps",
    "UNUSED max_bf_continua: (>0: max bound-free continua per ion, <0 unlimited)",
    "nprocs_exspec: extract spectra for n MPI tasks",
    "do_emission_res: Extract line-of-sight dependent information of last emission for spectrum_res (1: yes, 2: no)",
    "kpktdiffusion_timescale n_kpktdiffusion_timesteps: kpkts diffuse x of a time step's length for the first y time steps",
];

#[derive(Clone, Debug)]
pub struct RunParameters {
    pub seed: u64,
    pub ntstep: usize,
    pub itstep: usize,
    pub ftstep: usize,
    /// start and end of the simulation [s]
    pub tmin: f64,
    pub tmax: f64,
    /// synthesis frequency range [Hz]
    pub nusyn_min: f64,
    pub nusyn_max: f64,
    pub nsyn_time: usize,
    pub time_syn: Vec<f64>,
    pub model_type: ModelType,
    pub do_r_lc: bool,
    pub do_rlc_est: i32,
    pub n_out_it: usize,
    /// propagation speed of light scale factor
    pub clight_prop: f64,
    /// grey opacity for gamma packets [cm^2/g]; negative disables
    pub gamma_grey: f64,
    pub syn_dir: Vector3<f64>,
    pub opacity_case: i32,
    pub rho_crit_para: f64,
    pub debug_packet: i64,
    pub simulation_continued_from_saved: bool,
    pub nu_rfcut: f64,
    pub n_lte_timesteps: usize,
    /// Thomson depth above which a cell is treated grey, and for how many
    /// timesteps
    pub cell_is_optically_thick: f64,
    pub n_grey_timesteps: usize,
    pub max_bf_continua: i64,
    pub nprocs_exspec: usize,
    pub do_emission_res: i32,
    pub kpktdiffusion_timescale: f64,
    pub n_kpktdiffusion_timesteps: usize,
}

fn line_is_comment_only(line: &str) -> bool {
    let data = match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    };
    data.trim().is_empty()
}

fn significant_lines(contents: &str) -> Vec<String> {
    contents
        .lines()
        .filter(|l| !line_is_comment_only(l))
        .map(|l| match l.find('#') {
            Some(pos) => l[..pos].trim().to_string(),
            None => l.trim().to_string(),
        })
        .collect()
}

fn parse_fields<T: std::str::FromStr>(line: &str, what: &'static str) -> Result<Vec<T>, IngestError> {
    line.split_whitespace()
        .map(|t| {
            t.parse::<T>().map_err(|_| IngestError::Malformed {
                file: "input.txt".to_string(),
                what,
                found: Some(t.to_string()),
            })
        })
        .collect()
}

/// Like `parse_fields`, but demands at least `n` values on the line.
fn parse_n_fields<T: std::str::FromStr>(
    line: &str,
    what: &'static str,
    n: usize,
) -> Result<Vec<T>, IngestError> {
    let fields = parse_fields(line, what)?;
    if fields.len() < n {
        return Err(IngestError::Malformed {
            file: "input.txt".to_string(),
            what,
            found: Some(line.to_string()),
        });
    }
    Ok(fields)
}

/// First significant value of the parameter file: the random seed, needed
/// before the full read because the reader itself consumes random numbers
/// for the synthesis-direction fallback. Negative seeds resolve to the
/// wall clock.
pub fn peek_seed(path: &Path) -> Result<u64, IngestError> {
    let contents = fs::read_to_string(path).map_err(|source| IngestError::Open {
        path: path.display().to_string(),
        source,
    })?;
    let lines = significant_lines(&contents);
    let first = lines.first().ok_or(IngestError::Malformed {
        file: path.display().to_string(),
        what: "a seed line",
        found: None,
    })?;
    let pre_zseed: i64 = parse_fields(first, "random seed")?[0];
    Ok(if pre_zseed > 0 {
        pre_zseed as u64
    } else {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(1)
    })
}

/// Read the parameter file.
pub fn read_parameterfile<R: Rng + ?Sized>(
    path: &Path,
    rng: &mut R,
) -> Result<RunParameters, IngestError> {
    let contents = fs::read_to_string(path).map_err(|source| IngestError::Open {
        path: path.display().to_string(),
        source,
    })?;
    let lines = significant_lines(&contents);
    if lines.len() < INPUT_LINE_COMMENTS.len() {
        return Err(IngestError::Malformed {
            file: path.display().to_string(),
            what: "24 significant parameter lines",
            found: Some(format!("{} lines", lines.len())),
        });
    }

    let pre_zseed: i64 = parse_fields(&lines[0], "random seed")?[0];
    let seed = if pre_zseed > 0 {
        info!("using specified random number seed of {}", pre_zseed);
        pre_zseed as u64
    } else {
        let t = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(1);
        info!("randomly-generated random number seed is {}", t);
        t
    };

    let ntstep: usize = parse_fields(&lines[1], "timestep count")?[0];
    let steps: Vec<usize> = parse_n_fields(&lines[2], "start and end timestep", 2)?;
    let (itstep, ftstep) = (steps[0], steps[1]);

    let trange: Vec<f64> = parse_n_fields(&lines[3], "start and end times", 2)?;
    let (tmin_days, tmax_days) = (trange[0], trange[1]);
    if !(tmin_days > 0. && tmax_days > tmin_days) {
        return Err(IngestError::Inconsistent(format!(
            "bad time range {} .. {} days",
            tmin_days, tmax_days
        )));
    }

    let nusyn: Vec<f64> = parse_n_fields(&lines[4], "synthesis frequency range", 2)?;
    let nsyn_time: usize = parse_fields(&lines[5], "synthesis time count")?[0];
    let syn_times: Vec<f64> = parse_n_fields(&lines[6], "synthesis time range", 2)?;
    let time_syn: Vec<f64> = (0..nsyn_time)
        .map(|i| (syn_times[0].ln() + syn_times[1] * i as f64).exp() * DAY)
        .collect();

    let model_type = match parse_fields::<i32>(&lines[7], "model type")?[0] {
        1 => ModelType::Spherical1D,
        2 => ModelType::Cylindrical2D,
        3 => ModelType::Cartesian3D,
        other => {
            return Err(IngestError::Inconsistent(format!(
                "unknown model type {}",
                other
            )))
        }
    };

    let rlc: i32 = parse_fields(&lines[8], "lightcurve mode")?[0];
    if !(0..=4).contains(&rlc) {
        return Err(IngestError::Inconsistent(format!(
            "bad lightcurve mode {}",
            rlc
        )));
    }

    let n_out_it: usize = parse_fields(&lines[9], "outer iteration count")?[0];
    let clight_factor: f64 = parse_fields(&lines[10], "speed of light factor")?[0];
    let gamma_grey: f64 = parse_fields(&lines[11], "grey gamma opacity")?[0];

    let syn_dir_in: Vec<f64> = parse_n_fields(&lines[12], "synthesis direction", 3)?;
    let raw = Vector3::new(syn_dir_in[0], syn_dir_in[1], syn_dir_in[2]);
    let syn_dir = if raw.dot(&raw) > 1e-6 {
        raw.normalize()
    } else {
        let z1 = 1. - 2. * rng.gen::<f64>();
        let z2 = rng.gen::<f64>() * 2. * PI;
        let s = (1. - z1 * z1).sqrt();
        Vector3::new(s * z2.cos(), s * z2.sin(), z1)
    };

    let opacity_case: i32 = parse_fields(&lines[13], "opacity case")?[0];
    let rho_crit_para: f64 = parse_fields(&lines[14], "rho_crit parameter")?[0];
    info!("rho_crit_para {}", rho_crit_para);
    let debug_packet: i64 = parse_fields(&lines[15], "debug packet id")?[0];

    let continue_flag: i32 = parse_fields(&lines[16], "continuation flag")?[0];
    let simulation_continued_from_saved = continue_flag == 1;
    if simulation_continued_from_saved {
        info!("resuming simulation from saved point");
    } else {
        info!("starting a new simulation");
    }

    let rfcut_angstroms: f64 = parse_fields(&lines[17], "radiation field cut")?[0];
    let nu_rfcut = CLIGHT / (rfcut_angstroms * 1e-8);
    let n_lte_timesteps: usize = parse_fields(&lines[18], "LTE timestep count")?[0];

    let grey: Vec<f64> = parse_n_fields(&lines[19], "grey cell threshold", 2)?;
    let (cell_is_optically_thick, n_grey_timesteps) = (grey[0], grey[1] as usize);

    let max_bf_continua: i64 = parse_fields(&lines[20], "bf continuum cap")?[0];
    let max_bf_continua = if max_bf_continua == -1 {
        info!("using all bf continua");
        1_000_000
    } else {
        info!("using only {} bf continua per ion", max_bf_continua);
        max_bf_continua
    };

    let nprocs_exspec: usize = parse_fields(&lines[21], "exspec task count")?[0];
    let do_emission_res: i32 = parse_fields(&lines[22], "emission-res flag")?[0];

    let kdiff: Vec<f64> = parse_n_fields(&lines[23], "k-packet diffusion parameters", 2)?;
    let (kpktdiffusion_timescale, n_kpktdiffusion_timesteps) = (kdiff[0], kdiff[1] as usize);
    info!(
        "kpkts diffuse {} of a timestep's length for the first {} timesteps",
        kpktdiffusion_timescale, n_kpktdiffusion_timesteps
    );

    Ok(RunParameters {
        seed,
        ntstep,
        itstep,
        ftstep,
        tmin: tmin_days * DAY,
        tmax: tmax_days * DAY,
        nusyn_min: nusyn[0] * MEV / H,
        nusyn_max: nusyn[1] * MEV / H,
        nsyn_time,
        time_syn,
        model_type,
        do_r_lc: rlc != 0,
        do_rlc_est: if rlc > 0 { rlc - 1 } else { 0 },
        n_out_it,
        clight_prop: clight_factor * CLIGHT,
        gamma_grey,
        syn_dir,
        opacity_case,
        rho_crit_para,
        debug_packet,
        simulation_continued_from_saved,
        nu_rfcut,
        n_lte_timesteps,
        cell_is_optically_thick,
        n_grey_timesteps,
        max_bf_continua,
        nprocs_exspec,
        do_emission_res,
        kpktdiffusion_timescale,
        n_kpktdiffusion_timesteps,
    })
}

/// Rewrite `input.txt` in place so a rerun restarts from timestep `nts`:
/// the start/end timestep line becomes `nts ftstep`, the continuation flag
/// becomes 1, and every significant line gets its canonical comment.
pub fn update_parameterfile(path: &Path, nts: usize, ftstep: usize) -> std::io::Result<()> {
    info!("updating {} for restart at timestep {}", path.display(), nts);
    let contents = fs::read_to_string(path)?;

    let tmp_path = path.with_extension("txt.tmp");
    let mut out = fs::File::create(&tmp_path)?;

    let mut noncomment_linenum: i64 = -1;
    for raw_line in contents.lines() {
        let mut line = raw_line.to_string();
        if !line_is_comment_only(&line) {
            noncomment_linenum += 1;

            if noncomment_linenum == 2 {
                line = format!("{:03} {:03}", nts, ftstep);
            } else if noncomment_linenum == 16 {
                line = "1".to_string();
            }

            if (noncomment_linenum as usize) < INPUT_LINE_COMMENTS.len() {
                const COMMENT_START: usize = 25;
                if let Some(pos) = line.find('#') {
                    line.truncate(pos);
                }
                let mut data = line.trim_end().to_string();
                while data.len() < COMMENT_START {
                    data.push(' ');
                }
                line = format!("{}# {}", data, INPUT_LINE_COMMENTS[noncomment_linenum as usize]);
            }
        }
        writeln!(out, "{}", line)?;
    }
    out.flush()?;
    drop(out);

    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    fn example_input() -> String {
        let lines = [
            "42",
            "100",
            "000 099",
            "2.0 80.0",
            "0.2 4.0",
            "10",
            "2.0 0.32",
            "1",
            "2",
            "1",
            "1.0",
            "-1.0",
            "0 0 1",
            "1",
            "0.5",
            "-1",
            "0",
            "10000",
            "12",
            "10.0 30",
            "-1",
            "1",
            "0",
            "0.5 10",
        ];
        let mut s = String::from("# test parameter file\n");
        for l in &lines {
            s.push_str(l);
            s.push('\n');
        }
        s
    }

    fn temp_input(name: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("snmc_input_{}_{}", std::process::id(), name));
        std::fs::write(&path, example_input()).unwrap();
        path
    }

    #[test]
    fn test_read_parameterfile() {
        let path = temp_input("read.txt");
        let mut rng = Pcg64::seed_from_u64(1);
        let params = read_parameterfile(&path, &mut rng).unwrap();
        assert_eq!(params.seed, 42);
        assert_eq!(params.ntstep, 100);
        assert_eq!(params.itstep, 0);
        assert_eq!(params.ftstep, 99);
        assert_eq!(params.model_type, ModelType::Spherical1D);
        assert!(!params.simulation_continued_from_saved);
        assert_eq!(params.n_lte_timesteps, 12);
        assert_eq!(params.n_grey_timesteps, 30);
        assert_eq!(params.n_kpktdiffusion_timesteps, 10);
        assert!((params.tmin - 2.0 * DAY).abs() < 1.);
        assert!((params.syn_dir.norm() - 1.).abs() < 1e-12);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_update_parameterfile_sets_continuation() {
        let path = temp_input("update.txt");
        update_parameterfile(&path, 57, 99).unwrap();

        let mut rng = Pcg64::seed_from_u64(1);
        let params = read_parameterfile(&path, &mut rng).unwrap();
        assert!(params.simulation_continued_from_saved);
        assert_eq!(params.itstep, 57);
        assert_eq!(params.ftstep, 99);

        // comments were re-annotated
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("# simulation_continued_from_saved"));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_comment_only_detection() {
        assert!(line_is_comment_only("# a comment"));
        assert!(line_is_comment_only("   # indented"));
        assert!(line_is_comment_only(""));
        assert!(!line_is_comment_only("42 # trailing comment"));
    }
}
