//! Timestep table: logarithmically spaced steps over [tmin, tmax], with a
//! trailing sentinel step holding the end time.

use std::path::Path;

use crate::constant::DAY;
use crate::errors::IngestError;

#[derive(Clone, Copy, Debug, Default)]
pub struct TimeStep {
    /// start of the step [s]
    pub start: f64,
    pub mid: f64,
    pub width: f64,
    /// pellets that decayed during this step
    pub pellet_decays: u64,
    /// energy deposited by positrons and gammas this step [erg]
    pub positron_dep: f64,
    pub gamma_dep: f64,
    /// comoving-frame luminosity tally [erg]
    pub cmf_lum: f64,
}

/// Build the timestep table; entry `ntstep` is the sentinel containing the
/// end of the calculation.
pub fn time_init(tmin: f64, tmax: f64, ntstep: usize) -> Vec<TimeStep> {
    let mut steps = vec![TimeStep::default(); ntstep + 1];
    let dlogt = (tmax.ln() - tmin.ln()) / ntstep as f64;
    for (n, step) in steps.iter_mut().take(ntstep).enumerate() {
        step.start = tmin * (n as f64 * dlogt).exp();
        step.mid = tmin * ((n as f64 + 0.5) * dlogt).exp();
        step.width = tmin * ((n as f64 + 1.) * dlogt).exp() - step.start;
    }

    // consistency: steps tile [tmin, tmax] without gaps
    for n in 1..ntstep {
        debug_assert!(
            ((steps[n - 1].start + steps[n - 1].width) / steps[n].start - 1.).abs() < 1e-3
        );
    }

    steps[ntstep].start = tmax;
    steps[ntstep].mid = tmax;
    steps
}

/// `timesteps.out`: per timestep (index, t_start_days, t_mid_days,
/// t_width_days).
pub fn write_timestep_file(path: &Path, steps: &[TimeStep]) -> Result<(), IngestError> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b' ')
        .has_headers(false)
        .from_path(path)
        .map_err(|e| IngestError::Inconsistent(format!("cannot write timesteps.out: {}", e)))?;

    writer
        .write_record(&["#timestep", "tstart_days", "tmid_days", "twidth_days"])
        .map_err(|e| IngestError::Inconsistent(format!("cannot write timesteps.out: {}", e)))?;
    for (n, step) in steps.iter().enumerate().take(steps.len() - 1) {
        writer
            .write_record(&[
                n.to_string(),
                format!("{:e}", step.start / DAY),
                format!("{:e}", step.mid / DAY),
                format!("{:e}", step.width / DAY),
            ])
            .map_err(|e| IngestError::Inconsistent(format!("cannot write timesteps.out: {}", e)))?;
    }
    writer
        .flush()
        .map_err(|e| IngestError::Inconsistent(format!("cannot write timesteps.out: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_time_init_tiles_the_range() {
        let tmin = 2. * DAY;
        let tmax = 80. * DAY;
        let steps = time_init(tmin, tmax, 100);
        assert_eq!(steps.len(), 101);
        assert_approx_eq!(steps[0].start, tmin, 1e-6);
        assert_approx_eq!(steps[99].start + steps[99].width, tmax, tmax * 1e-12);
        for n in 1..100 {
            assert_approx_eq!(
                steps[n - 1].start + steps[n - 1].width,
                steps[n].start,
                steps[n].start * 1e-12
            );
            // logarithmic spacing: widths grow
            assert!(steps[n].width > steps[n - 1].width);
        }
        // sentinel holds the end of the calculation
        assert_approx_eq!(steps[100].start, tmax, 1e-6);
    }

    #[test]
    fn test_write_timestep_file() {
        let steps = time_init(2. * DAY, 80. * DAY, 10);
        let path = std::env::temp_dir().join(format!("snmc_ts_{}.out", std::process::id()));
        write_timestep_file(&path, &steps).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 11);
        assert!(lines[0].starts_with("#timestep"));
        assert!(lines[1].starts_with("0 "));
        std::fs::remove_file(&path).ok();
    }
}
