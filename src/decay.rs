//! Radioactive decay chains and the energy they inject into the ejecta.
//!
//! Four two-step chains are supported: 56Ni -> 56Co -> 56Fe,
//! 57Ni -> 57Co -> 57Fe, 52Fe -> 52Mn -> 52Cr and 48Cr -> 48V -> 48Ti.
//! Deposition rates use the closed-form two-step Bateman solution; pellet
//! decay times are sampled by inverse-CDF, one independent draw per
//! exponential stage.

use rand::Rng;
use rand_distr::Exp1;

use crate::constant::{DAY, MEV, MH};

pub const RADIONUCLIDE_COUNT: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Radionuclide {
    Ni56,
    Co56,
    Ni57,
    Co57,
    Fe52,
    Mn52,
    Cr48,
    V48,
}

pub const RADIONUCLIDES: [Radionuclide; RADIONUCLIDE_COUNT] = [
    Radionuclide::Ni56,
    Radionuclide::Co56,
    Radionuclide::Ni57,
    Radionuclide::Co57,
    Radionuclide::Fe52,
    Radionuclide::Mn52,
    Radionuclide::Cr48,
    Radionuclide::V48,
];

impl Radionuclide {
    pub fn index(self) -> usize {
        RADIONUCLIDES.iter().position(|&n| n == self).unwrap()
    }

    pub fn from_index(i: usize) -> Radionuclide {
        RADIONUCLIDES[i]
    }

    /// Mean lifetime [s].
    pub fn meanlife(self) -> f64 {
        match self {
            Radionuclide::Ni56 => 8.80 * DAY,
            Radionuclide::Co56 => 113.7 * DAY,
            Radionuclide::Ni57 => 2.14 * DAY,
            Radionuclide::Co57 => 392.03 * DAY,
            Radionuclide::Fe52 => 0.497429 * DAY,
            Radionuclide::Mn52 => 0.0211395 * DAY,
            Radionuclide::Cr48 => 1.29602 * DAY,
            Radionuclide::V48 => 23.0442 * DAY,
        }
    }

    /// Gamma-ray energy released per decay [erg].
    pub fn endecay_gamma(self) -> f64 {
        match self {
            Radionuclide::Ni56 => 1.718 * MEV,
            Radionuclide::Co56 => 3.440 * MEV,
            Radionuclide::Ni57 => 1.937 * MEV,
            Radionuclide::Co57 => 0.122 * MEV,
            Radionuclide::Fe52 => 0.86 * MEV,
            Radionuclide::Mn52 => 2.86 * MEV,
            Radionuclide::Cr48 => 0.4226 * MEV,
            Radionuclide::V48 => 2.8766 * MEV,
        }
    }

    /// Mean positron kinetic energy released per decay [erg]
    /// (branching ratio folded in).
    pub fn endecay_positron(self) -> f64 {
        match self {
            Radionuclide::Co56 => 0.63 * MEV * 0.19,
            Radionuclide::V48 => 0.290 * MEV * 0.5,
            _ => 0.,
        }
    }

    /// Total energy per decay [erg].
    pub fn endecay_total(self) -> f64 {
        self.endecay_gamma() + self.endecay_positron()
    }

    pub fn a(self) -> u32 {
        match self {
            Radionuclide::Ni56 | Radionuclide::Co56 => 56,
            Radionuclide::Ni57 | Radionuclide::Co57 => 57,
            Radionuclide::Fe52 | Radionuclide::Mn52 => 52,
            Radionuclide::Cr48 | Radionuclide::V48 => 48,
        }
    }

    pub fn z(self) -> i32 {
        match self {
            Radionuclide::Ni56 | Radionuclide::Ni57 => 28,
            Radionuclide::Co56 | Radionuclide::Co57 => 27,
            Radionuclide::Fe52 => 26,
            Radionuclide::Mn52 => 25,
            Radionuclide::Cr48 => 24,
            Radionuclide::V48 => 23,
        }
    }

    /// Nuclide mass [g].
    pub fn nucmass(self) -> f64 {
        self.a() as f64 * MH
    }
}

/// A parent -> daughter -> stable decay chain.
#[derive(Clone, Copy, Debug)]
pub struct DecayChain {
    pub parent: Radionuclide,
    pub daughter: Radionuclide,
    /// atomic number of the stable end product
    pub z_final: i32,
}

pub const CHAINS: [DecayChain; 4] = [
    DecayChain {
        parent: Radionuclide::Ni56,
        daughter: Radionuclide::Co56,
        z_final: 26,
    },
    DecayChain {
        parent: Radionuclide::Ni57,
        daughter: Radionuclide::Co57,
        z_final: 26,
    },
    DecayChain {
        parent: Radionuclide::Fe52,
        daughter: Radionuclide::Mn52,
        z_final: 24,
    },
    DecayChain {
        parent: Radionuclide::Cr48,
        daughter: Radionuclide::V48,
        z_final: 22,
    },
];

/// Pellet energy available per gram of ejecta with the given initial
/// radionuclide mass fractions (both chain steps released eventually).
pub fn pellet_energy_per_mass(radioabund_init: &[f64; RADIONUCLIDE_COUNT]) -> f64 {
    let mut sum = 0.;
    for chain in &CHAINS {
        let f_parent = radioabund_init[chain.parent.index()];
        sum += f_parent * (chain.parent.endecay_total() + chain.daughter.endecay_total())
            / chain.parent.nucmass();
        // daughter present in the initial composition decays on its own
        let f_daughter = radioabund_init[chain.daughter.index()];
        sum += f_daughter * chain.daughter.endecay_total() / chain.daughter.nucmass();
    }
    sum
}

/// Decay time of a parent pellet: t = -tau ln U.
pub fn sample_parent_decay_time<R: Rng + ?Sized>(nuclide: Radionuclide, rng: &mut R) -> f64 {
    let x: f64 = rng.sample(Exp1);
    nuclide.meanlife() * x
}

/// Decay time of a daughter pellet created from an undecayed parent:
/// the sum of two independent exponential stages.
pub fn sample_daughter_decay_time<R: Rng + ?Sized>(chain: &DecayChain, rng: &mut R) -> f64 {
    let x1: f64 = rng.sample(Exp1);
    let x2: f64 = rng.sample(Exp1);
    chain.parent.meanlife() * x1 + chain.daughter.meanlife() * x2
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DepositionRate {
    /// gamma-ray energy release rate [erg/s/g]
    pub gamma: f64,
    /// positron kinetic energy release rate [erg/s/g]
    pub positron: f64,
}

/// Energy release rate per gram at time `t` after explosion, from the
/// two-step Bateman solution for every chain.
pub fn cell_deposition_rate(radioabund_init: &[f64; RADIONUCLIDE_COUNT], t: f64) -> DepositionRate {
    let mut rate = DepositionRate::default();
    for chain in &CHAINS {
        let tau_p = chain.parent.meanlife();
        let tau_d = chain.daughter.meanlife();
        let n_p0 = radioabund_init[chain.parent.index()] / chain.parent.nucmass();
        let n_d0 = radioabund_init[chain.daughter.index()] / chain.daughter.nucmass();

        // parent activity
        let parent_rate = n_p0 * (-t / tau_p).exp() / tau_p;
        rate.gamma += parent_rate * chain.parent.endecay_gamma();
        rate.positron += parent_rate * chain.parent.endecay_positron();

        // daughter fed by the parent, plus any daughter present at t=0
        let fed_rate = n_p0 * ((-t / tau_p).exp() - (-t / tau_d).exp()) / (tau_p - tau_d);
        let init_rate = n_d0 * (-t / tau_d).exp() / tau_d;
        rate.gamma += (fed_rate + init_rate) * chain.daughter.endecay_gamma();
        rate.positron += (fed_rate + init_rate) * chain.daughter.endecay_positron();
    }
    rate
}

/// Current radionuclide mass fractions from the initial ones.
pub fn radioabund_at_time(
    radioabund_init: &[f64; RADIONUCLIDE_COUNT],
    t: f64,
) -> [f64; RADIONUCLIDE_COUNT] {
    let mut out = [0.; RADIONUCLIDE_COUNT];
    for chain in &CHAINS {
        let tau_p = chain.parent.meanlife();
        let tau_d = chain.daughter.meanlife();
        let f_p0 = radioabund_init[chain.parent.index()];
        let f_d0 = radioabund_init[chain.daughter.index()];

        out[chain.parent.index()] = f_p0 * (-t / tau_p).exp();
        // the mass numbers of parent and daughter are equal, so mass
        // fractions follow the number densities directly
        out[chain.daughter.index()] = f_d0 * (-t / tau_d).exp()
            + f_p0 * tau_d / (tau_p - tau_d) * ((-t / tau_p).exp() - (-t / tau_d).exp());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    #[test]
    fn test_parent_decay_time_cdf() {
        // empirical CDF of t = -tau ln U against 1 - exp(-t/tau),
        // Kolmogorov-Smirnov bound at the 1% level
        let mut rng = Pcg64::seed_from_u64(5);
        let tau = Radionuclide::Ni56.meanlife();
        let n = 1_000_000;
        let mut times: Vec<f64> = (0..n)
            .map(|_| sample_parent_decay_time(Radionuclide::Ni56, &mut rng))
            .collect();
        times.sort_by(|a, b| a.total_cmp(b));

        let mut dmax: f64 = 0.;
        for (i, &t) in times.iter().enumerate() {
            let empirical = (i + 1) as f64 / n as f64;
            let analytic = 1. - (-t / tau).exp();
            dmax = dmax.max((empirical - analytic).abs());
        }
        let ks_bound = 1.63 / (n as f64).sqrt();
        assert!(dmax < ks_bound, "KS statistic {} exceeds {}", dmax, ks_bound);
    }

    #[test]
    fn test_daughter_decay_time_mean() {
        let mut rng = Pcg64::seed_from_u64(9);
        let chain = &CHAINS[0];
        let n = 200_000;
        let mean = (0..n)
            .map(|_| sample_daughter_decay_time(chain, &mut rng))
            .sum::<f64>()
            / n as f64;
        let expected = chain.parent.meanlife() + chain.daughter.meanlife();
        assert_approx_eq!(mean, expected, 0.01 * expected);
    }

    #[test]
    fn test_deposition_rate_integrates_to_total_energy() {
        // integrating the Bateman release rate over all time recovers the
        // pellet energy per gram
        let mut radioabund = [0.; RADIONUCLIDE_COUNT];
        radioabund[Radionuclide::Ni56.index()] = 1.0;

        let tau_d = Radionuclide::Co56.meanlife();
        let t_end = 40. * tau_d;
        let nsteps = 400_000;
        let dt = t_end / nsteps as f64;
        let mut total = 0.;
        for i in 0..nsteps {
            let t = (i as f64 + 0.5) * dt;
            let rate = cell_deposition_rate(&radioabund, t);
            total += (rate.gamma + rate.positron) * dt;
        }

        let expected = pellet_energy_per_mass(&radioabund);
        assert_approx_eq!(total, expected, 1e-3 * expected);
    }

    #[test]
    fn test_radioabund_conserves_chain_mass_early() {
        let mut radioabund = [0.; RADIONUCLIDE_COUNT];
        radioabund[Radionuclide::Ni56.index()] = 0.5;
        let t = 2. * DAY;
        let now = radioabund_at_time(&radioabund, t);
        let ni = now[Radionuclide::Ni56.index()];
        let co = now[Radionuclide::Co56.index()];
        assert!(ni < 0.5);
        assert!(co > 0.);
        // 56Co is long-lived compared to two days, so the chain mass is
        // still essentially all in Ni and Co
        assert_approx_eq!(ni + co, 0.5, 5e-3);
    }
}
