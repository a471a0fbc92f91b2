//! Thermal (k-) packet processing.
//!
//! A k-packet samples one channel of the cell's cooling-term vector and
//! comes back out as a free-free photon, a bound-free photon, a line photon
//! via the macro-atom, or stays thermal after a collisional round trip.
//! During the first timesteps k-packets may diffuse for a fraction of the
//! timestep before re-emitting, which breaks the tight collisional loops
//! that otherwise dominate the work imbalance.

use rand::Rng;
use rand_pcg::Pcg64;

use crate::atomic::{EMISSION_FREEFREE};
use crate::cellhistory::{CellHistory, CoolingChannel};
use crate::constant::{H, KB};
use crate::estimators::Estimators;
use crate::grid::Cross;
use crate::packet::{Packet, PacketKind};

use super::macroatom::{self, MacroAtomOutcome};
use super::{emit_isotropic_cmf, TransportContext};

pub fn do_kpkt(
    ctx: &TransportContext,
    pkt: &mut Packet,
    _est: &mut Estimators,
    history: &mut CellHistory,
    rng: &mut Pcg64,
) {
    let mgi = ctx.mgi_of(pkt);
    if ctx.is_void(mgi) {
        // a thermal packet cannot exist in the void; advect it out of the
        // timestep and let the next step deal with it
        pkt.pos *= ctx.t_end / pkt.prop_time;
        pkt.prop_time = ctx.t_end;
        return;
    }
    let cell = &ctx.model.cells[mgi];

    // k-packet diffusion for the early timesteps
    if ctx.nts < ctx.params.n_kpktdiffusion_timesteps && ctx.params.kpktdiffusion_timescale > 0. {
        let t_diffuse = pkt.prop_time + ctx.params.kpktdiffusion_timescale * ctx.ts_width;
        if t_diffuse >= ctx.t_end {
            pkt.pos *= ctx.t_end / pkt.prop_time;
            pkt.prop_time = ctx.t_end;
            return;
        }
        pkt.pos *= t_diffuse / pkt.prop_time;
        pkt.prop_time = t_diffuse;
    }

    history.enter_cell(mgi);
    let (_, cumulative, total) = history.cooling(ctx.atomic, ctx.cooling_layout, cell);
    if total <= 0. {
        // nothing to cool through: emit thermally in the free-free channel
        emit_ff(pkt, cell.t_e, rng);
        return;
    }

    // inverse-CDF sample of the cooling channel
    let zrand: f64 = rng.gen::<f64>();
    let target = zrand * total;
    let idx = match cumulative
        .binary_search_by(|probe| probe.total_cmp(&target))
    {
        Ok(i) => i,
        Err(i) => i.min(cumulative.len() - 1),
    };
    let channel = ctx.cooling_layout[idx];

    let t_e = cell.t_e;
    match channel {
        CoolingChannel::FreeFree { .. } => {
            emit_ff(pkt, t_e, rng);
        }
        CoolingChannel::BoundFree {
            element,
            ion,
            level,
            target,
        } => {
            emit_bf(
                ctx,
                pkt,
                t_e,
                element as usize,
                ion as usize,
                level as usize,
                target as usize,
                rng,
            );
        }
        CoolingChannel::ColIonization {
            element,
            ion,
            level,
            target,
        } => {
            // collisional ionisation puts the atom in the upper ion; the
            // macro-atom decides how the energy comes back out
            let upperlevel = ctx.atomic.phixsupperlevel(
                element as usize,
                ion as usize,
                level as usize,
                target as usize,
            );
            let outcome = macroatom::do_macroatom(
                ctx.atomic,
                cell,
                element as usize,
                ion as usize + 1,
                upperlevel,
                rng,
            );
            apply_macroatom_outcome(ctx, pkt, outcome, t_e, rng);
        }
        CoolingChannel::ColExcitation {
            element,
            ion,
            level,
        } => {
            // pick which upper level was excited, by rate
            let (element, ion, level) = (element as usize, ion as usize, level as usize);
            let uptrans = &ctx.atomic.level(element, ion, level).uptrans_lineindices;
            if uptrans.is_empty() {
                emit_ff(pkt, t_e, rng);
                return;
            }
            let rates: Vec<f64> = uptrans
                .iter()
                .map(|&lineidx| {
                    let line = ctx.atomic.line(lineidx as usize);
                    crate::ratecoeff::col_excitation_coeff(ctx.atomic, line, t_e)
                })
                .collect();
            let total_rate: f64 = rates.iter().sum();
            let mut pick = rng.gen::<f64>() * total_rate;
            let mut chosen = uptrans.len() - 1;
            for (i, &r) in rates.iter().enumerate() {
                if pick < r {
                    chosen = i;
                    break;
                }
                pick -= r;
            }
            let line = ctx.atomic.line(uptrans[chosen] as usize);
            let outcome = macroatom::do_macroatom(
                ctx.atomic,
                cell,
                element,
                ion,
                line.upperlevelindex as usize,
                rng,
            );
            apply_macroatom_outcome(ctx, pkt, outcome, t_e, rng);
        }
    }

}

/// Free-free re-emission: thermal sampling of the exponential emissivity.
fn emit_ff(pkt: &mut Packet, t_e: f64, rng: &mut Pcg64) {
    let zrand: f64 = rng.gen::<f64>();
    let nu_cmf = -KB * t_e.max(crate::options::MINTEMP) / H * zrand.ln();
    to_rpkt(pkt, nu_cmf, EMISSION_FREEFREE, rng);
}

/// Bound-free re-emission just above the threshold, with a thermal tail.
#[allow(clippy::too_many_arguments)]
fn emit_bf(
    ctx: &TransportContext,
    pkt: &mut Packet,
    t_e: f64,
    element: usize,
    ion: usize,
    level: usize,
    target: usize,
    rng: &mut Pcg64,
) {
    let nu_edge = ctx.atomic.phixs_threshold(element, ion, level) / H;
    let zrand: f64 = rng.gen::<f64>();
    let nu_cmf = nu_edge - KB * t_e.max(crate::options::MINTEMP) / H * zrand.ln();
    let emissiontype = ctx.atomic.continuumindex(element, ion, level, target);
    to_rpkt(pkt, nu_cmf, emissiontype, rng);
}

pub(super) fn apply_macroatom_outcome(
    ctx: &TransportContext,
    pkt: &mut Packet,
    outcome: MacroAtomOutcome,
    t_e: f64,
    rng: &mut Pcg64,
) {
    match outcome {
        MacroAtomOutcome::EmitLine(lineidx) => {
            let nu_cmf = ctx.atomic.line(lineidx).nu;
            to_rpkt(pkt, nu_cmf, lineidx as i32, rng);
            // resume the line search just below the emitting transition
            pkt.next_trans = lineidx as u32 + 1;
        }
        MacroAtomOutcome::EmitContinuum {
            element,
            ion,
            level,
            target,
        } => {
            emit_bf(ctx, pkt, t_e, element, ion, level, target, rng);
        }
        MacroAtomOutcome::Thermalise => {
            pkt.kind = PacketKind::KPacket;
            pkt.last_cross = Cross::None;
        }
    }
}

/// Turn the packet into an r-packet at comoving frequency `nu_cmf`,
/// emitted isotropically in the comoving frame.
fn to_rpkt(pkt: &mut Packet, nu_cmf: f64, emissiontype: i32, rng: &mut Pcg64) {
    pkt.kind = PacketKind::RPacket;
    pkt.nu_cmf = nu_cmf.max(1e5);
    pkt.emissiontype = emissiontype;
    pkt.next_trans = 0;
    emit_isotropic_cmf(pkt, rng);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ff_frequency_sampling_is_thermal() {
        // mean of the exponential emissivity sample is kT/h
        use rand::SeedableRng;
        let mut rng = Pcg64::seed_from_u64(8);
        let t_e = 12000.;
        let n = 200_000;
        let mean: f64 = (0..n)
            .map(|_| {
                let z: f64 = rng.gen::<f64>();
                -KB * t_e / H * z.ln()
            })
            .sum::<f64>()
            / n as f64;
        let expected = KB * t_e / H;
        assert!((mean - expected).abs() < 0.01 * expected);
    }
}
