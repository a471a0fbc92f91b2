//! Optical (r-) packet transport.
//!
//! Between events an r-packet accumulates optical depth from electron
//! scattering, free-free and bound-free continua, and from Sobolev line
//! resonances as it redshifts through the sorted line list. The
//! `next_trans` field is a forward hint into that list; it is invalidated
//! by any direction or frequency change and by any k-packet round trip.

use rand::Rng;
use rand_pcg::Pcg64;

use crate::atomic::{AtomicData, EMISSION_FREEFREE};
use crate::cellhistory::{self, CellHistory};
use crate::constant::{CLIGHT, ME, PI, QE, SIGMA_T};
use crate::estimators::Estimators;
use crate::maths;
use crate::options;
use crate::packet::{Packet, PacketKind};
use crate::radfield;

use super::macroatom;
use super::{apply_crossing, emit_isotropic_cmf, move_packet, TransportContext};

/// First line (in sorted order) redward of `nu_cmf`, starting no earlier
/// than the forward hint.
pub fn closest_transition(atomic: &AtomicData, nu_cmf: f64, hint: u32) -> usize {
    let lo = atomic
        .linelist
        .partition_point(|line| line.nu >= nu_cmf);
    lo.max(hint as usize)
}

/// Sobolev optical depth of `line` for a packet at time `t`.
fn tau_sobolev(
    atomic: &AtomicData,
    line: &crate::atomic::Line,
    n_lower: f64,
    n_upper: f64,
    t: f64,
) -> f64 {
    let element = line.elementindex as usize;
    let ion = line.ionindex as usize;
    let g_lower = atomic.stat_weight(element, ion, line.lowerlevelindex as usize);
    let g_upper = atomic.stat_weight(element, ion, line.upperlevelindex as usize);
    // stimulated correction clamped: no masing
    let correction = if n_lower > 0. {
        (1. - g_lower * n_upper / (g_upper * n_lower)).max(0.)
    } else {
        0.
    };
    PI * QE * QE / (ME * CLIGHT) * line.osc_strength * (CLIGHT / line.nu) * t * n_lower
        * correction
}

/// One r-packet leg: propagate to the next event, boundary crossing, or the
/// end of the timestep.
pub fn do_rpkt(
    ctx: &TransportContext,
    pkt: &mut Packet,
    est: &mut Estimators,
    history: &mut CellHistory,
    rng: &mut Pcg64,
) {
    let mgi = ctx.mgi_of(pkt);

    let (d_boundary, crossing) = ctx.grid.boundary_distance(
        pkt.cellindex as usize,
        &pkt.pos,
        &pkt.dir,
        pkt.prop_time,
        pkt.last_cross,
    );
    let d_timestep = (ctx.t_end - pkt.prop_time) * CLIGHT;
    let boundary_first = d_boundary < d_timestep;
    let d_cap = d_boundary.min(d_timestep);

    // packets in the void are passively advected
    if ctx.is_void(mgi) {
        move_packet(pkt, d_cap);
        if boundary_first {
            apply_crossing(pkt, crossing);
        } else {
            pkt.prop_time = ctx.t_end;
        }
        return;
    }

    let cell = &ctx.model.cells[mgi];
    history.enter_cell(mgi);

    let tau_rnd = -rng.gen::<f64>().ln();
    let mut tau = 0.;
    let mut d_travelled = 0.;
    let mut lineindex = closest_transition(ctx.atomic, pkt.nu_cmf, pkt.next_trans);

    loop {
        let vel = maths::velocity(&pkt.pos, pkt.prop_time);
        let dopplerfactor = maths::doppler(&pkt.dir, &vel);

        // continuum opacities in the comoving frame, at the current
        // comoving frequency
        let chi_es = SIGMA_T * cell.nne;
        // grey cells interact through electron scattering only
        let chi_ff = if cell.thick {
            0.
        } else {
            cellhistory::chi_ff(ctx.atomic, cell, pkt.nu_cmf)
        };
        let chi_bf = if cell.thick {
            0.
        } else {
            let (total, _) = history.chi_bf(ctx.atomic, cell, pkt.nu_cmf);
            total
        };
        let chi_cont_cmf = chi_es + chi_ff + chi_bf;
        let chi_cont = (chi_cont_cmf * dopplerfactor).max(0.);

        let d_remaining = d_cap - d_travelled;
        let d_line = if lineindex < ctx.atomic.nlines() && !cell.thick {
            let nu_line = ctx.atomic.line(lineindex).nu;
            if nu_line >= pkt.nu_cmf {
                0.
            } else {
                CLIGHT * pkt.prop_time * (pkt.nu_cmf / nu_line - 1.)
            }
        } else {
            f64::MAX
        };

        if d_line >= d_remaining {
            // continuum only up to the boundary or timestep cap
            let tau_cont = chi_cont * d_remaining;
            if tau + tau_cont > tau_rnd {
                let d_event = (tau_rnd - tau) / chi_cont;
                tally_segment(ctx, est, history, cell, mgi, pkt, d_event, chi_ff);
                move_packet(pkt, d_event);
                continuum_event(ctx, pkt, history, cell, chi_es, chi_ff, rng);
            } else {
                tally_segment(ctx, est, history, cell, mgi, pkt, d_remaining, chi_ff);
                move_packet(pkt, d_remaining);
                pkt.next_trans = lineindex as u32;
                if boundary_first {
                    apply_crossing(pkt, crossing);
                } else {
                    pkt.prop_time = ctx.t_end;
                }
            }
            return;
        }

        // a line resonance comes first
        let tau_cont = chi_cont * d_line;
        if tau + tau_cont > tau_rnd {
            let d_event = (tau_rnd - tau) / chi_cont;
            tally_segment(ctx, est, history, cell, mgi, pkt, d_event, chi_ff);
            move_packet(pkt, d_event);
            continuum_event(ctx, pkt, history, cell, chi_es, chi_ff, rng);
            return;
        }

        tally_segment(ctx, est, history, cell, mgi, pkt, d_line, chi_ff);
        move_packet(pkt, d_line);
        tau += tau_cont;
        d_travelled += d_line;

        let line = ctx.atomic.line(lineindex).clone();
        let element = line.elementindex as usize;
        let ion = line.ionindex as usize;
        let n_lower =
            history.level_pop(ctx.atomic, cell, element, ion, line.lowerlevelindex as usize);
        let n_upper =
            history.level_pop(ctx.atomic, cell, element, ion, line.upperlevelindex as usize);
        let tau_line = tau_sobolev(ctx.atomic, &line, n_lower, n_upper, pkt.prop_time);

        if let Some(slot) = est.jb_lu_slot(mgi, lineindex as u32) {
            est.jb_lu[slot] += pkt.e_rf;
        }

        if tau + tau_line > tau_rnd {
            // line event
            pkt.interactions += 1;
            pkt.absorptiontype = lineindex as i32;
            pkt.absorptionfreq = pkt.nu_rf;
            pkt.absorptiondir = pkt.dir;
            pkt.next_trans = lineindex as u32 + 1;

            let outcome = macroatom::do_macroatom(
                ctx.atomic,
                cell,
                element,
                ion,
                line.upperlevelindex as usize,
                rng,
            );
            super::kpkt::apply_macroatom_outcome(ctx, pkt, outcome, cell.t_e, rng);
            return;
        }

        tau += tau_line;
        lineindex += 1;
        pkt.next_trans = lineindex as u32;
    }
}

/// Estimator contributions of a path segment of length `d` (before the
/// packet moves).
#[allow(clippy::too_many_arguments)]
fn tally_segment(
    ctx: &TransportContext,
    est: &mut Estimators,
    history: &mut CellHistory,
    cell: &crate::model::ModelCell,
    mgi: usize,
    pkt: &Packet,
    d: f64,
    chi_ff: f64,
) {
    if d <= 0. {
        return;
    }
    let contribution = pkt.e_rf * d;
    radfield::update_estimators(est, ctx.bins, mgi, pkt.nu_cmf, contribution);
    est.ffheating[mgi] += contribution * chi_ff;

    if options::DETAILED_BF_ESTIMATORS_ON && !est.bfrate.is_empty() {
        let (_, cumulative) = history.chi_bf(ctx.atomic, cell, pkt.nu_cmf);
        let mut prev = 0.;
        for (k, &cum) in cumulative.iter().enumerate() {
            let chi_k = cum - prev;
            prev = cum;
            if chi_k > 0. {
                let slot = est.bfrate_slot(mgi, k);
                est.bfrate[slot] += contribution * chi_k;
            }
        }
    }
}

/// Dispatch a continuum event: electron scattering, free-free absorption,
/// or bound-free absorption into one sampled continuum.
#[allow(clippy::too_many_arguments)]
fn continuum_event(
    ctx: &TransportContext,
    pkt: &mut Packet,
    history: &mut CellHistory,
    cell: &crate::model::ModelCell,
    chi_es: f64,
    chi_ff: f64,
    rng: &mut Pcg64,
) {
    pkt.interactions += 1;

    let (chi_bf, _) = history.chi_bf(ctx.atomic, cell, pkt.nu_cmf);
    let chi_total = if cell.thick { chi_es } else { chi_es + chi_ff + chi_bf };
    let zrand: f64 = rng.gen::<f64>();
    let pick = zrand * chi_total;

    if pick < chi_es || cell.thick {
        // coherent electron scattering: new direction, same nu_cmf
        pkt.nscatterings += 1;
        emit_isotropic_cmf(pkt, rng);
        pkt.next_trans = 0;
        return;
    }
    if pick < chi_es + chi_ff {
        // free-free absorption thermalises the packet
        pkt.kind = PacketKind::KPacket;
        pkt.absorptiontype = EMISSION_FREEFREE;
        pkt.last_cross = crate::grid::Cross::None;
        pkt.next_trans = 0;
        return;
    }

    // bound-free: sample the absorbing continuum by its opacity share,
    // then the target by branching probability; the packet thermalises
    // carrying the full energy
    let (total, cumulative) = history.chi_bf(ctx.atomic, cell, pkt.nu_cmf);
    let target_chi = rng.gen::<f64>() * total;
    let k = match cumulative.binary_search_by(|probe| probe.total_cmp(&target_chi)) {
        Ok(i) => i,
        Err(i) => i.min(cumulative.len().saturating_sub(1)),
    };
    let cont = &ctx.atomic.allcont[k];
    let (element, ion, level) = (cont.element as usize, cont.ion as usize, cont.level as usize);

    let ntargets = ctx.atomic.nphixstargets(element, ion, level);
    let mut target = 0;
    let mut zrand: f64 = rng.gen::<f64>();
    for t in 0..ntargets {
        let p = ctx.atomic.phixsprobability(element, ion, level, t);
        if zrand < p {
            target = t;
            break;
        }
        zrand -= p;
        target = t;
    }

    pkt.kind = PacketKind::KPacket;
    pkt.absorptiontype = ctx.atomic.continuumindex(element, ion, level, target);
    pkt.last_cross = crate::grid::Cross::None;
    pkt.next_trans = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::Line;

    fn line_at(nu: f64) -> Line {
        Line {
            elementindex: 0,
            ionindex: 0,
            lowerlevelindex: 0,
            upperlevelindex: 1,
            nu,
            einstein_a: 1e7,
            osc_strength: 0.1,
            coll_str: -1.,
            forbidden: false,
        }
    }

    #[test]
    fn test_closest_transition_search() {
        let mut atomic = AtomicData::empty();
        atomic.linelist = vec![line_at(4e15), line_at(3e15), line_at(2e15), line_at(1e15)];

        // packet at 2.5e15: next redward line is 2e15 at index 2
        assert_eq!(closest_transition(&atomic, 2.5e15, 0), 2);
        // hint beyond the search result wins
        assert_eq!(closest_transition(&atomic, 2.5e15, 3), 3);
        // bluer than every line
        assert_eq!(closest_transition(&atomic, 5e15, 0), 0);
        // redder than every line: index past the end, no resonances left
        assert_eq!(closest_transition(&atomic, 0.5e15, 0), 4);
    }

    #[test]
    fn test_tau_sobolev_scales_with_population_and_time() {
        let mut atomic = AtomicData::empty();
        atomic.elements = vec![crate::atomic::Element {
            anumber: 8,
            abundance: 1.,
            mass: 16. * crate::constant::MH,
            ions: vec![crate::atomic::Ion {
                ionstage: 1,
                levels: vec![
                    crate::atomic::Level {
                        stat_weight: 2.,
                        ..Default::default()
                    },
                    crate::atomic::Level {
                        stat_weight: 4.,
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }],
        }];
        let line = line_at(2e15);

        let tau1 = tau_sobolev(&atomic, &line, 1e4, 0., 1e6);
        let tau2 = tau_sobolev(&atomic, &line, 2e4, 0., 1e6);
        let tau3 = tau_sobolev(&atomic, &line, 1e4, 0., 2e6);
        assert!(tau1 > 0.);
        assert!((tau2 / tau1 - 2.).abs() < 1e-12);
        assert!((tau3 / tau1 - 2.).abs() < 1e-12);

        // stimulated correction reduces tau, clamped at zero
        let tau_stim = tau_sobolev(&atomic, &line, 1e4, 1e4, 1e6);
        assert!(tau_stim < tau1);
        let tau_masing = tau_sobolev(&atomic, &line, 1e4, 1e8, 1e6);
        assert_eq!(tau_masing, 0.);
    }
}
