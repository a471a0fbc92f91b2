//! Ingest of the model atom.
//!
//! Reads `compositiondata.txt` (element/ion inventory), `adata.txt` (level
//! energies), `transitiondata.txt` (bound-bound transitions) and
//! `phixsdata_v2.txt` (photoionisation cross-sections), then builds the
//! sorted line list and all cross-indices.
//!
//! Level indices are 1-based in the input files and 0-based in memory.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;

use log::{info, warn};
use multimap::MultiMap;

use crate::constant::{CLIGHT, EV, H, ME, MH, PI, QE};
use crate::errors::IngestError;
use crate::options;

use super::{AtomicData, Element, Ion, Level, Line};

/// starting level index in the input files
const GROUNDSTATE_INDEX_IN: usize = 1;

/// Whitespace token scanner with fscanf-like semantics: tokens flow across
/// line boundaries, but a record reader may discard the rest of the current
/// line (level records carry free-text term designations).
pub(crate) struct Scanner {
    path: String,
    reader: BufReader<File>,
    tokens: VecDeque<String>,
}

impl Scanner {
    pub fn open(path: &Path) -> Result<Self, IngestError> {
        let file = File::open(path).map_err(|source| IngestError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Scanner {
            path: path.display().to_string(),
            reader: BufReader::new(file),
            tokens: VecDeque::new(),
        })
    }

    fn refill(&mut self) -> Result<bool, IngestError> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self
                .reader
                .read_line(&mut line)
                .map_err(|source| IngestError::Read {
                    path: self.path.clone(),
                    source,
                })?;
            if n == 0 {
                return Ok(false);
            }
            if line.split_whitespace().next().is_some() {
                self.tokens
                    .extend(line.split_whitespace().map(|s| s.to_string()));
                return Ok(true);
            }
        }
    }

    /// Next token parsed as `T`; EOF is an error.
    pub fn next<T: FromStr>(&mut self, what: &'static str) -> Result<T, IngestError> {
        match self.try_next(what)? {
            Some(v) => Ok(v),
            None => Err(IngestError::UnexpectedEof(self.path.clone())),
        }
    }

    /// Next token parsed as `T`, or `None` at end of file.
    pub fn try_next<T: FromStr>(&mut self, what: &'static str) -> Result<Option<T>, IngestError> {
        while self.tokens.is_empty() {
            if !self.refill()? {
                return Ok(None);
            }
        }
        let tok = self.tokens.pop_front().unwrap();
        match tok.parse::<T>() {
            Ok(v) => Ok(Some(v)),
            Err(_) => Err(IngestError::Malformed {
                file: self.path.clone(),
                what,
                found: Some(tok),
            }),
        }
    }

    /// Discard the remaining tokens of the current line.
    pub fn skip_rest_of_line(&mut self) {
        self.tokens.clear();
    }
}

#[derive(Clone, Copy, Debug)]
struct TransitionRow {
    lower: usize,
    upper: usize,
    a: f64,
    coll_str: f64,
    forbidden: bool,
}

/// Read the whole model atom from `dir` and build the immutable store.
pub fn read_atomic_data(dir: &Path, rank: usize) -> Result<AtomicData, IngestError> {
    let mut composition = Scanner::open(&dir.join("compositiondata.txt"))?;
    let mut adata = Scanner::open(&dir.join("adata.txt"))?;
    let mut transitiondata = Scanner::open(&dir.join("transitiondata.txt"))?;

    let nelements_in: usize = composition.next("element count")?;
    let t_preset: i32 = composition.next("T_preset")?;
    if t_preset > 0 {
        return Err(IngestError::Inconsistent(
            "preset temperatures are no longer supported (T_preset > 0)".to_string(),
        ));
    }
    let homogeneous_in: i32 = composition.next("homogeneous abundance flag")?;

    let mut data = AtomicData::empty();
    data.elements.reserve(nelements_in);
    data.homogeneous_abundances = homogeneous_in != 0;
    if data.homogeneous_abundances {
        info!("homogeneous abundances as defined in compositiondata.txt are active");
    }

    let mut uniqueionindex = 0usize;
    let mut uniquelevelindexstart = 0usize;
    let mut totaluptrans = 0usize;
    let mut totaldowntrans = 0usize;

    for _ in 0..nelements_in {
        let z: i32 = composition.next("atomic number")?;
        let nions: usize = composition.next("ion count")?;
        let lowermost_ionstage: i32 = composition.next("lowest ion stage")?;
        let uppermost_ionstage: i32 = composition.next("highest ion stage")?;
        let nlevelsmax_readin: i64 = composition.next("max level count")?;
        let abundance: f64 = composition.next("mass fraction")?;
        let mass_amu: f64 = composition.next("mass in amu")?;

        info!(
            "reading element Z {} with {} ions (stages {}..{}), nlevelsmax {}",
            z, nions, lowermost_ionstage, uppermost_ionstage, nlevelsmax_readin
        );
        if z <= 0 || nions == 0 || abundance < 0. || mass_amu < 0. {
            return Err(IngestError::Inconsistent(format!(
                "bad element record for Z={} in compositiondata.txt",
                z
            )));
        }
        if nions as i32 != uppermost_ionstage - lowermost_ionstage + 1 {
            return Err(IngestError::Inconsistent(format!(
                "ion stage range {}..{} does not span {} ions for Z={}",
                lowermost_ionstage, uppermost_ionstage, nions, z
            )));
        }
        if nions > options::MIONS {
            return Err(IngestError::ResourceLimit(format!(
                "element Z={} wants {} ions but the compiled limit is {}",
                z,
                nions,
                options::MIONS
            )));
        }

        let mut element = Element {
            anumber: z,
            abundance,
            mass: mass_amu * MH,
            ions: Vec::with_capacity(nions),
        };

        // all level energies are stored relative to the ground level of the
        // neutral ion, so each ion adds the previous stage's potential
        let mut energyoffset = 0.;
        let mut ionpot_ev = 0.;
        for ion in 0..nions {
            let ionstage_wanted = lowermost_ionstage + ion as i32;
            energyoffset += ionpot_ev;

            // skip adata blocks until this (Z, ionstage) comes up
            let mut adata_z: i32 = -1;
            let mut adata_ionstage: i32 = -1;
            let mut nlevels: usize = 0;
            while adata_z != z || adata_ionstage != ionstage_wanted {
                if adata_z == z {
                    energyoffset += ionpot_ev;
                }
                for _ in 0..nlevels {
                    skip_level_record(&mut adata)?;
                }
                adata_z = adata.next("adata Z")?;
                adata_ionstage = adata.next("adata ion stage")?;
                nlevels = adata.next("adata level count")?;
                ionpot_ev = adata.next("adata ionisation potential")?;
                adata.skip_rest_of_line();
            }

            let nlevelsmax = if nlevelsmax_readin < 0 {
                nlevels
            } else if nlevels >= nlevelsmax_readin as usize {
                info!(
                    "reduce number of levels from {} to {} for Z={} ion stage {}",
                    nlevels, nlevelsmax_readin, z, ionstage_wanted
                );
                nlevelsmax_readin as usize
            } else {
                warn!(
                    "requested nlevelsmax={} > nlevels={} for Z={} ion stage {}, reduced to nlevels",
                    nlevelsmax_readin, nlevels, z, ionstage_wanted
                );
                nlevels
            };

            // proceed through the transition list until this ion stage
            let mut transdata_z: i32 = -1;
            let mut transdata_ionstage: i32 = -1;
            let mut tottransitions_in: usize = 0;
            while transdata_z != z || transdata_ionstage != ionstage_wanted {
                for _ in 0..tottransitions_in {
                    skip_transition_record(&mut transitiondata)?;
                }
                transdata_z = transitiondata.next("transitiondata Z")?;
                transdata_ionstage = transitiondata.next("transitiondata ion stage")?;
                tottransitions_in = transitiondata.next("transition count")?;
            }

            let mut ionrec = Ion {
                ionstage: ionstage_wanted,
                ionpot: ionpot_ev * EV,
                levels: Vec::with_capacity(nlevelsmax),
                ionisinglevels: 0,
                maxrecombininglevel: 0,
                nlevels_groundterm: 0,
                coolingoffset: 0,
                ncoolingterms: 0,
                first_nlte: 0,
                nlevels_nlte: 0,
                has_superlevel: false,
                alpha_sp: vec![0.; options::TABLESIZE],
                uniqueionindex,
                uniquelevelindexstart,
            };
            uniqueionindex += 1;

            read_ion_levels(
                &mut adata,
                &mut ionrec,
                ion,
                nions,
                nlevels,
                nlevelsmax,
                energyoffset,
                ionpot_ev,
            )?;

            // the lowest levels of iron-group ions must be collisionally
            // coupled to every upper level; missing rows get placeholders
            let (nreq_lower, nreq_upper) = if z == 26 || z == 28 {
                (
                    options::NLEVELS_REQUIRETRANSITIONS.min(nlevelsmax),
                    nlevelsmax,
                )
            } else {
                (0, nlevelsmax)
            };

            let rows = read_ion_transitions(
                &mut transitiondata,
                tottransitions_in,
                nreq_lower,
                nreq_upper,
            )?;
            let rows = merge_duplicate_transitions(rows);

            add_transitions_to_linelist(
                &mut data.linelist,
                &mut ionrec,
                data.elements.len(),
                ion,
                nlevelsmax,
                &rows,
            );

            for level in &ionrec.levels {
                totaldowntrans += level.downtrans_lineindices.len();
                totaluptrans += level.uptrans_lineindices.len();
            }
            uniquelevelindexstart += ionrec.levels.len();
            data.includedlevels += ionrec.levels.len();
            data.includedions += 1;
            element.ions.push(ionrec);
        }
        data.elements.push(element);
    }

    info!("nlines {}", data.linelist.len());
    info!("total uptrans {}", totaluptrans);
    info!("total downtrans {}", totaldowntrans);

    sort_linelist(&mut data.linelist)?;
    data.build_line_lookup();
    rewrite_transition_backrefs(&mut data)?;

    for element in 0..data.nelements() {
        for ion in 0..data.nions(element) {
            let n = calculate_nlevels_groundterm(&data, element, ion);
            data.elements[element].ions[ion].nlevels_groundterm = n;
        }
    }

    read_phixs_data(&dir.join("phixsdata_v2.txt"), &mut data)?;

    super::phixslist::setup(&mut data, dir, rank)?;

    print_model_atom_summary(&data);

    Ok(data)
}

fn skip_level_record(adata: &mut Scanner) -> Result<(), IngestError> {
    let _: usize = adata.next("level index")?;
    let _: f64 = adata.next("level energy")?;
    let _: f64 = adata.next("statistical weight")?;
    let _: i64 = adata.next("transition count")?;
    adata.skip_rest_of_line();
    Ok(())
}

fn skip_transition_record(transitiondata: &mut Scanner) -> Result<(), IngestError> {
    let _: usize = transitiondata.next("lower level")?;
    let _: usize = transitiondata.next("upper level")?;
    let _: f64 = transitiondata.next("Einstein A")?;
    let _: f64 = transitiondata.next("collision strength")?;
    let _: i32 = transitiondata.next("forbidden flag")?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn read_ion_levels(
    adata: &mut Scanner,
    ionrec: &mut Ion,
    ion: usize,
    nions: usize,
    nlevels: usize,
    nlevelsmax: usize,
    energyoffset: f64,
    ionpot_ev: f64,
) -> Result<(), IngestError> {
    for level in 0..nlevels {
        let levelindex_in: usize = adata.next("level index")?;
        let levelenergy: f64 = adata.next("level energy")?;
        let statweight: f64 = adata.next("statistical weight")?;
        let _ntransitions: i64 = adata.next("transition count")?;
        adata.skip_rest_of_line();
        if levelindex_in != level + GROUNDSTATE_INDEX_IN {
            return Err(IngestError::Inconsistent(format!(
                "adata level index {} out of order (expected {})",
                levelindex_in,
                level + GROUNDSTATE_INDEX_IN
            )));
        }
        if level < nlevelsmax {
            // levels below the ionisation potential of a non-top ion can
            // photoionise and carry rate coefficient tables
            if levelenergy < ionpot_ev && ion < nions - 1 {
                ionrec.ionisinglevels += 1;
            }
            ionrec.levels.push(Level {
                epsilon: (energyoffset + levelenergy) * EV,
                stat_weight: statweight,
                metastable: true,
                phixs_threshold: 0.,
                photoion_xs: Vec::new(),
                phixstargets: Vec::new(),
                downtrans_lineindices: Vec::new(),
                uptrans_lineindices: Vec::new(),
                cont_index: 0,
                closestgroundlevelcont: -1,
            });
        }
    }
    Ok(())
}

/// Read one ion's transition block, synthesising placeholder forbidden
/// transitions (A=0, coll_str=-2) where the input skips over upper levels
/// that the collisional network needs.
fn read_ion_transitions(
    transitiondata: &mut Scanner,
    tottransitions_in: usize,
    nlevels_requiretransitions: usize,
    nlevels_requiretransitions_upperlevels: usize,
) -> Result<Vec<TransitionRow>, IngestError> {
    let mut rows: Vec<TransitionRow> = Vec::with_capacity(tottransitions_in);
    let mut prev_lower: usize = 0;
    let mut prev_upper: i64 = -1;

    for _ in 0..tottransitions_in {
        let lower_in: usize = transitiondata.next("lower level")?;
        let upper_in: usize = transitiondata.next("upper level")?;
        let a: f64 = transitiondata.next("Einstein A")?;
        let coll_str: f64 = transitiondata.next("collision strength")?;
        let intforbidden: i32 = transitiondata.next("forbidden flag")?;
        if lower_in < GROUNDSTATE_INDEX_IN || upper_in < GROUNDSTATE_INDEX_IN {
            return Err(IngestError::Inconsistent(format!(
                "transition endpoint below the ground state: {} -> {}",
                lower_in, upper_in
            )));
        }
        let lower = lower_in - GROUNDSTATE_INDEX_IN;
        let upper = upper_in - GROUNDSTATE_INDEX_IN;

        if prev_lower < nlevels_requiretransitions {
            let stoplevel: i64 = if lower == prev_lower && upper as i64 > prev_upper + 1 {
                // same lower level, but some upper levels were skipped over
                (upper as i64 - 1).min(nlevels_requiretransitions_upperlevels as i64 - 1)
            } else if lower > prev_lower
                && prev_upper < nlevels_requiretransitions_upperlevels as i64 - 1
            {
                // moved onto another lower level, but the previous one was
                // missing some required transitions
                nlevels_requiretransitions_upperlevels as i64 - 1
            } else {
                -1
            };

            for tmplevel in (prev_upper + 1)..=stoplevel {
                if tmplevel == prev_lower as i64 || tmplevel < 0 {
                    continue;
                }
                rows.push(TransitionRow {
                    lower: prev_lower,
                    upper: tmplevel as usize,
                    a: 0.,
                    coll_str: -2.,
                    forbidden: true,
                });
            }
        }

        rows.push(TransitionRow {
            lower,
            upper,
            a,
            coll_str,
            forbidden: intforbidden == 1,
        });
        prev_lower = lower;
        prev_upper = upper as i64;
    }

    Ok(rows)
}

/// Group transition rows by (lower, upper) and merge duplicates.
///
/// The merge keeps the sum of the A-values and the maximum of the collision
/// strengths: A-values of distinct transition types between the same level
/// pair add, while collision strengths from different sources are
/// alternatives rather than contributions. The asymmetry is inherited from
/// the upstream atomic data handling.
fn merge_duplicate_transitions(rows: Vec<TransitionRow>) -> Vec<TransitionRow> {
    let mut order: Vec<(usize, usize)> = Vec::with_capacity(rows.len());
    let mut groups: MultiMap<(usize, usize), TransitionRow> = MultiMap::new();
    for row in rows {
        let key = (row.lower, row.upper);
        if !groups.contains_key(&key) {
            order.push(key);
        }
        groups.insert(key, row);
    }

    order
        .into_iter()
        .map(|key| {
            let group = groups.get_vec(&key).expect("key recorded on insert");
            let mut merged = group[0];
            for row in &group[1..] {
                merged.a += row.a;
                if row.coll_str > merged.coll_str {
                    merged.coll_str = row.coll_str;
                }
            }
            merged
        })
        .collect()
}

fn add_transitions_to_linelist(
    linelist: &mut Vec<Line>,
    ionrec: &mut Ion,
    elementindex: usize,
    ionindex: usize,
    nlevelsmax: usize,
    rows: &[TransitionRow],
) {
    for row in rows {
        if row.lower >= nlevelsmax || row.upper >= nlevelsmax || row.upper <= row.lower {
            continue;
        }
        let nu_trans = (ionrec.levels[row.upper].epsilon - ionrec.levels[row.lower].epsilon) / H;
        if nu_trans <= 0. {
            continue;
        }

        let g = ionrec.levels[row.upper].stat_weight / ionrec.levels[row.lower].stat_weight;
        let f_ul = g * ME * CLIGHT.powi(3) / (8. * (QE * nu_trans * PI).powi(2)) * row.a;

        linelist.push(Line {
            elementindex: elementindex as u32,
            ionindex: ionindex as u32,
            lowerlevelindex: row.lower as u32,
            upperlevelindex: row.upper as u32,
            nu: nu_trans,
            einstein_a: row.a,
            osc_strength: f_ul,
            coll_str: row.coll_str,
            forbidden: row.forbidden,
        });

        // a level with a downward radiative transition is not metastable
        ionrec.levels[row.upper].metastable = false;

        // the line list has not been sorted yet, so store the negated
        // partner-level index; rewrite_transition_backrefs replaces these
        // with indices into the sorted line list
        ionrec.levels[row.upper]
            .downtrans_lineindices
            .push(-(row.lower as i32));
        ionrec.levels[row.lower]
            .uptrans_lineindices
            .push(-(row.upper as i32));
    }
}

/// Tie-break comparator for lines of effectively equal frequency:
/// descending (lower, upper). Pure: the frequencies are never touched.
fn compare_equal_nu_lines(a: &Line, b: &Line) -> Ordering {
    b.lowerlevelindex
        .cmp(&a.lowerlevelindex)
        .then(b.upperlevelindex.cmp(&a.upperlevelindex))
}

/// Relative frequency difference below which two lines sort as equal.
const NU_TIE_TOL: f64 = 1.0e-10;

/// Sort the line list by decreasing frequency.
///
/// A stable descending sort on nu comes first; runs of lines whose
/// frequencies agree to within |dnu|/nu < 1e-10 are then re-ordered by the
/// (lower, upper) tie-break. Two entries of the same ion with identical
/// level pairs at the same frequency are a fatal data error.
pub(crate) fn sort_linelist(linelist: &mut Vec<Line>) -> Result<(), IngestError> {
    linelist.sort_by(|a, b| b.nu.total_cmp(&a.nu));

    let n = linelist.len();
    let mut start = 0;
    while start < n {
        let mut end = start + 1;
        while end < n && (linelist[end - 1].nu - linelist[end].nu).abs() < NU_TIE_TOL * linelist[end - 1].nu
        {
            end += 1;
        }
        if end - start > 1 {
            linelist[start..end].sort_by(compare_equal_nu_lines);
            for k in start..(end - 1) {
                let a = &linelist[k];
                let b = &linelist[k + 1];
                if a.elementindex == b.elementindex
                    && a.ionindex == b.ionindex
                    && a.lowerlevelindex == b.lowerlevelindex
                    && a.upperlevelindex == b.upperlevelindex
                {
                    return Err(IngestError::Inconsistent(format!(
                        "duplicate atomic line: element {} ion {} lower {} upper {} nu {:e}",
                        a.elementindex, a.ionindex, a.lowerlevelindex, a.upperlevelindex, a.nu
                    )));
                }
            }
        }
        start = end;
    }
    Ok(())
}

/// Second pass of the back-reference algorithm: every down-/up-transition
/// entry still holds the negated partner-level index and is replaced with
/// the line's final index in the sorted list.
pub(crate) fn rewrite_transition_backrefs(data: &mut AtomicData) -> Result<(), IngestError> {
    for element in 0..data.elements.len() {
        for ion in 0..data.elements[element].ions.len() {
            for level in 0..data.elements[element].ions[ion].levels.len() {
                let down: Vec<i32> = data.elements[element].ions[ion].levels[level]
                    .downtrans_lineindices
                    .iter()
                    .map(|&enc| {
                        let lower = (-enc) as usize;
                        data.lookup_line(element, ion, lower, level)
                            .map(|k| k as i32)
                            .ok_or_else(|| {
                                IngestError::Inconsistent(format!(
                                    "no sorted line for element {} ion {} {} -> {}",
                                    element, ion, lower, level
                                ))
                            })
                    })
                    .collect::<Result<_, _>>()?;
                data.elements[element].ions[ion].levels[level].downtrans_lineindices = down;

                let up: Vec<i32> = data.elements[element].ions[ion].levels[level]
                    .uptrans_lineindices
                    .iter()
                    .map(|&enc| {
                        let upper = (-enc) as usize;
                        data.lookup_line(element, ion, level, upper)
                            .map(|k| k as i32)
                            .ok_or_else(|| {
                                IngestError::Inconsistent(format!(
                                    "no sorted line for element {} ion {} {} -> {}",
                                    element, ion, level, upper
                                ))
                            })
                    })
                    .collect::<Result<_, _>>()?;
                data.elements[element].ions[ion].levels[level].uptrans_lineindices = up;
            }
        }
    }
    Ok(())
}

/// Infer the number of levels in an ion's ground term from the first jump
/// in the level energy spacing.
pub(crate) fn calculate_nlevels_groundterm(data: &AtomicData, element: usize, ion: usize) -> usize {
    let nlevels = data.nlevels(element, ion);
    if nlevels == 1 {
        return 1;
    }

    let mut nlevels_groundterm = 1;
    if nlevels >= 3 {
        let endiff10 = data.epsilon(element, ion, 1) - data.epsilon(element, ion, 0);
        let endiff21 = data.epsilon(element, ion, 2) - data.epsilon(element, ion, 1);
        if endiff10 > 2. * endiff21 {
            nlevels_groundterm = 1;
        } else {
            for level in 1..(nlevels - 2) {
                let endiff1 = data.epsilon(element, ion, level) - data.epsilon(element, ion, level - 1);
                let endiff2 = data.epsilon(element, ion, level + 1) - data.epsilon(element, ion, level);
                if endiff2 > 2. * endiff1 {
                    nlevels_groundterm = level + 1;
                    break;
                }
            }
        }
    }

    // there should be no duplicate statistical weights within the ground term
    for level in 0..nlevels_groundterm {
        let g = data.stat_weight(element, ion, level);
        for levelb in 0..level {
            let g_b = data.stat_weight(element, ion, levelb);
            if (g - g_b).abs() < 1e-6 {
                warn!(
                    "duplicate g value in ground term for Z={} ion stage {}: g(level {}) = g(level {}) = {}",
                    data.anumber(element),
                    data.ionstage(element, ion),
                    level,
                    levelb,
                    g
                );
            }
        }
    }

    nlevels_groundterm
}

/// Read `phixsdata_v2.txt`: header (point count, nu/nu_edge increment), then
/// per-entry headers with either a single target level or a branching table,
/// followed by the cross-section values in Mbarn.
fn read_phixs_data(path: &Path, data: &mut AtomicData) -> Result<(), IngestError> {
    let mut phixsdata = Scanner::open(path)?;
    info!("reading phixs data");

    data.nphixspoints = phixsdata.next("phixs point count")?;
    data.phixsnuincrement = phixsdata.next("phixs nu increment")?;
    if data.nphixspoints == 0 || data.phixsnuincrement <= 0. {
        return Err(IngestError::Inconsistent(
            "bad phixsdata_v2.txt header".to_string(),
        ));
    }
    data.last_phixs_nuovernuedge = 1.0 + data.phixsnuincrement * (data.nphixspoints as f64 - 1.);

    loop {
        let z: i32 = match phixsdata.try_next("phixs Z")? {
            Some(v) => v,
            None => break,
        };
        let upperionstage: i32 = phixsdata.next("upper ion stage")?;
        let upperlevel_in: i64 = phixsdata.next("upper level")?;
        let lowerionstage: i32 = phixsdata.next("lower ion stage")?;
        let lowerlevel_in: i64 = phixsdata.next("lower level")?;
        let threshold_ev: f64 = phixsdata.next("threshold energy")?;
        if upperionstage < 2 || lowerionstage < 1 || lowerlevel_in < 1 {
            return Err(IngestError::Inconsistent(format!(
                "bad phixs header for Z={}: stages {} -> {}",
                z, lowerionstage, upperionstage
            )));
        }

        let element = data.elementindex(z);
        let target = element.and_then(|e| {
            let lowerion = lowerionstage - data.ionstage(e, 0);
            let upperion = upperionstage - data.ionstage(e, 0);
            let lowerlevel = (lowerlevel_in as usize) - GROUNDSTATE_INDEX_IN;
            if lowerion >= 0
                && upperion > lowerion
                && (upperion as usize) < data.nions(e)
                && (lowerion as usize) + 1 < data.nions(e)
                && lowerlevel < data.nlevels(e, lowerion as usize)
            {
                Some((e, lowerion as usize, lowerlevel))
            } else {
                None
            }
        });

        match target {
            Some((element, lowerion, lowerlevel)) => {
                read_phixs_table(
                    &mut phixsdata,
                    data,
                    element,
                    lowerion,
                    lowerlevel,
                    upperlevel_in,
                    threshold_ev,
                )?;
            }
            None => {
                // ion or element outside the model atom: read past the table
                if upperlevel_in < 0 {
                    let ntargets: usize = phixsdata.next("phixs target count")?;
                    for _ in 0..ntargets {
                        let _: i64 = phixsdata.next("phixs target level")?;
                        let _: f64 = phixsdata.next("phixs target probability")?;
                    }
                }
                for _ in 0..data.nphixspoints {
                    let _: f64 = phixsdata.next("phixs cross-section")?;
                }
            }
        }
    }

    Ok(())
}

fn read_phixs_table(
    phixsdata: &mut Scanner,
    data: &mut AtomicData,
    element: usize,
    lowerion: usize,
    lowerlevel: usize,
    upperlevel_in: i64,
    threshold_ev: f64,
) -> Result<(), IngestError> {
    use super::PhixsTarget;

    let mut targets: Vec<PhixsTarget> = Vec::new();
    if upperlevel_in >= 0 {
        // photoionisation to a single target state
        if (upperlevel_in as usize) < GROUNDSTATE_INDEX_IN {
            return Err(IngestError::Inconsistent(format!(
                "phixs upper level {} below the ground state for element {} ion {} level {}",
                upperlevel_in, element, lowerion, lowerlevel
            )));
        }
        let upperlevel = (upperlevel_in as usize) - GROUNDSTATE_INDEX_IN;
        targets.push(PhixsTarget {
            levelindex: upperlevel as u32,
            probability: 1.0,
            ..Default::default()
        });
    } else {
        // a table of target states and probabilities follows
        let ntargets: usize = phixsdata.next("phixs target count")?;
        let mut probability_sum = 0.;
        for _ in 0..ntargets {
            let upperlevel_in: usize = phixsdata.next("phixs target level")?;
            let probability: f64 = phixsdata.next("phixs target probability")?;
            if upperlevel_in < GROUNDSTATE_INDEX_IN || probability <= 0. {
                return Err(IngestError::Inconsistent(format!(
                    "bad phixs target (level {}, probability {}) for element {} ion {} level {}",
                    upperlevel_in, probability, element, lowerion, lowerlevel
                )));
            }
            targets.push(PhixsTarget {
                levelindex: (upperlevel_in - GROUNDSTATE_INDEX_IN) as u32,
                probability,
                ..Default::default()
            });
            probability_sum += probability;
        }
        if (probability_sum - 1.0).abs() > options::PHIXS_PROBABILITY_TOL {
            warn!(
                "photoionisation table for Z={} ion stage {} level {} has probabilities that sum to {}",
                data.anumber(element),
                data.ionstage(element, lowerion),
                lowerlevel,
                probability_sum
            );
        }
    }

    let mut xs = Vec::with_capacity(data.nphixspoints);
    for _ in 0..data.nphixspoints {
        let sigma_mbarn: f64 = phixsdata.next("phixs cross-section")?;
        if sigma_mbarn < 0. {
            return Err(IngestError::Inconsistent(format!(
                "negative photoionisation cross-section for element {} ion {} level {}",
                element, lowerion, lowerlevel
            )));
        }
        // Mbarn = 1e-18 cm^2
        xs.push((sigma_mbarn * 1e-18) as f32);
    }

    let ntargets = targets.len();
    for t in &targets {
        let upperlevel = t.levelindex;
        if upperlevel > data.elements[element].ions[lowerion + 1].maxrecombininglevel {
            data.elements[element].ions[lowerion + 1].maxrecombininglevel = upperlevel;
        }
    }

    let ionising = lowerlevel < data.elements[element].ions[lowerion].ionisinglevels;
    let level = &mut data.elements[element].ions[lowerion].levels[lowerlevel];
    level.phixs_threshold = threshold_ev * EV;
    level.photoion_xs = xs;
    level.phixstargets = targets;

    // only ionising levels enter the continuum index walk
    if ionising {
        data.nbfcontinua += ntargets;
        if lowerlevel < data.elements[element].ions[lowerion].nlevels_groundterm {
            data.nbfcontinua_ground += ntargets;
        }
    }
    Ok(())
}

fn print_model_atom_summary(data: &AtomicData) {
    let mut includedlevels = 0;
    let mut includedionisinglevels = 0;
    let mut includedphotoiontransitions = 0;
    info!("this simulation contains");
    for element in 0..data.nelements() {
        info!("  element {} (Z={})", element, data.anumber(element));
        for ion in 0..data.nions(element) {
            let mut photoiontransitions = 0;
            for level in 0..data.nlevels(element, ion) {
                photoiontransitions += data.nphixstargets(element, ion, level);
            }
            info!(
                "    ion stage {} with {} levels ({} in groundterm, {} ionising) and {} photoionisation transitions",
                data.ionstage(element, ion),
                data.nlevels(element, ion),
                data.ion(element, ion).nlevels_groundterm,
                data.ionisinglevels(element, ion),
                photoiontransitions
            );
            includedlevels += data.nlevels(element, ion);
            includedionisinglevels += data.ionisinglevels(element, ion);
            includedphotoiontransitions += photoiontransitions;
        }
    }
    info!(
        "in total {} ions, {} levels ({} ionising), {} lines, {} photoionisation transitions",
        data.includedions,
        includedlevels,
        includedionisinglevels,
        data.nlines(),
        includedphotoiontransitions
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_line(nu: f64, lower: u32, upper: u32) -> Line {
        Line {
            elementindex: 0,
            ionindex: 0,
            lowerlevelindex: lower,
            upperlevelindex: upper,
            nu,
            einstein_a: 1e7,
            osc_strength: 0.1,
            coll_str: -1.,
            forbidden: false,
        }
    }

    #[test]
    fn test_sort_linelist_descending_with_tiebreak() {
        // three lines at 1e15 Hz with distinct endpoints plus one at 2e15:
        // the 2e15 line leads, then descending (lower, upper)
        let mut lines = vec![
            test_line(1e15, 0, 1),
            test_line(2e15, 0, 2),
            test_line(1e15, 0, 3),
            test_line(1e15, 1, 2),
        ];
        sort_linelist(&mut lines).unwrap();
        assert_eq!(lines[0].nu, 2e15);
        assert_eq!(
            (lines[1].lowerlevelindex, lines[1].upperlevelindex),
            (1, 2)
        );
        assert_eq!(
            (lines[2].lowerlevelindex, lines[2].upperlevelindex),
            (0, 3)
        );
        assert_eq!(
            (lines[3].lowerlevelindex, lines[3].upperlevelindex),
            (0, 1)
        );
        for pair in lines.windows(2) {
            assert!(pair[0].nu >= pair[1].nu);
        }
    }

    #[test]
    fn test_sort_linelist_near_equal_frequencies_tie() {
        // frequencies differing by less than the 1e-10 relative tolerance
        // count as equal and fall back to the index tie-break, overriding
        // the raw frequency order
        let mut lines = vec![test_line(1e15, 1, 3), test_line(1e15 * (1. + 5e-11), 0, 2)];
        sort_linelist(&mut lines).unwrap();
        assert_eq!(lines[0].lowerlevelindex, 1);
        assert_eq!(lines[1].lowerlevelindex, 0);
    }

    #[test]
    fn test_sort_linelist_duplicate_is_fatal() {
        let mut lines = vec![test_line(1e15, 0, 2), test_line(1e15, 0, 2)];
        assert!(sort_linelist(&mut lines).is_err());
    }

    #[test]
    fn test_merge_duplicate_transitions() {
        let rows = vec![
            TransitionRow {
                lower: 0,
                upper: 2,
                a: 1e7,
                coll_str: 0.5,
                forbidden: false,
            },
            TransitionRow {
                lower: 0,
                upper: 2,
                a: 2e7,
                coll_str: 1.5,
                forbidden: false,
            },
            TransitionRow {
                lower: 1,
                upper: 2,
                a: 3e7,
                coll_str: -1.,
                forbidden: false,
            },
        ];
        let merged = merge_duplicate_transitions(rows);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].lower, 0);
        assert_approx_eq::assert_approx_eq!(merged[0].a, 3e7, 1.);
        assert_approx_eq::assert_approx_eq!(merged[0].coll_str, 1.5, 1e-12);
        assert_eq!(merged[1].lower, 1);
    }

    /// A small oxygen model atom, with leading carbon blocks that are not
    /// part of the composition and must be read past.
    fn write_test_atom(dir: &std::path::Path) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(
            dir.join("compositiondata.txt"),
            "1\n-1\n0\n8 2 1 2 -1 1.0 16.0\n",
        )
        .unwrap();
        std::fs::write(
            dir.join("adata.txt"),
            "6 1 2 11.3\n1 0.0 1.0 0\n2 5.0 3.0 0\n\
             8 1 4 13.6\n1 0.0 5.0 0\n2 0.2 3.0 1\n3 5.0 1.0 2\n4 6.0 3.0 1\n\
             8 2 2 35.1\n1 0.0 4.0 0\n2 3.0 2.0 0\n",
        )
        .unwrap();
        std::fs::write(
            dir.join("transitiondata.txt"),
            "6 1 1\n1 2 1.0e6 -1 0\n\
             8 1 3\n1 3 1.0e8 -1 0\n1 4 5.0e7 -1 0\n2 3 2.0e7 -1 0\n\
             8 2 0\n",
        )
        .unwrap();

        let mut phixs = String::from("100 0.1\n");
        // O I ground state: a branching table over both O II levels
        phixs.push_str("8 2 -1 1 1 13.54\n2\n1 0.6\n2 0.4\n");
        for i in 0..100 {
            phixs.push_str(&format!("{:.6}\n", 2.0 / (1. + 0.1 * i as f64)));
        }
        // O I second level: a single target state
        phixs.push_str("8 2 1 1 2 13.4\n");
        for i in 0..100 {
            phixs.push_str(&format!("{:.6}\n", 3.0 / (1. + 0.1 * i as f64)));
        }
        // carbon entry outside the model atom, read past
        phixs.push_str("6 2 -1 1 1 11.2\n1\n1 1.0\n");
        for _ in 0..100 {
            phixs.push_str("1.0\n");
        }
        std::fs::write(dir.join("phixsdata_v2.txt"), phixs).unwrap();
    }

    #[test]
    fn test_read_atomic_data_end_to_end() {
        let dir = std::env::temp_dir().join(format!("snmc_atom_{}", std::process::id()));
        write_test_atom(&dir);
        let data = read_atomic_data(&dir, 0).unwrap();

        assert_eq!(data.nelements(), 1);
        assert_eq!(data.nions(0), 2);
        assert_eq!(data.nlevels(0, 0), 4);
        assert_eq!(data.nlevels(0, 1), 2);

        // the carbon blocks were skipped entirely
        assert_eq!(data.nlines(), 3);

        // line list sorted by decreasing frequency
        for pair in data.linelist.windows(2) {
            assert!(pair[0].nu >= pair[1].nu);
        }
        assert_eq!(data.lookup_line(0, 0, 0, 3), Some(0));
        assert_eq!(data.lookup_line(0, 0, 0, 2), Some(1));
        assert_eq!(data.lookup_line(0, 0, 1, 2), Some(2));

        // back-reference closure: every line appears in its upper level's
        // down-list and its lower level's up-list
        for (k, line) in data.linelist.iter().enumerate() {
            let upper = data.level(0, 0, line.upperlevelindex as usize);
            let lower = data.level(0, 0, line.lowerlevelindex as usize);
            assert!(upper.downtrans_lineindices.contains(&(k as i32)));
            assert!(lower.uptrans_lineindices.contains(&(k as i32)));
        }

        // ground-term inference: the 0.2 eV level joins the ground term,
        // the 5 eV jump ends it
        assert_eq!(data.ion(0, 0).nlevels_groundterm, 2);
        assert_eq!(data.ion(0, 1).nlevels_groundterm, 1);

        // levels with downward radiative transitions lost their
        // metastable flag
        assert!(data.level(0, 0, 0).metastable);
        assert!(data.level(0, 0, 1).metastable);
        assert!(!data.level(0, 0, 2).metastable);
        assert!(!data.level(0, 0, 3).metastable);

        // photoionisation: branching probabilities and the continuum walk
        assert_eq!(data.nphixstargets(0, 0, 0), 2);
        let psum: f64 = (0..2).map(|t| data.phixsprobability(0, 0, 0, t)).sum();
        assert!((psum - 1.0).abs() <= crate::options::PHIXS_PROBABILITY_TOL);
        assert_eq!(data.nphixstargets(0, 0, 1), 1);
        assert_eq!(data.nbfcontinua, 3);
        assert_eq!(data.nbfcontinua_ground, 3);
        assert_eq!(data.continuumindex(0, 0, 0, 0), -1);
        assert_eq!(data.continuumindex(0, 0, 0, 1), -2);
        assert_eq!(data.continuumindex(0, 0, 1, 0), -3);
        assert_eq!(data.bflist.len(), 3);

        // cross-sections were converted from Mbarn
        assert!((data.level(0, 0, 0).photoion_xs[0] as f64 - 2e-18).abs() < 1e-24);

        // the ground continuum list is sorted by ascending edge frequency
        for pair in data.groundcont.windows(2) {
            assert!(pair[0].nu_edge <= pair[1].nu_edge);
        }

        // energy offsets: the O II ground state sits one ionisation
        // potential above the neutral ground state
        assert!((data.epsilon(0, 1, 0) - 13.6 * EV).abs() < 1e-3 * EV);

        // bflist.dat was written with one line per continuum plus a count
        let bflist = std::fs::read_to_string(dir.join("bflist.dat")).unwrap();
        assert_eq!(bflist.lines().count(), 4);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_transition_augmentation_fills_missing_upper_levels() {
        // input only has 0->1 and 0->4; levels 2 and 3 get placeholders
        let dir = std::env::temp_dir().join(format!("snmc_ingest_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("transitiondata.txt");
        std::fs::write(&path, "1 2 1e7 -1 0\n1 5 2e7 -1 0\n").unwrap();
        let mut scanner = Scanner::open(&path).unwrap();
        let rows = read_ion_transitions(&mut scanner, 2, 5, 5).unwrap();
        let pairs: Vec<(usize, usize)> = rows.iter().map(|r| (r.lower, r.upper)).collect();
        assert!(pairs.contains(&(0, 1)));
        assert!(pairs.contains(&(0, 2)));
        assert!(pairs.contains(&(0, 3)));
        assert!(pairs.contains(&(0, 4)));
        let placeholder = rows.iter().find(|r| r.upper == 2).unwrap();
        assert_eq!(placeholder.a, 0.);
        assert_eq!(placeholder.coll_str, -2.);
        assert!(placeholder.forbidden);
        std::fs::remove_file(&path).ok();
    }
}
