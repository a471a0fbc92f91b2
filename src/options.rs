//! Compile-time sizing limits and physics switches.
//!
//! Everything here is fixed at build time; run-time parameters live in
//! `input.txt` (see the `input` module).

/// Number of energy packets per process (worker threads share these packets)
pub const MPKTS: usize = 1_000_000;

/// Max number of propagation grid cells
pub const MGRID: usize = 125_000;

/// Max number of input model grid cells
pub const MMODELGRID: usize = 125_000;

/// Max number of ion stages for any element
pub const MIONS: usize = 5;

/// Max number of time steps
pub const MTSTEP: usize = 200;

/// non-LTE population solver
pub const NLTE_POPS_ON: bool = true;

/// excited levels up to this index are tracked individually by the NLTE
/// solver; anything above folds into the ion's superlevel
pub const NLTE_LEVELS_MAX: usize = 80;

/// maximum number of NLTE/Te/Spencer-Fano iterations
pub const NLTEITER: usize = 30;

/// relative population change below which the NLTE/Te iteration stops
pub const NLTE_TOLERANCE: f64 = 1e-3;

/// store Jb_lu estimators for lines selected in radfield::init
pub const DETAILED_LINE_ESTIMATORS_ON: bool = false;

/// store detailed bound-free rate estimators
pub const DETAILED_BF_ESTIMATORS_ON: bool = true;

/// dynamically calculate photoionization rates for the current radiation field
/// instead of interpolating values from a lookup table for a blackbody field
pub const NO_LUT_PHOTOION: bool = true;

/// as above for bound-free heating
pub const NO_LUT_BFHEATING: bool = true;

/// Rate coefficient tables
pub const TABLESIZE: usize = 100;
pub const MINTEMP: f64 = 1000.;
pub const MAXTEMP: f64 = 30000.;

/// Quadrature workspace size (max number of bisected subintervals)
pub const QUADWSIZE: usize = 16384;

/// Minimum cell density [g/cm^3]. Below this cells are treated as empty.
pub const MINDENSITY: f64 = 1e-40;
pub const MINPOP: f64 = 1e-40;

// Radiation field model

pub const RADFIELDBINCOUNT: usize = 256;

pub const FIRST_NLTE_RADFIELD_TIMESTEP: usize = 12;

/// CLIGHT / ([lambda Angstroms]e-8)
pub const NU_LOWER_FIRST_INITIAL: f64 = crate::constant::CLIGHT / 40000e-8;
/// not including the very top super bin
pub const NU_UPPER_LAST_INITIAL: f64 = crate::constant::CLIGHT / 1085e-8;

pub const T_R_MIN: f64 = 500.;
pub const T_R_MAX: f64 = 250000.;

/// bins with fewer contributing packets use the cell-wide fit
pub const RADFIELD_MIN_CONTRIBUTIONS: u32 = 10;

// Non-thermal solution

/// non-thermal ionisation
pub const NT_ON: bool = true;

/// use the detailed Spencer-Fano solver instead of the work function approximation
pub const NT_SOLVE_SPENCERFANO: bool = true;

/// number of energy points in the Spencer-Fano solution vector
pub const SFPTS: usize = 4096;

/// eV
pub const SF_EMAX: f64 = 16000.;

/// eV
pub const SF_EMIN: f64 = 0.1;

/// trigger a solution at least once every n timesteps
pub const MAX_TIMESTEPS_BETWEEN_SOLUTIONS: usize = 0;

/// a change in the electron fraction since the previous solution
/// (e.g. 0.5 is a 50% change) will also trigger a solution
pub const NT_MAX_FRACDIFF_NNEPERION_BETWEEN_SOLUTIONS: f64 = 1.0;

/// just consider excitation from the first N levels and to the first M upper
/// levels, because these transitions really slow down the solver
pub const NTEXCITATION_MAXNLEVELS_LOWER: usize = 5;
pub const NTEXCITATION_MAXNLEVELS_UPPER: usize = 250;

/// allow ions to lose more than one electron per impact ionisation using
/// Auger effect probabilities associated with electron shells
pub const NT_MAX_AUGER_ELECTRONS: usize = 2;

/// add the Auger electron term to the Spencer-Fano equation
pub const SF_AUGER_CONTRIBUTION_ON: bool = true;

// Atomic data ingest

/// the first N lower levels of iron-group ions are collisionally coupled to
/// the first M upper levels by placeholder forbidden transitions
pub const NLEVELS_REQUIRETRANSITIONS: usize = 80;

/// tolerance on the per-level photoionisation branching probability sum
pub const PHIXS_PROBABILITY_TOL: f64 = 0.01;

/// grey opacity for gamma packets when enabled from input.txt [cm^2/g]
pub const GREY_GAMMA_OPACITY: f64 = 0.0289;
