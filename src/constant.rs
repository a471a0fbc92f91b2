// Physical constants in cgs units.

/// Speed of light [cm/s]
pub const CLIGHT: f64 = 2.99792458e10;

/// Speed of light squared [cm^2/s^2]
pub const CLIGHTSQUARED: f64 = 8.9875518e20;

/// Planck constant [erg s]
pub const H: f64 = 6.6260755e-27;

/// Boltzmann constant [erg/K]
pub const KB: f64 = 1.38064852e-16;

/// Mass of hydrogen atom [g]
pub const MH: f64 = 1.67352e-24;

/// Mass of free electron [g]
pub const ME: f64 = 9.1093897e-28;

/// Elementary charge [statcoulomb]
pub const QE: f64 = 4.80325e-10;

/// Solar mass [g]
pub const MSUN: f64 = 1.98855e33;

pub const PI: f64 = std::f64::consts::PI;
pub const FOURPI: f64 = 4.0 * PI;

/// eV to erg
pub const EV: f64 = 1.6021772e-12;

/// MeV to erg
pub const MEV: f64 = 1.6021772e-6;

/// day to seconds
pub const DAY: f64 = 86400.0;

/// Thomson cross-section [cm^2]
pub const SIGMA_T: f64 = 6.6524e-25;

/// Photon energy (in units of m_e c^2) below which e-scattering is Thomson
pub const THOMSON_LIMIT: f64 = 1e-2;

/// Stefan-Boltzmann constant [erg cm^-2 s^-1 K^-4]
pub const STEBO: f64 = 5.670400e-5;

/// Saha constant [cgs]
pub const SAHACONST: f64 = 2.0706659e-16;

pub const TWOOVERCLIGHTSQUARED: f64 = 2.2253001e-21;
pub const TWOHOVERCLIGHTSQUARED: f64 = 1.4745007e-47;
pub const HOVERKB: f64 = 4.799243681748932e-11;

pub const H_IONPOT: f64 = 13.5979996 * EV;

/// Free-free cooling prefactor with unit Gaunt factor [cgs]
pub const FF_COOLING_COEFF: f64 = 1.426e-27;
