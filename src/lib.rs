pub mod atomic;
pub mod cellhistory;
pub mod constant;
pub mod decay;
pub mod diagnostics;
pub mod errors;
pub mod estimators;
pub mod grid;
pub mod input;
pub mod maths;
pub mod model;
pub mod nltepop;
pub mod nonthermal;
pub mod options;
pub mod packet;
pub mod pool;
pub mod quadrature;
pub mod radfield;
pub mod ratecoeff;
pub mod simulation;
pub mod timesteps;
pub mod transport;
