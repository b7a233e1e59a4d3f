//! CCD image reduction and differential photometry
//!
//! This crate provides the reduction chain for transit photometry:
//! combining calibration exposures into master frames, applying them to
//! science images, detecting sources, measuring aperture fluxes and
//! assembling differential light curves, plus photometric calibration
//! against standard stars.

pub mod calibrate;
pub mod combine;
pub mod detect;
pub mod error;
pub mod image;
pub mod io;
pub mod lightcurve;
pub mod photometry;
pub mod standards;
pub mod stats;

// Re-exports for easier access
pub use calibrate::{calibrate, calibrate_batch, CalibratedFrame};
pub use combine::{combine, master_bias, master_flat, CombineMethod, MasterFrame};
pub use detect::{detect, refine_centroid, Source};
pub use error::{Error, Result};
pub use image::{Frame, FrameMeta, MetaValue};
pub use lightcurve::{build as build_light_curve, LightCurve, LightCurveConfig};
pub use photometry::{measure, Aperture, PhotometryResult, Quality};
pub use standards::{fit_standards, CalibrationSolution, StandardObservation, StandardsConfig};
