//! Organise raw DICOM acquisitions into a BIDS dataset.
//!
//! External converters (dcm2bids, dcm2niix) are driven as child processes; tabular
//! metadata (behavioural events, demographics) is reshaped into the files BIDS expects.

pub mod batch;
pub mod config;
pub mod dataset;
pub mod dicom;
pub mod error;
pub mod events;
pub mod naming;
pub mod participants;
pub mod roster;
pub mod table;
pub mod tools;

pub use error::{BidsError, Result};
