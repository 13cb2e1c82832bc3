//! Core library for the epias-tools command line application.
//!
//! The library drives one export run: it authenticates against the CAS ticket
//! authority, downloads one hourly meter export per meter concurrently, and folds
//! the downloads into a consolidated pivot sheet. Network seams live under
//! [`epias::tools::auth`] and [`epias::tools::transport`], the concurrent download
//! loop in [`epias::tools::fetch`], spreadsheet handling under [`epias::tools::io`]
//! and [`epias::tools::pivot`], and the end-to-end sequencing in
//! [`epias::tools::run`].

pub mod epias;

pub use epias::tools::{
    Result, ToolError, auth, config, error, fetch, io, model, pivot, run, testing, transport,
};
