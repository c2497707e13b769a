pub mod catalogue;
pub mod cli;
pub mod config;
pub mod distribution;
pub mod error;
pub mod outdir;
pub mod supervisor;
