pub mod command;
pub mod doublet;
pub mod fileformat;
pub mod merge;
pub mod qc;
