pub mod error;
pub mod models;
pub mod junk_drawer;
pub mod dispatch;
pub mod metaimage;
pub mod dicom;
pub mod raster;
pub mod standardize;
pub mod preprocessing;
pub mod classifier;
pub mod attention;
pub mod heatmap;
pub mod encoding;
pub mod config;
pub mod predictor;
pub mod state;
pub mod commands;
