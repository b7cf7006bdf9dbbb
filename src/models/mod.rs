//! Core data models for the archive service.
//!
//! Reports and analyses share one row shape (`ArchiveRecord`) and are
//! addressed through `EntityRef`. Archived dumps are located by `Locator`.

pub mod entity;
pub mod locator;
