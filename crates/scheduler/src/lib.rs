//! Scheduler sweeper for the journey engine.
//!
//! A [`Sweeper`] is constructed once per process and either started as a
//! background loop or driven tick by tick.

pub mod sweeper;

pub use sweeper::{InactivityReport, Sweeper, TickReport};
