#![no_std]

extern crate alloc;

// Shared decision logic for the droidboot control plane.
//
// Everything here stays free of the standard library: side effects are reached
// through the port traits in `platform`, so the daemon, the emulator, and the
// test suites all drive the same protocol engine, power governor, and install
// pipeline.

pub mod boot;
pub mod fastboot;
pub mod ota;
pub mod partition;
pub mod platform;
pub mod power;
pub mod progress;
pub mod provision;
pub mod sim;
