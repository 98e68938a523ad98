//! # Stevedore
//!
//! A daemonless container image manager: pull images from registries,
//! keep them in a local repository, unpack them into container trees and
//! move them around as tar archives. No daemon and no privileges needed.

#![warn(missing_docs)]

pub mod cli;
