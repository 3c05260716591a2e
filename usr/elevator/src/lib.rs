// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A building with elevators and riders, all running as threads on a
//! single simulated CPU.
//!
//! Riders call an elevator at their floor, wait until one going their way
//! picks them up, press the button for their destination and wait until
//! the doors open there. Elevators sweep up and down (SCAN), serving
//! outside calls for their current direction and the buttons pressed
//! inside, and sleep on a condition while nobody needs them.

pub mod building;
pub mod config;
pub mod elevator;
pub mod error;
pub mod rider;

pub use building::{Building, BuildingBuilder};
pub use config::Config;
pub use elevator::{Cabin, Direction, Elevator, Visit};
pub use error::{ConfigError, ElevatorError};
pub use rider::{ride, RideReport, Trip};
