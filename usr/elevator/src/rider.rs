// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Riders: threads that use the building to get from one floor to another.

use log::info;
use rand::Rng;

use uniproc::{Environment, Ticks};

use crate::building::Building;
use crate::elevator::Direction;
use crate::error::ElevatorError;

/// A ride from one floor to another.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Trip {
    pub from: usize,
    pub to: usize,
}

impl Trip {
    /// A trip between two different floors of a building with `floors`
    /// floors.
    pub fn random<R: Rng>(rng: &mut R, floors: usize) -> Trip {
        let from = rng.gen_range(1..=floors);
        let mut to = rng.gen_range(1..floors);
        if to >= from {
            to += 1;
        }
        Trip { from, to }
    }

    pub fn direction(&self) -> Direction {
        if self.to > self.from {
            Direction::Up
        } else {
            Direction::Down
        }
    }
}

/// How a trip went.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RideReport {
    pub trip: Trip,
    /// Elevator that took us there.
    pub elevator: usize,
    /// How often we were turned away by a full elevator.
    pub refusals: usize,
    /// Tick of the first call.
    pub called_at: Ticks,
    pub arrived_at: Ticks,
}

/// Makes `trip` in `building`: call, wait for an elevator, enter (calling
/// again whenever the elevator is full), ride and get out.
///
/// Must run on a scheduler thread.
pub fn ride(building: &Building, trip: Trip) -> Result<RideReport, ElevatorError> {
    if trip.from == trip.to {
        return Err(ElevatorError::InvalidDirection { floor: trip.from });
    }
    building.check_floor(trip.to)?;

    let direction = trip.direction();
    let called_at = Environment::thread().now();
    let mut refusals = 0;

    let elevator = loop {
        building.call(trip.from, direction)?;
        let elevator = building.await_elevator(trip.from, direction)?;
        match elevator.enter() {
            Ok(()) => break elevator,
            Err(ElevatorError::Full { .. }) => refusals += 1,
            Err(e) => return Err(e),
        }
    };

    elevator.request_floor(trip.to)?;
    elevator.exit();

    let arrived_at = Environment::thread().now();
    info!(
        "{} arrived at floor {} with elevator {} after {} ticks",
        Environment::tid(),
        trip.to,
        elevator.id(),
        arrived_at - called_at
    );

    Ok(RideReport {
        trip,
        elevator: elevator.id(),
        refusals,
        called_at,
        arrived_at,
    })
}

#[cfg(test)]
mod tests {
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn random_trips_are_valid() {
        let mut rng = SmallRng::seed_from_u64(0xdead);
        for _i in 0..1000 {
            let trip = Trip::random(&mut rng, 4);
            assert_ne!(trip.from, trip.to);
            assert!((1..=4).contains(&trip.from));
            assert!((1..=4).contains(&trip.to));
        }
    }

    #[test]
    fn trip_direction() {
        assert_eq!(Trip { from: 1, to: 3 }.direction(), Direction::Up);
        assert_eq!(Trip { from: 5, to: 2 }.direction(), Direction::Down);
    }
}
