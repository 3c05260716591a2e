// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The building: per-floor call buttons, the entry rendezvous riders wait
//! at, and the condition idle elevators sleep on.

use std::sync::{Arc, Weak};

use log::{error, info};

use uniproc::interrupt;
use uniproc::{Condition, Environment, EventBarrier, Flavor, Lock, Scheduler, ThreadId, Ticks};

use crate::elevator::{Direction, Elevator};
use crate::error::{ConfigError, ElevatorError};

/// Constructs a [`Building`] together with its elevators.
#[derive(Clone, Copy, Debug)]
pub struct BuildingBuilder {
    floors: usize,
    elevators: usize,
    capacity: usize,
    flavor: Flavor,
    travel_ticks: Ticks,
    settle_ticks: Ticks,
}

impl BuildingBuilder {
    pub fn new(floors: usize) -> Self {
        BuildingBuilder {
            floors,
            elevators: 1,
            capacity: 2,
            flavor: Flavor::default(),
            travel_ticks: 10,
            settle_ticks: 1,
        }
    }

    pub fn elevators(mut self, elevators: usize) -> Self {
        self.elevators = elevators;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Strategy of every lock and condition in the building.
    pub fn flavor(mut self, flavor: Flavor) -> Self {
        self.flavor = flavor;
        self
    }

    /// Time to travel between two adjacent floors.
    pub fn travel_ticks(mut self, ticks: Ticks) -> Self {
        self.travel_ticks = ticks;
        self
    }

    /// Time the doors stay open before an elevator moves on.
    pub fn settle_ticks(mut self, ticks: Ticks) -> Self {
        self.settle_ticks = ticks;
        self
    }

    /// Checks the builder describes a building that can run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.floors < 2 {
            return Err(ConfigError::TooFewFloors {
                floors: self.floors,
            });
        }
        if self.elevators == 0 {
            return Err(ConfigError::NoElevators);
        }
        if self.capacity == 0 {
            return Err(ConfigError::NoCapacity);
        }
        Ok(())
    }

    pub fn build(self) -> Result<Arc<Building>, ConfigError> {
        self.validate()?;

        // Floor numbers are used as indices, slot 0 is unused.
        let slots = self.floors + 1;
        let barriers = |name: &str| -> Vec<EventBarrier<usize>> {
            (0..slots)
                .map(|floor| EventBarrier::new(&format!("{}{}", name, floor)))
                .collect()
        };

        Ok(Arc::new_cyclic(|me: &Weak<Building>| Building {
            floors: self.floors,
            travel_ticks: self.travel_ticks,
            settle_ticks: self.settle_ticks,
            calls: spin::Mutex::new(Calls {
                up: vec![false; slots],
                down: vec![false; slots],
                rider_request: 0,
            }),
            lock: self.flavor.lock("building"),
            cond: self.flavor.condition("building"),
            enter_up: barriers("enter-up"),
            enter_down: barriers("enter-down"),
            up_arrivals: Registry::new(self.flavor, "up-arrivals", slots),
            down_arrivals: Registry::new(self.flavor, "down-arrivals", slots),
            elevators: (0..self.elevators)
                .map(|id| Arc::new(Elevator::new(id, self.floors, self.capacity, me.clone())))
                .collect(),
        }))
    }
}

/// Outside call buttons and the number of riders still waiting for a ride.
#[derive(Debug)]
struct Calls {
    up: Vec<bool>,
    down: Vec<bool>,
    rider_request: usize,
}

/// Remembers which elevator last opened its doors at a floor, one small
/// lock per registry.
struct Registry {
    lock: Box<dyn Lock>,
    last: spin::Mutex<Vec<Option<usize>>>,
}

impl Registry {
    fn new(flavor: Flavor, name: &str, slots: usize) -> Self {
        Registry {
            lock: flavor.lock(name),
            last: spin::Mutex::new(vec![None; slots]),
        }
    }

    fn record(&self, floor: usize, elevator: usize) {
        self.lock.acquire();
        self.last.lock()[floor] = Some(elevator);
        self.lock.release();
    }

    fn get(&self, floor: usize) -> Option<usize> {
        // Outside the scheduler nobody else can be recording.
        if Environment::try_thread().is_none() {
            return self.last.lock()[floor];
        }

        self.lock.acquire();
        let last = self.last.lock()[floor];
        self.lock.release();
        last
    }
}

pub struct Building {
    floors: usize,
    pub(crate) travel_ticks: Ticks,
    pub(crate) settle_ticks: Ticks,
    calls: spin::Mutex<Calls>,
    /// Protects `rider_request` updates against idle checks; paired with `cond`.
    lock: Box<dyn Lock>,
    cond: Box<dyn Condition>,
    enter_up: Vec<EventBarrier<usize>>,
    enter_down: Vec<EventBarrier<usize>>,
    up_arrivals: Registry,
    down_arrivals: Registry,
    elevators: Vec<Arc<Elevator>>,
}

impl Building {
    pub fn floors(&self) -> usize {
        self.floors
    }

    pub fn elevators(&self) -> &[Arc<Elevator>] {
        &self.elevators
    }

    pub(crate) fn check_floor(&self, floor: usize) -> Result<(), ElevatorError> {
        if floor == 0 || floor > self.floors {
            Err(ElevatorError::InvalidFloor {
                floor,
                floors: self.floors,
            })
        } else {
            Ok(())
        }
    }

    fn check_call(&self, floor: usize, direction: Direction) -> Result<(), ElevatorError> {
        self.check_floor(floor)?;
        match direction {
            Direction::Up if floor == self.floors => Err(ElevatorError::InvalidDirection { floor }),
            Direction::Down if floor == 1 => Err(ElevatorError::InvalidDirection { floor }),
            _ => Ok(()),
        }
    }

    /// Presses the up button at `floor`.
    pub fn call_up(&self, floor: usize) -> Result<(), ElevatorError> {
        self.call(floor, Direction::Up)
    }

    /// Presses the down button at `floor`.
    pub fn call_down(&self, floor: usize) -> Result<(), ElevatorError> {
        self.call(floor, Direction::Down)
    }

    /// Registers a ride request at `floor` and wakes up idle elevators.
    pub fn call(&self, floor: usize, direction: Direction) -> Result<(), ElevatorError> {
        self.check_call(floor, direction)?;

        self.lock.acquire();
        {
            let mut calls = self.calls.lock();
            calls.rider_request += 1;
            match direction {
                Direction::Up => calls.up[floor] = true,
                Direction::Down => calls.down[floor] = true,
            }
        }
        self.cond.broadcast(&*self.lock);
        self.lock.release();

        info!("Call {:?} at floor {}", direction, floor);
        Ok(())
    }

    /// Blocks until an elevator going up opens its doors at `floor` and
    /// picks us, returns that elevator.
    pub fn await_up(&self, floor: usize) -> Result<Arc<Elevator>, ElevatorError> {
        self.await_elevator(floor, Direction::Up)
    }

    /// Blocks until an elevator going down opens its doors at `floor` and
    /// picks us, returns that elevator.
    pub fn await_down(&self, floor: usize) -> Result<Arc<Elevator>, ElevatorError> {
        self.await_elevator(floor, Direction::Down)
    }

    pub fn await_elevator(
        &self,
        floor: usize,
        direction: Direction,
    ) -> Result<Arc<Elevator>, ElevatorError> {
        self.check_call(floor, direction)?;

        let id = {
            // A waiting rider always has its button lit.
            let _intr = interrupt::disable();
            self.set_called(floor, direction, true);
            self.entry(floor, direction).wait()
        };

        Ok(self.elevators[id].clone())
    }

    /// Is the outside button for `direction` lit at `floor`?
    pub fn is_called(&self, floor: usize, direction: Direction) -> Result<bool, ElevatorError> {
        self.check_floor(floor)?;
        Ok(self.called(floor, direction))
    }

    /// `is_called` for floors the scan loop already knows to be in range.
    pub(crate) fn called(&self, floor: usize, direction: Direction) -> bool {
        let calls = self.calls.lock();
        match direction {
            Direction::Up => calls.up[floor],
            Direction::Down => calls.down[floor],
        }
    }

    pub(crate) fn set_called(&self, floor: usize, direction: Direction, called: bool) {
        let mut calls = self.calls.lock();
        match direction {
            Direction::Up => calls.up[floor] = called,
            Direction::Down => calls.down[floor] = called,
        }
    }

    /// Number of calls that haven't been answered by an elevator yet.
    pub fn rider_requests(&self) -> usize {
        self.calls.lock().rider_request
    }

    /// A rider got to try entering an elevator: its call is answered.
    pub(crate) fn satisfy_request(&self) {
        let mut calls = self.calls.lock();
        assert!(calls.rider_request > 0, "More entries than calls?");
        calls.rider_request -= 1;
    }

    pub(crate) fn entry(&self, floor: usize, direction: Direction) -> &EventBarrier<usize> {
        match direction {
            Direction::Up => &self.enter_up[floor],
            Direction::Down => &self.enter_down[floor],
        }
    }

    /// # Panics
    /// If `floor` is not a floor of the building.
    pub(crate) fn record_arrival(&self, floor: usize, direction: Direction, elevator: usize) {
        match direction {
            Direction::Up => self.up_arrivals.record(floor, elevator),
            Direction::Down => self.down_arrivals.record(floor, elevator),
        }
    }

    /// The elevator that most recently opened its doors at `floor` going
    /// in `direction`.
    ///
    /// Can be read from outside the scheduler once it stopped running.
    pub fn last_arrival(
        &self,
        floor: usize,
        direction: Direction,
    ) -> Result<Option<usize>, ElevatorError> {
        self.check_floor(floor)?;
        Ok(match direction {
            Direction::Up => self.up_arrivals.get(floor),
            Direction::Down => self.down_arrivals.get(floor),
        })
    }

    /// Parks `elevator` on the building condition while there's nothing to
    /// do for it.
    pub(crate) fn idle(&self, elevator: &Elevator) {
        self.lock.acquire();
        while self.rider_requests() == 0 && elevator.occupancy() == 0 {
            info!("No requests, elevator {} sleeps", elevator.id());
            self.cond.wait(&*self.lock);
            info!("Elevator {} wakes up", elevator.id());
        }
        self.lock.release();
    }

    /// Starts one scheduler thread per elevator, each running its scan loop
    /// forever.
    pub fn spawn_elevators(&self, scheduler: &Scheduler) -> Vec<ThreadId> {
        self.elevators
            .iter()
            .filter_map(|elevator| {
                let elevator = elevator.clone();
                let name = format!("elevator{}", elevator.id());
                let tid = scheduler.spawn(&name, move || elevator.operate());
                if tid.is_none() {
                    error!("Can't spawn {}", name);
                }
                tid
            })
            .collect()
    }
}
