// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A single elevator and its scan loop.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_utils::atomic::AtomicCell;
use log::{debug, info, warn};

use uniproc::interrupt;
use uniproc::{Environment, EventBarrier, Ticks};

use crate::building::Building;
use crate::error::ElevatorError;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Up,
    Down,
}

/// Capacity-bounded occupancy of an elevator car.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Cabin {
    capacity: usize,
    occupancy: usize,
}

impl Cabin {
    pub fn new(capacity: usize) -> Self {
        Cabin {
            capacity,
            occupancy: 0,
        }
    }

    /// Lets one more rider in, returns false if the cabin is full.
    pub fn board(&mut self) -> bool {
        if !self.is_full() {
            self.occupancy += 1;
            true
        } else {
            false
        }
    }

    pub fn alight(&mut self) {
        assert!(self.occupancy > 0, "Nobody left in the cabin?");
        self.occupancy -= 1;
    }

    pub fn occupancy(&self) -> usize {
        self.occupancy
    }

    pub fn is_full(&self) -> bool {
        self.occupancy == self.capacity
    }
}

/// An elevator opened its doors at `floor` while heading in `direction`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Visit {
    pub floor: usize,
    pub direction: Direction,
    pub tick: Ticks,
}

/// An elevator. Its floor, direction and cabin are only ever changed by
/// its own scan loop, or by a rider while the scan loop waits for that
/// rider in a rendezvous.
pub struct Elevator {
    id: usize,
    building: Weak<Building>,
    current_floor: AtomicUsize,
    direction: AtomicCell<Direction>,
    cabin: spin::Mutex<Cabin>,
    /// Buttons inside the cabin, indexed by floor.
    floor_called: Vec<AtomicBool>,
    /// Riders bound for a floor wait here until the doors open there.
    exit_bar: Vec<EventBarrier<()>>,
    visits: spin::Mutex<Vec<Visit>>,
}

impl Elevator {
    pub(crate) fn new(id: usize, floors: usize, capacity: usize, building: Weak<Building>) -> Self {
        Elevator {
            id,
            building,
            current_floor: AtomicUsize::new(1),
            direction: AtomicCell::new(Direction::Up),
            cabin: spin::Mutex::new(Cabin::new(capacity)),
            floor_called: (0..=floors).map(|_f| AtomicBool::new(false)).collect(),
            exit_bar: (0..=floors)
                .map(|f| EventBarrier::new(&format!("elevator{}-exit{}", id, f)))
                .collect(),
            visits: spin::Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn current_floor(&self) -> usize {
        self.current_floor.load(Ordering::SeqCst)
    }

    pub fn direction(&self) -> Direction {
        self.direction.load()
    }

    pub fn occupancy(&self) -> usize {
        self.cabin.lock().occupancy()
    }

    /// Is the button for `floor` inside the cabin lit?
    pub fn is_requested(&self, floor: usize) -> bool {
        self.floor_called
            .get(floor)
            .map_or(false, |b| b.load(Ordering::SeqCst))
    }

    /// Every door opening so far, oldest first.
    pub fn visits(&self) -> Vec<Visit> {
        self.visits.lock().clone()
    }

    fn building(&self) -> Arc<Building> {
        self.building
            .upgrade()
            .expect("Elevator outlived its building?")
    }

    /// Called by a rider the elevator picked at its current floor.
    ///
    /// Fails with [`ElevatorError::Full`] if there's no room; the rider has
    /// to call again.
    pub fn enter(&self) -> Result<(), ElevatorError> {
        let building = self.building();
        let floor = self.current_floor();
        let direction = self.direction();

        let _intr = interrupt::disable();
        building.satisfy_request();
        let admitted = self.cabin.lock().board();

        let entry = building.entry(floor, direction);
        if entry.waiters() == 0 {
            building.set_called(floor, direction, false);
        }
        entry.complete();

        if admitted {
            info!(
                "{} enters elevator {} at floor {}",
                Environment::tid(),
                self.id,
                floor
            );
            Ok(())
        } else {
            warn!(
                "{} can't enter elevator {} at floor {}: full",
                Environment::tid(),
                self.id,
                floor
            );
            Err(ElevatorError::Full {
                elevator: self.id,
                floor,
            })
        }
    }

    /// Called by a rider once the elevator released it at its destination.
    pub fn exit(&self) {
        let floor = self.current_floor();
        let _intr = interrupt::disable();
        self.cabin.lock().alight();
        info!(
            "{} exits elevator {} at floor {}",
            Environment::tid(),
            self.id,
            floor
        );
        self.exit_bar[floor].complete();
    }

    /// Presses the button for `floor` and blocks until the doors open there.
    pub fn request_floor(&self, floor: usize) -> Result<(), ElevatorError> {
        if floor == 0 || floor >= self.floor_called.len() {
            return Err(ElevatorError::InvalidFloor {
                floor,
                floors: self.floor_called.len() - 1,
            });
        }

        let _intr = interrupt::disable();
        self.floor_called[floor].store(true, Ordering::SeqCst);
        debug!("{} requests floor {}", Environment::tid(), floor);
        self.exit_bar[floor].wait();
        Ok(())
    }

    /// The scan loop, never returns.
    pub fn operate(&self) {
        let building = self.building();
        info!("Elevator {} starts working", self.id);

        loop {
            let visited = match self.direction() {
                Direction::Up => self.sweep_up(&building),
                Direction::Down => self.sweep_down(&building),
            };
            if !visited {
                // Let riders that are about to press a button get to it.
                Environment::thread().relinquish();
            }
            building.idle(self);
        }
    }

    /// One upward pass. Returns whether any floor was visited.
    fn sweep_up(&self, building: &Building) -> bool {
        let mut visited = self.serve_current_floor(building);

        for floor in self.current_floor() + 1..=building.floors() {
            if !building.called(floor, Direction::Up) && !self.is_requested(floor) {
                continue;
            }
            visited = true;
            self.visit_floor(building, floor);
            self.open_doors(building);

            if !self.needed_above(building, floor) {
                // Turn around here and pick up riders heading down.
                if building.called(floor, Direction::Down) {
                    self.direction.store(Direction::Down);
                    self.board(building);
                }
                self.close_doors(building);
                break;
            }
            self.close_doors(building);
        }

        // Go get the highest down-call before heading down.
        let leftover = (1..=building.floors())
            .rev()
            .find(|floor| building.called(*floor, Direction::Down));
        if let Some(floor) = leftover {
            visited = true;
            self.visit_floor(building, floor);
            self.direction.store(Direction::Down);
            self.open_doors(building);
            self.close_doors(building);
        }

        self.direction.store(Direction::Down);
        visited
    }

    /// One downward pass. Returns whether any floor was visited.
    fn sweep_down(&self, building: &Building) -> bool {
        let mut visited = self.serve_current_floor(building);

        for floor in (1..self.current_floor()).rev() {
            if !building.called(floor, Direction::Down) && !self.is_requested(floor) {
                continue;
            }
            visited = true;
            self.visit_floor(building, floor);
            self.open_doors(building);

            if !self.needed_below(building, floor) {
                if building.called(floor, Direction::Up) {
                    self.direction.store(Direction::Up);
                    self.board(building);
                }
                self.close_doors(building);
                break;
            }
            self.close_doors(building);
        }

        // Go get the lowest up-call before heading up.
        let leftover = (1..=building.floors()).find(|floor| building.called(*floor, Direction::Up));
        if let Some(floor) = leftover {
            visited = true;
            self.visit_floor(building, floor);
            self.direction.store(Direction::Up);
            self.open_doors(building);
            self.close_doors(building);
        }

        self.direction.store(Direction::Up);
        visited
    }

    /// Lets out a rider who asked for the floor we're standing at.
    fn serve_current_floor(&self, building: &Building) -> bool {
        let floor = self.current_floor();
        if self.is_requested(floor) {
            self.visit_floor(building, floor);
            self.open_doors(building);
            self.close_doors(building);
            true
        } else {
            false
        }
    }

    fn needed_above(&self, building: &Building, floor: usize) -> bool {
        (floor + 1..=building.floors())
            .any(|f| building.called(f, Direction::Up) || self.is_requested(f))
    }

    fn needed_below(&self, building: &Building, floor: usize) -> bool {
        (1..floor).any(|f| building.called(f, Direction::Down) || self.is_requested(f))
    }

    /// Travels to `floor`.
    fn visit_floor(&self, building: &Building, floor: usize) {
        let distance = (floor as isize - self.current_floor() as isize).unsigned_abs();
        if distance > 0 {
            debug!(
                "Elevator {} travels {} floors to {}",
                self.id, distance, floor
            );
            let ticks = building.travel_ticks.saturating_mul(distance as Ticks);
            Environment::thread().sleep(ticks);
        }
        self.current_floor.store(floor, Ordering::SeqCst);
        self.floor_called[floor].store(false, Ordering::SeqCst);
    }

    /// Lets everyone bound for this floor out, then takes in the riders
    /// waiting to go our way.
    fn open_doors(&self, building: &Building) {
        let floor = self.current_floor();
        let direction = self.direction();
        let tick = Environment::thread().now();
        self.visits.lock().push(Visit {
            floor,
            direction,
            tick,
        });
        info!(
            "Elevator {} opens doors at floor {} going {:?}",
            self.id, floor, direction
        );

        let exit = &self.exit_bar[floor];
        while exit.waiters() > 0 {
            exit.signal(());
        }

        building.record_arrival(floor, direction, self.id);
        self.board(building);
    }

    /// Admits the riders that were waiting when we started boarding, one
    /// rendezvous each. Refused riders queue up again behind them.
    fn board(&self, building: &Building) {
        let entry = building.entry(self.current_floor(), self.direction());
        let boarding = entry.waiters();
        for _i in 0..boarding {
            if !entry.signal(self.id) {
                break;
            }
        }
    }

    fn close_doors(&self, building: &Building) {
        Environment::thread().sleep(building.settle_ticks);
        debug!(
            "Elevator {} closes doors at floor {}",
            self.id,
            self.current_floor()
        );
    }
}
