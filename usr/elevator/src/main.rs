// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Runs one elevator simulation.
//!
//! Usage: `elevator [floors=N] [elevators=N] [capacity=N] [riders=N]
//! [trips=N] [seed=N] [travel=N] [settle=N] [primitives=queue|semaphore]
//! [preempt=N] [log=FILTER]`

use std::process;
use std::sync::Arc;

use log::{error, info};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use elevator::{ride, Config, RideReport, Trip};
use uniproc::{Environment, Scheduler};

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config: Config = match args.join(" ").parse() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("elevator: {}", e);
            process::exit(2);
        }
    };

    env_logger::Builder::new()
        .parse_filters(&config.log_filter)
        .init();
    info!("Simulating {:?}", config);

    let building = match config.building().build() {
        Ok(building) => building,
        Err(e) => {
            error!("Can't build the building: {}", e);
            process::exit(2);
        }
    };

    let scheduler = Scheduler::new(config.scheduler());
    let elevator_tids = building.spawn_elevators(&scheduler);

    let rides: Arc<spin::Mutex<Vec<RideReport>>> = Arc::new(spin::Mutex::new(Vec::new()));
    let mut rng = SmallRng::seed_from_u64(config.seed);
    let window = config.arrival_window();

    for rider in 0..config.riders {
        let plan: Vec<(u64, Trip)> = (0..config.trips)
            .map(|_t| {
                (
                    rng.gen_range(0..=window),
                    Trip::random(&mut rng, config.floors),
                )
            })
            .collect();

        let building = building.clone();
        let rides = rides.clone();
        let spawned = scheduler.spawn(&format!("rider{}", rider), move || {
            for (delay, trip) in plan {
                Environment::thread().sleep(delay);
                match ride(&building, trip) {
                    Ok(report) => rides.lock().push(report),
                    Err(e) => error!("{} gave up on {:?}: {}", Environment::tid(), trip, e),
                }
            }
        });
        if spawned.is_none() {
            error!("Can't spawn rider{}", rider);
        }
    }

    let report = scheduler.run();

    let rides = rides.lock();
    let refusals: usize = rides.iter().map(|r| r.refusals).sum();
    println!("ticks:     {}", report.ticks);
    println!("switches:  {}", report.switches);
    println!(
        "trips:     {}/{}",
        rides.len(),
        config.riders * config.trips
    );
    println!("refusals:  {}", refusals);
    for elevator in building.elevators() {
        println!(
            "elevator{}: {} visits",
            elevator.id(),
            elevator.visits().len()
        );
    }

    let stuck: Vec<_> = report
        .blocked
        .iter()
        .filter(|tid| !elevator_tids.contains(*tid))
        .collect();
    if !stuck.is_empty() {
        error!("Riders never arrived: {:?}", stuck);
        process::exit(1);
    }

    // Idle elevators keep the building alive until the scheduler tears
    // them down.
    drop(rides);
    drop(building);
}
