// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Simulation options parser.
//!
//! Options are `key=value` pairs separated by spaces, e.g.
//! `floors=8 elevators=2 primitives=semaphore log='elevator=debug'`.

use core::str::FromStr;

use logos::Logos;

use uniproc::{Flavor, Preemption, SchedulerConfig, Ticks};

use crate::building::BuildingBuilder;
use crate::error::ConfigError;

/// Definition to parse the simulation options.
#[derive(Logos, Debug, PartialEq, Clone, Copy)]
enum OptToken {
    #[token("floors")]
    Floors,

    #[token("elevators")]
    Elevators,

    /// Riders per elevator
    #[token("capacity")]
    Capacity,

    #[token("riders")]
    Riders,

    /// Trips every rider makes
    #[token("trips")]
    Trips,

    #[token("seed")]
    Seed,

    /// Ticks to travel one floor
    #[token("travel")]
    Travel,

    /// Ticks the doors stay open
    #[token("settle")]
    Settle,

    /// Lock and condition strategy
    #[token("primitives")]
    Primitives,

    /// Preempt with probability 1/N at every atomic section exit
    #[token("preempt")]
    Preempt,

    /// Log filter
    #[token("log")]
    Log,

    #[regex("[a-zA-Z0-9\\._:,-]+")]
    Ident,

    #[token("=", priority = 22)]
    KVSeparator,

    #[regex(r#"'[^']*'"#)]
    LiteralString,

    /// Anything not properly encoded
    #[error]
    #[regex(r"[ \t\n]+", logos::skip)]
    Error,
}

impl OptToken {
    fn is_key(self) -> bool {
        !matches!(
            self,
            OptToken::Ident | OptToken::KVSeparator | OptToken::LiteralString | OptToken::Error
        )
    }
}

/// Everything needed to set up and drive one simulation run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub floors: usize,
    pub elevators: usize,
    pub capacity: usize,
    pub riders: usize,
    pub trips: usize,
    pub seed: u64,
    pub travel: Ticks,
    pub settle: Ticks,
    pub primitives: Flavor,
    pub preempt: Option<u32>,
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            floors: 5,
            elevators: 1,
            capacity: 2,
            riders: 4,
            trips: 1,
            seed: 0,
            travel: 10,
            settle: 1,
            primitives: Flavor::Queue,
            preempt: None,
            log_filter: String::from("info"),
        }
    }
}

fn number<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse::<T>().map_err(|_e| ConfigError::InvalidValue {
        key,
        value: value.into(),
    })
}

impl Config {
    fn set(&mut self, key: OptToken, value: &str) -> Result<(), ConfigError> {
        match key {
            OptToken::Floors => self.floors = number("floors", value)?,
            OptToken::Elevators => self.elevators = number("elevators", value)?,
            OptToken::Capacity => self.capacity = number("capacity", value)?,
            OptToken::Riders => self.riders = number("riders", value)?,
            OptToken::Trips => self.trips = number("trips", value)?,
            OptToken::Seed => self.seed = number("seed", value)?,
            OptToken::Travel => self.travel = number("travel", value)?,
            OptToken::Settle => self.settle = number("settle", value)?,
            OptToken::Primitives => {
                self.primitives = value.parse().map_err(|_e| ConfigError::InvalidValue {
                    key: "primitives",
                    value: value.into(),
                })?
            }
            OptToken::Preempt => {
                let one_in: u32 = number("preempt", value)?;
                if one_in == 0 {
                    return Err(ConfigError::InvalidValue {
                        key: "preempt",
                        value: value.into(),
                    });
                }
                self.preempt = Some(one_in);
            }
            OptToken::Log => self.log_filter = value.into(),
            _ => unreachable!("{:?} is not an option key", key),
        }
        Ok(())
    }

    /// Checks the options describe a building that can run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.building().validate()
    }

    pub fn building(&self) -> BuildingBuilder {
        BuildingBuilder::new(self.floors)
            .elevators(self.elevators)
            .capacity(self.capacity)
            .flavor(self.primitives)
            .travel_ticks(self.travel)
            .settle_ticks(self.settle)
    }

    /// Riders show up at random times within one full sweep.
    pub fn arrival_window(&self) -> Ticks {
        self.travel.saturating_mul(self.floors as Ticks)
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            preempt: self.preempt.map(|one_in| Preemption {
                seed: self.seed,
                one_in,
            }),
        }
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    /// Parses the options and validates the result.
    fn from_str(args: &str) -> Result<Self, Self::Err> {
        let mut parsed: Config = Default::default();
        let mut lexer = OptToken::lexer(args);
        let mut key: Option<OptToken> = None;
        let mut separated = false;

        while let Some(token) = lexer.next() {
            let slice = lexer.slice();

            match token {
                t if t.is_key() => {
                    if key.is_some() {
                        return Err(ConfigError::MalformedOptions { near: slice.into() });
                    }
                    key = Some(t);
                }
                OptToken::KVSeparator => {
                    if key.is_none() || separated {
                        return Err(ConfigError::MalformedOptions { near: slice.into() });
                    }
                    separated = true;
                }
                OptToken::Ident | OptToken::LiteralString => {
                    let value = if token == OptToken::LiteralString {
                        // We strip the quotes with 1..slice.len()-1
                        &slice[1..slice.len() - 1]
                    } else {
                        slice
                    };

                    match (key.take(), separated) {
                        (Some(k), true) => parsed.set(k, value)?,
                        (None, false) => {
                            return Err(ConfigError::UnknownOption { key: slice.into() })
                        }
                        _ => return Err(ConfigError::MalformedOptions { near: slice.into() }),
                    }
                    separated = false;
                }
                _ => {
                    return Err(ConfigError::MalformedOptions { near: slice.into() });
                }
            }
        }

        if let Some(k) = key {
            return Err(ConfigError::MalformedOptions {
                near: format!("{:?}", k).to_lowercase(),
            });
        }

        parsed.validate()?;
        Ok(parsed)
    }
}
