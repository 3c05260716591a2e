// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use custom_error::custom_error;

custom_error! {
    /// Expected outcomes of building and elevator operations.
    #[derive(PartialEq, Eq, Clone, Copy)]
    pub ElevatorError
    InvalidFloor{floor: usize, floors: usize} = "Floor {floor} is not in 1..={floors}.",
    InvalidDirection{floor: usize} = "Can't travel in the requested direction from floor {floor}.",
    Full{elevator: usize, floor: usize} = "Elevator {elevator} is full at floor {floor}.",
}

custom_error! {
    /// Problems with the simulation options.
    #[derive(PartialEq, Eq, Clone)]
    pub ConfigError
    MalformedOptions{near: String} = "Malformed options near '{near}'.",
    UnknownOption{key: String} = "Unknown option '{key}'.",
    InvalidValue{key: &'static str, value: String} = "Invalid value '{value}' for option '{key}'.",
    TooFewFloors{floors: usize} = "A building needs at least 2 floors (got {floors}).",
    NoElevators = "A building needs at least one elevator.",
    NoCapacity = "Elevator capacity must be at least 1.",
}
