// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

pub use self::downcast::*;
pub use self::map::*;
pub use self::message_accumulator::MessageAccumulator;

mod downcast;
mod map;
mod message_accumulator;
