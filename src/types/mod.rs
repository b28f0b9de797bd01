// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Value types shared across the library.
//!
//! - [`DeviceRef`] - An immutable reference to one subscribable device
//! - [`TransportKind`] - The delivery path a device is reachable through
//! - [`Reading`] - One normalized telemetry message
//! - [`Payload`] - The structured or binary body of a reading

mod device;
mod reading;

pub use device::{DeviceRef, TransportKind};
pub use reading::{Measurement, Payload, Reading};
