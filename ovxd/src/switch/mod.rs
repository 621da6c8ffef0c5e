// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Physical and virtual switches.

pub mod buffer;
pub mod ovx;
pub mod physical;
pub mod xid;

pub use ovx::BigSwitch;
pub use ovx::OvxSwitch;
pub use ovx::SwitchKind;
pub use physical::PhysicalSwitch;
