// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

pub mod buffers;
pub mod capture;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod factory;
pub mod frames;
pub mod prelude;
pub mod selector;
pub mod stage;
pub mod topology;

pub use buffers::*;
pub use capture::*;
pub use config::*;
pub use dispatch::*;
pub use error::*;
pub use factory::*;
pub use frames::*;
pub use selector::*;
pub use stage::*;
pub use topology::*;
