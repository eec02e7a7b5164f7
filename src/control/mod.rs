// SPDX-License-Identifier: MIT
pub mod actuator;
pub mod classifier;
pub mod policy;
pub mod runner;
pub mod window;
