// SPDX-License-Identifier: MIT
pub mod buffer;
pub mod checkpoint;
pub mod format;
pub mod markers;
pub mod reader;
pub mod session;
pub mod writer;
