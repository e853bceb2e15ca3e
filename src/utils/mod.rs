// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 pipeflow contributors

//! Terminal helpers for the pipeflow CLI

pub mod colors;
pub mod spinner;

pub use colors::*;
pub use spinner::*;
