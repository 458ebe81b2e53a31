// Resona
// Copyright (c) 2025 The Project Resona Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `checksum` module provides implementations of error-detecting codes.

mod crc32;

pub use crc32::Crc32;
