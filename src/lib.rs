// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Elementary-stream parsers for remuxing.
//!
//! This crate segments raw AV1 and AVC/H.264 elementary streams into frames
//! suitable for writing into a container: it finds codec unit boundaries,
//! tracks parameter sets, classifies keyframes, restores presentation order
//! and assigns timestamps, and builds the codec configuration records
//! (`av1C`, `avcC`) containers expect.

pub mod bitstream_utils;
pub mod codec;

/// Pixel dimensions of a stream.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}
