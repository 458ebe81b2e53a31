// Resona
// Copyright (c) 2025 The Project Resona Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use resona_core::dsp::Imdct;

use super::residue::ResidueScratch;
use super::window::Windows;

/// Per-channel decode state.
pub struct DspChannel {
    /// The working buffer. Holds the spectrum during packet decode, then the
    /// time-domain samples after the inverse transform. Length is the long
    /// block size.
    pub buf: Vec<f32>,
    /// The unwindowed right-half tail of the previous frame, carried for
    /// overlap-add. Length is half the long block size.
    prev: Vec<f32>,
    /// Decoded floor posts for this channel.
    pub final_y: Vec<i32>,
    /// The channel's floor was unused and no residue is coded for it.
    pub do_not_decode: bool,
    /// The channel's floor was unused, so its output is silence even if it
    /// took part in residue decoding through coupling.
    pub really_zero: bool,
}

impl DspChannel {
    fn new(bs1: usize, floor_values: usize) -> Self {
        DspChannel {
            buf: vec![0.0; bs1],
            prev: vec![0.0; bs1 >> 1],
            final_y: vec![0; floor_values],
            do_not_decode: false,
            really_zero: false,
        }
    }
}

/// Shared DSP state for one decoder instance.
pub struct Dsp {
    pub channels: Vec<DspChannel>,
    /// IMDCT for short blocks, then long blocks.
    pub imdct: [Imdct; 2],
    pub windows: Windows,
    /// Residue decode scratch-pad.
    pub residue_scratch: ResidueScratch,
    /// The number of valid samples carried in each channel's `prev` buffer.
    /// Zero when the next frame has no predecessor to lap with.
    pub previous_length: usize,
}

impl Dsp {
    pub fn new(bs0: usize, bs1: usize, n_channels: usize, floor_values: usize) -> Self {
        Dsp {
            channels: (0..n_channels).map(|_| DspChannel::new(bs1, floor_values)).collect(),
            imdct: [Imdct::new(bs0), Imdct::new(bs1)],
            windows: Windows::new(bs0, bs1),
            residue_scratch: ResidueScratch::default(),
            previous_length: 0,
        }
    }

    /// Invalidates the lapping state. The next decoded frame emits no
    /// samples.
    pub fn reset(&mut self) {
        self.previous_length = 0;
    }

    /// Completes a decoded frame: overlap-adds the previous frame's tail into
    /// the left window region, saves the new right tail, and returns the
    /// number of samples emitted at offset `left`.
    ///
    /// `len` bounds the valid samples of this frame (normally the right
    /// window end, less when the final frame is truncated). `left` and
    /// `right` are the starts of the left and right window regions.
    pub fn finish_frame(&mut self, len: usize, left: usize, right: usize) -> usize {
        // Mix in the previous frame's tail. The tail is stored unwindowed, so
        // both window halves are applied here: the current frame's samples
        // ramp up while the previous tail ramps down.
        if self.previous_length > 0 {
            let n = self.previous_length;

            let window = match self.windows.by_half_length(n) {
                Some(window) => window,
                None => return 0,
            };

            for channel in self.channels.iter_mut() {
                for j in 0..n {
                    channel.buf[left + j] = channel.buf[left + j] * window[j]
                        + channel.prev[j] * window[n - 1 - j];
                }
            }
        }

        let had_previous = self.previous_length > 0;

        // The right-of-window samples become the tail for the next frame.
        self.previous_length = len.saturating_sub(right);

        for channel in self.channels.iter_mut() {
            let tail = len.saturating_sub(right);
            channel.prev[..tail].copy_from_slice(&channel.buf[right..right + tail]);
        }

        if !had_previous {
            // Without a predecessor the left half of this frame is
            // indeterminate, so no samples can be emitted.
            return 0;
        }

        // Truncate a short final frame.
        let right = right.min(len);

        right - left
    }
}
