// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::anyhow;

use crate::bitstream_utils::BitReader;

pub(crate) struct Reader<'a>(BitReader<'a>);

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self(BitReader::new(data, false))
    }

    pub fn read_bit(&mut self) -> anyhow::Result<bool> {
        self.0.read_bit().map_err(|err| anyhow!(err))
    }

    /// Reads up to 32 bits. The underlying reader tops out at 31 bits per
    /// read, so 32-bit fields are assembled from two halves.
    pub fn read_bits<U: TryFrom<u32>>(&mut self, num_bits: usize) -> anyhow::Result<U> {
        let value = if num_bits == 32 {
            let high: u32 = self.0.read_bits(16).map_err(|err| anyhow!(err))?;
            let low: u32 = self.0.read_bits(16).map_err(|err| anyhow!(err))?;
            (high << 16) | low
        } else {
            self.0.read_bits(num_bits).map_err(|err| anyhow!(err))?
        };

        U::try_from(value).map_err(|_| anyhow!("conversion failed"))
    }

    pub fn skip_bits(&mut self, num_bits: usize) -> anyhow::Result<()> {
        self.0.skip_bits(num_bits).map_err(|err| anyhow!(err))
    }

    /// Implements uvlc(): Variable length unsigned n-bit number appearing
    /// directly in the bitstream. See 4.10.3
    pub fn read_uvlc(&mut self) -> anyhow::Result<u32> {
        let mut leading_zeroes = 0;
        loop {
            let done = self.read_bit()?;

            if done {
                break;
            }

            leading_zeroes += 1;
        }

        if leading_zeroes >= 32 {
            return Ok(u32::MAX);
        }

        let value = self.read_bits::<u32>(leading_zeroes)?;
        Ok(value + (1 << leading_zeroes) - 1)
    }

    /// Implements leb128(): Unsigned integer represented by a variable number
    /// of little-endian bytes. See 4.10.5
    pub fn read_leb128(&mut self) -> anyhow::Result<u32> {
        let mut value = 0u64;

        for i in 0..8 {
            let byte =
                u64::from(self.0.read_bits_aligned::<u32>(8).map_err(|err| anyhow!(err))?);
            value |= (byte & 0x7f) << (i * 7);

            if byte & 0x80 == 0 {
                return Ok(value as u32);
            }
        }

        Err(anyhow!("leb128 value spans more than 8 bytes"))
    }

    pub fn more_data_in_bitstream(&mut self) -> bool {
        self.0.num_bits_left() > 0
    }

    pub fn position(&self) -> u64 {
        self.0.position()
    }

    pub(crate) fn consumed(&self, start_pos: u32) -> u32 {
        (self.0.position() / 8) as u32 - start_pos
    }
}

impl<'a> Clone for Reader<'a> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}
