// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::clock::ChainEpoch;

/// Constant defining no quantization.
pub const NO_QUANTIZATION: QuantSpec = QuantSpec { unit: 1, offset: 0 };

/// A spec for quantization.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QuantSpec {
    /// The unit of quantization
    pub unit: ChainEpoch,
    /// The offset from zero at which to base the modulus
    pub offset: ChainEpoch,
}

impl QuantSpec {
    /// Rounds `epoch` to the nearest exact multiple of the quantization unit offset by
    /// `offset % unit`, rounding up.
    ///
    /// This function is equivalent to `unit * ceil(epoch - (offset % unit) / unit) + (offset % unit)`
    /// with the variables/operations over real numbers instead of ints.
    ///
    /// Precondition: `unit >= 0`
    pub fn quantize_up(&self, epoch: ChainEpoch) -> ChainEpoch {
        let offset = self.offset % self.unit;

        let remainder = (epoch - offset) % self.unit;
        let quotient = (epoch - offset) / self.unit;

        // Don't round if epoch falls on a quantization epoch
        if remainder == 0
        // Negative truncating division rounds up
        || epoch - offset < 0
        {
            self.unit * quotient + offset
        } else {
            self.unit * (quotient + 1) + offset
        }
    }

    pub fn quantize_down(&self, epoch: ChainEpoch) -> ChainEpoch {
        let next = self.quantize_up(epoch);
        // QuantizeDown == QuantizeUp iff epoch is a fixed point of QuantizeUp
        if epoch == next { next } else { next - self.unit }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantize_up_rounds_to_the_next_deadline() {
        let quant = QuantSpec { unit: 100, offset: 7 };
        assert_eq!(quant.quantize_up(0), 7);
        assert_eq!(quant.quantize_up(7), 7);
        assert_eq!(quant.quantize_up(8), 107);
        assert_eq!(quant.quantize_up(107), 107);
        assert_eq!(quant.quantize_up(108), 207);
    }

    #[test]
    fn no_quantization_is_identity() {
        for epoch in [0, 1, 2, 1000, 1023] {
            assert_eq!(NO_QUANTIZATION.quantize_up(epoch), epoch);
            assert_eq!(NO_QUANTIZATION.quantize_down(epoch), epoch);
        }
    }

    #[test]
    fn quantize_down_rounds_to_the_prior_boundary() {
        let quant = QuantSpec { unit: 100, offset: 7 };
        assert_eq!(quant.quantize_down(7), 7);
        assert_eq!(quant.quantize_down(8), 7);
        assert_eq!(quant.quantize_down(106), 7);
        assert_eq!(quant.quantize_down(107), 107);
    }
}
