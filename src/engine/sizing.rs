//! Position sizing.
//!
//! Values above the allocation threshold are dollar allocations converted at
//! the last price; anything else is an explicit share count. Share counts
//! clamp to `[min_shares, max_shares]`; an allocation too small for a single
//! share aborts the entry.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SizingError {
    #[error("no usable price to size allocation of {allocation:.2}")]
    NoPrice { allocation: f64 },

    #[error("allocation {allocation:.2} at price {price:.2} yields no whole share")]
    TooSmall { allocation: f64, price: f64 },

    #[error("explicit share count {0:.2} is not a positive whole number")]
    BadShareCount(f64),
}

#[derive(Debug, Clone)]
pub struct PositionSizer {
    /// Values above this are treated as dollar allocations.
    pub allocation_threshold: f64,
    pub min_shares: u32,
    pub max_shares: u32,
}

impl Default for PositionSizer {
    fn default() -> Self {
        Self {
            allocation_threshold: 1_000.0,
            min_shares: 1,
            max_shares: 10_000,
        }
    }
}

impl PositionSizer {
    /// Resolve `qty_or_allocation` into a share count. `last_price` is only
    /// consulted on the allocation path.
    pub fn shares_for(
        &self,
        qty_or_allocation: f64,
        last_price: Option<f64>,
    ) -> Result<u32, SizingError> {
        if qty_or_allocation > self.allocation_threshold {
            let allocation = qty_or_allocation;
            let price = match last_price {
                Some(p) if p > 0.0 => p,
                _ => return Err(SizingError::NoPrice { allocation }),
            };
            let shares = (allocation / price).floor() as u32;
            if shares < self.min_shares {
                return Err(SizingError::TooSmall { allocation, price });
            }
            Ok(shares.min(self.max_shares))
        } else {
            let shares = qty_or_allocation.floor();
            if shares < 1.0 || (qty_or_allocation - shares).abs() > 1e-9 {
                return Err(SizingError::BadShareCount(qty_or_allocation));
            }
            Ok((shares as u32).min(self.max_shares))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_path() {
        let sizer = PositionSizer::default();
        // 10_000 / 78.50 = 127.38… → 127 shares
        assert_eq!(sizer.shares_for(10_000.0, Some(78.50)), Ok(127));
    }

    #[test]
    fn test_explicit_share_count() {
        let sizer = PositionSizer::default();
        assert_eq!(sizer.shares_for(100.0, None), Ok(100));
        assert_eq!(sizer.shares_for(1_000.0, None), Ok(1_000));
    }

    #[test]
    fn test_allocation_below_one_share_aborts() {
        let sizer = PositionSizer::default();
        assert_eq!(
            sizer.shares_for(1_500.0, Some(2_000.0)),
            Err(SizingError::TooSmall {
                allocation: 1_500.0,
                price: 2_000.0
            })
        );
    }

    #[test]
    fn test_allocation_caps_at_max() {
        let sizer = PositionSizer::default();
        // 1_000_000 / 5 = 200_000 → capped
        assert_eq!(sizer.shares_for(1_000_000.0, Some(5.0)), Ok(10_000));
    }

    #[test]
    fn test_missing_price_aborts_allocation() {
        let sizer = PositionSizer::default();
        assert!(matches!(
            sizer.shares_for(10_000.0, None),
            Err(SizingError::NoPrice { .. })
        ));
    }

    #[test]
    fn test_fractional_share_count_rejected() {
        let sizer = PositionSizer::default();
        assert!(matches!(
            sizer.shares_for(10.5, None),
            Err(SizingError::BadShareCount(_))
        ));
        assert!(matches!(
            sizer.shares_for(0.0, None),
            Err(SizingError::BadShareCount(_))
        ));
    }
}
