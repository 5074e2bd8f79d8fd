//! Token amounts and fee arithmetic.
//!
//! Amounts are signed so that vote bookkeeping can apply withdrawals as
//! negative deltas before summing.

pub type Amount = i64;

/// Minimum fee for a transaction carrying `data_len` bytes of payload.
///
/// The base fee covers an empty payload; every started 200 byte slice adds
/// to it, with a steeper slope past the first kilobyte.
pub fn min_tx_fee(data_len: usize, base_fee: Amount) -> Amount {
    if data_len == 0 {
        return base_fee;
    }
    let mut multiplier = (data_len / 200) as i64;
    if data_len % 200 > 0 {
        multiplier += 1;
    }
    if multiplier > 5 {
        base_fee + base_fee * 10 + (multiplier - 5) * base_fee * 4
    } else {
        base_fee + multiplier * base_fee * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_TX_FEE;

    #[test]
    fn empty_payload_pays_base_fee() {
        assert_eq!(min_tx_fee(0, MIN_TX_FEE), MIN_TX_FEE);
    }

    #[test]
    fn fee_grows_with_payload() {
        assert_eq!(min_tx_fee(1, MIN_TX_FEE), MIN_TX_FEE * 3);
        assert_eq!(min_tx_fee(200, MIN_TX_FEE), MIN_TX_FEE * 3);
        assert_eq!(min_tx_fee(201, MIN_TX_FEE), MIN_TX_FEE * 5);
        assert_eq!(min_tx_fee(1000, MIN_TX_FEE), MIN_TX_FEE * 11);
        // past five slices the slope steepens
        assert_eq!(min_tx_fee(1001, MIN_TX_FEE), MIN_TX_FEE * 11 + MIN_TX_FEE * 4);
    }
}
