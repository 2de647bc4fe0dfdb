//! IBTA fabric timer encodings.

/// Number of 5-bit timer encodings.
pub const FABRIC_TIME_MAX: u8 = 32;

/// RNR NAK timer values in milliseconds, indexed by encoding. Encoding 0 is
/// the largest value.
pub static RNR_TIMER_MS: [f64; FABRIC_TIME_MAX as usize] = [
    655.36, 0.01, 0.02, 0.03, 0.04, 0.06, 0.08, 0.12, 0.16, 0.24, 0.32, 0.48, 0.64, 0.96, 1.28,
    1.92, 2.56, 3.84, 5.12, 7.68, 10.24, 15.36, 20.48, 30.72, 40.96, 61.44, 81.92, 122.88, 163.84,
    245.76, 327.68, 491.52,
];

/// Base unit of the local ACK timeout: 4.096 µs * 2^n.
const QP_TIMEOUT_UNIT_SECS: f64 = 4.096e-6;

/// Encode a local ACK timeout of `seconds`.
///
/// Returns 1 for anything shorter than 8.192 µs and 0 ("infinite") when the
/// encoding would overflow.
pub fn qp_fabric_time(seconds: f64) -> u8 {
    let exp = (seconds / QP_TIMEOUT_UNIT_SECS).log2();
    if !(exp >= 1.0) {
        return 1;
    }
    let rounded = (exp + 0.5).floor();
    if rounded >= f64::from(FABRIC_TIME_MAX) {
        0
    } else {
        rounded as u8
    }
}

/// Encode a minimum RNR NAK timer of `seconds`, picking the nearest table
/// entry by midpoint. Returns 0 (maximum timer) when `seconds` exceeds every
/// finite entry.
pub fn rnr_fabric_time(seconds: f64) -> u8 {
    let time_ms = seconds * 1e3;
    for idx in 1..FABRIC_TIME_MAX {
        let next = (idx + 1) % FABRIC_TIME_MAX;
        let (cur_ms, next_ms) = (RNR_TIMER_MS[idx as usize], RNR_TIMER_MS[next as usize]);
        if time_ms <= next_ms {
            return if time_ms < (cur_ms + next_ms) * 0.5 {
                idx
            } else {
                next
            };
        }
    }
    0
}
