//! Syringe speed calibration.
//!
//! The syringe pump moves its plunger at one of 41 discrete speed codes. Each
//! code is characterised by the time a full stroke takes, so for a barrel of
//! `capacity_ul` the volumetric flow rate of code `c` is
//! `capacity_ul * 60 / SPEED_SEC_TABLE[c]` µL/min. Lower codes are faster.

/// Highest valid speed code.
pub const MAX_SPEED_CODE: u8 = 40;

/// Seconds per full syringe stroke, indexed by speed code.
pub const SPEED_SEC_TABLE: [f64; 41] = [
    1.25, 1.30, 1.39, 1.52, 1.71, 1.97, 2.37, 2.77, 3.03, 3.36, //
    3.77, 4.30, 5.00, 6.00, 7.50, 10.00, 15.00, 30.00, 31.58, 33.33, //
    35.29, 37.50, 40.00, 42.86, 46.15, 50.00, 54.55, 60.00, 66.67, 75.00, //
    85.71, 100.00, 120.00, 150.00, 200.00, 300.00, 333.33, 375.00, 428.57, 500.00, //
    600.00,
];

/// Seconds for a full stroke at `code`, saturating at the slowest code.
pub fn stroke_seconds(code: u8) -> f64 {
    SPEED_SEC_TABLE[usize::from(code.min(MAX_SPEED_CODE))]
}

/// Flow rate in µL/min of speed `code` on a barrel of `capacity_ul`.
pub fn flow_rate(capacity_ul: f64, code: u8) -> f64 {
    capacity_ul * 60.0 / stroke_seconds(code)
}

/// Nearest speed code for `target_ul_per_min`, never faster than `floor`.
///
/// Targets at or above the floor's rate map to `floor`, targets at or below
/// the slowest rate map to the slowest code. Anything in between picks the
/// table entry whose stroke time is closest, ties going to the faster code.
pub fn flow_rate_to_speed_code(capacity_ul: f64, floor: u8, target_ul_per_min: f64) -> u8 {
    let floor = floor.min(MAX_SPEED_CODE);
    if target_ul_per_min <= 0.0 || !target_ul_per_min.is_finite() {
        return MAX_SPEED_CODE;
    }

    let target_time = capacity_ul * 60.0 / target_ul_per_min;
    if target_time <= stroke_seconds(floor) {
        return floor;
    }
    if target_time >= stroke_seconds(MAX_SPEED_CODE) {
        return MAX_SPEED_CODE;
    }

    // Invariant: table[left] < target_time < table[right].
    let mut left = usize::from(floor);
    let mut right = usize::from(MAX_SPEED_CODE);
    while right - left > 1 {
        let mid = (left + right) / 2;
        let mid_time = SPEED_SEC_TABLE[mid];
        if mid_time == target_time {
            return mid as u8;
        }
        if mid_time < target_time {
            left = mid;
        } else {
            right = mid;
        }
    }

    let left_diff = (SPEED_SEC_TABLE[left] - target_time).abs();
    let right_diff = (SPEED_SEC_TABLE[right] - target_time).abs();
    if left_diff <= right_diff {
        left as u8
    } else {
        right as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPACITY: f64 = 5000.0;

    #[test]
    fn test_table_is_monotonic() {
        for pair in SPEED_SEC_TABLE.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn test_table_entries_round_trip() {
        for code in 0..=MAX_SPEED_CODE {
            let rate = flow_rate(CAPACITY, code);
            assert_eq!(flow_rate_to_speed_code(CAPACITY, 0, rate), code);
        }
    }

    #[test]
    fn test_mapping_lands_within_one_step() {
        let slowest = flow_rate(CAPACITY, MAX_SPEED_CODE);
        let fastest = flow_rate(CAPACITY, 0);
        let mut target = slowest;
        while target <= fastest {
            let code = flow_rate_to_speed_code(CAPACITY, 0, target);
            let faster = code.saturating_sub(1);
            let slower = (code + 1).min(MAX_SPEED_CODE);
            assert!(flow_rate(CAPACITY, faster) >= target, "target {target} code {code}");
            assert!(flow_rate(CAPACITY, slower) <= target, "target {target} code {code}");
            target *= 1.07;
        }
    }

    #[test]
    fn test_clamps_to_floor_and_slowest() {
        assert_eq!(flow_rate_to_speed_code(CAPACITY, 10, 1.0e9), 10);
        assert_eq!(flow_rate_to_speed_code(CAPACITY, 0, 1.0e9), 0);
        assert_eq!(flow_rate_to_speed_code(CAPACITY, 0, 0.01), MAX_SPEED_CODE);
        assert_eq!(flow_rate_to_speed_code(CAPACITY, 0, 0.0), MAX_SPEED_CODE);
        // A floor beyond the table is treated as the slowest code.
        assert_eq!(flow_rate_to_speed_code(CAPACITY, 99, 1.0e9), MAX_SPEED_CODE);
    }

    #[test]
    fn test_ties_prefer_faster_code() {
        // Exactly halfway between 10.00 s (code 15) and 15.00 s (code 16).
        let target = CAPACITY * 60.0 / 12.5;
        assert_eq!(flow_rate_to_speed_code(CAPACITY, 0, target), 15);
    }

    #[test]
    fn test_inverse_is_exact() {
        assert_eq!(flow_rate(CAPACITY, 27), CAPACITY);
        assert_eq!(flow_rate(1000.0, 0), 48_000.0);
    }
}
