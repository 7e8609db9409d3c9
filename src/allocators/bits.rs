//-------------------------------------

pub fn div_up(n: u64, divisor: u64) -> Option<u64> {
    if divisor == 0 {
        return None;
    }
    Some(n / divisor + u64::from(n % divisor != 0))
}

/// Rounds n up to a multiple of granularity, which need not be a power of two.
pub fn round_up(n: u64, granularity: u64) -> Option<u64> {
    div_up(n, granularity)?.checked_mul(granularity)
}

/// Rounds n up to a multiple of align.  align must be a power of two.
pub fn align_up(n: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    let mask = align - 1;
    n.checked_add(mask).map(|v| v & !mask)
}

//-------------------------------------


//-------------------------------------
