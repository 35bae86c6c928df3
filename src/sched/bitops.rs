//! Bit-scan helpers used by ready-queue selection.
//!
//! Both functions are 1-based: bit 0 set reports 1, and a zero word reports 0.
//! The native versions compile down to the CPU's count-zeros instruction; the
//! table versions are for cores without one and are selected with the
//! `lut-bitscan` feature.

/// Index (1-based) of the least significant set bit, 0 if `value` is zero.
#[inline]
pub const fn ffs(value: u32) -> u32 {
    #[cfg(not(feature = "lut-bitscan"))]
    {
        ffs_native(value)
    }
    #[cfg(feature = "lut-bitscan")]
    {
        ffs_table(value)
    }
}

/// Index (1-based) of the most significant set bit, 0 if `value` is zero.
#[inline]
pub const fn fls(value: u32) -> u32 {
    #[cfg(not(feature = "lut-bitscan"))]
    {
        fls_native(value)
    }
    #[cfg(feature = "lut-bitscan")]
    {
        fls_table(value)
    }
}

#[inline]
pub const fn ffs_native(value: u32) -> u32 {
    if value == 0 {
        0
    } else {
        value.trailing_zeros() + 1
    }
}

#[inline]
pub const fn fls_native(value: u32) -> u32 {
    32 - value.leading_zeros()
}

/// Lowest set bit (1-based) of each byte value.
const LOWEST_BIT: [u8; 256] = {
    let mut table = [0u8; 256];
    let mut i = 1;
    while i < 256 {
        let mut bit = 0;
        while (i >> bit) & 1 == 0 {
            bit += 1;
        }
        table[i] = bit as u8 + 1;
        i += 1;
    }
    table
};

/// Highest set bit (1-based) of each byte value.
const HIGHEST_BIT: [u8; 256] = {
    let mut table = [0u8; 256];
    let mut i = 1;
    while i < 256 {
        let mut bit = 7;
        while (i >> bit) & 1 == 0 {
            bit -= 1;
        }
        table[i] = bit as u8 + 1;
        i += 1;
    }
    table
};

pub const fn ffs_table(value: u32) -> u32 {
    let mut shift = 0;
    while shift < 32 {
        let byte = ((value >> shift) & 0xFF) as usize;
        if byte != 0 {
            return LOWEST_BIT[byte] as u32 + shift;
        }
        shift += 8;
    }
    0
}

pub const fn fls_table(value: u32) -> u32 {
    let mut shift = 24i32;
    while shift >= 0 {
        let byte = ((value >> shift) & 0xFF) as usize;
        if byte != 0 {
            return HIGHEST_BIT[byte] as u32 + shift as u32;
        }
        shift -= 8;
    }
    0
}
