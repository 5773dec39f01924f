use std::time::Duration;

/// Widening casts that cannot lose information on any supported target.
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

impl SafeCast<u64> for u32 {
    fn safe_cast(self) -> u64 {
        self as u64
    }
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u16 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}


/// For narrowing casts where business logic ensures that the value is in the narrower type's range.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u16> for usize {
    fn prechecked_cast(self) -> u16 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}

/// Durations are stored as whole microseconds in packed atomic state. Values that do not fit
///  saturate at `u32::MAX` microseconds (a bit over 71 minutes), far above any sensible RTO.
pub trait SaturatingMicros {
    fn saturating_micros(&self) -> u32;
}
impl SaturatingMicros for Duration {
    fn saturating_micros(&self) -> u32 {
        self.as_micros().try_into().unwrap_or(u32::MAX)
    }
}
