/// Widening casts that are lossless on all supported targets
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

impl SafeCast<usize> for u16 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

impl SafeCast<u32> for u16 {
    fn safe_cast(self) -> u32 {
        self as u32
    }
}

impl SafeCast<usize> for u8 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}


/// For narrowing casts where business logic ensures that the value is in the narrower type's range.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
impl PrecheckedCast<u16> for usize {
    fn prechecked_cast(self) -> u16 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
impl PrecheckedCast<u8> for usize {
    fn prechecked_cast(self) -> u8 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}

/// Saturating narrowing, for values like window sizes that are advertised in a narrower field
///  than they are tracked in
pub trait SaturatingCast<T> {
    fn saturating_cast(self) -> T;
}
impl SaturatingCast<u16> for u32 {
    fn saturating_cast(self) -> u16 {
        self.try_into().unwrap_or(u16::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 0)]
    #[case(128, 128)]
    #[case(65535, 65535)]
    #[case(65536, 65535)]
    #[case(u32::MAX, 65535)]
    fn test_saturating_cast(#[case] value: u32, #[case] expected: u16) {
        assert_eq!(value.saturating_cast(), expected);
    }

    #[test]
    #[should_panic]
    fn test_prechecked_cast_out_of_range() {
        let _: u8 = 256usize.prechecked_cast();
    }
}
