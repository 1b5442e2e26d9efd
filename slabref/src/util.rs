use std::{fmt, ptr::NonNull};

/// Divide, rounding up
pub const fn divroundup(num: usize, divisor: usize) -> usize {
    num / divisor + (num % divisor != 0) as usize
}

/// Round `num` up to the next multiple of `multiple`
pub const fn roundto(num: usize, multiple: usize) -> usize {
    divroundup(num, multiple).saturating_mul(multiple)
}

/// Pointer that prints as a plain hex address
///
/// Used for tracing fields, where `{:?}` of a reference would print the pointee
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsizePtr(usize);

impl fmt::Debug for UsizePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl<T: ?Sized> From<*const T> for UsizePtr {
    fn from(value: *const T) -> Self {
        Self(value as *const () as usize)
    }
}
impl<T: ?Sized> From<*mut T> for UsizePtr {
    fn from(value: *mut T) -> Self {
        Self(value as *const () as usize)
    }
}
impl<T: ?Sized> From<NonNull<T>> for UsizePtr {
    fn from(value: NonNull<T>) -> Self {
        Self(value.as_ptr() as *const () as usize)
    }
}
impl<T: ?Sized> From<&T> for UsizePtr {
    fn from(value: &T) -> Self {
        Self(value as *const T as *const () as usize)
    }
}

/// Human-readable byte size, e.g. `1M`, `1K512B(1536)`
///
/// The exact byte count is appended in parens unless the size is a whole unit
pub fn format_size(size: usize) -> String {
    const UNITS: [(usize, &str); 4] = [
        (1024 * 1024 * 1024, "G"),
        (1024 * 1024, "M"),
        (1024, "K"),
        (1, "B"),
    ];

    if size == 0 {
        return "0".to_owned();
    }

    let mut s = String::new();
    let mut rest = size;
    let mut parts = 0;
    for (unit, suffix) in UNITS {
        if rest >= unit {
            s.push_str(&format!("{}{}", rest / unit, suffix));
            rest %= unit;
            parts += 1;
        }
    }
    if parts > 1 {
        s.push_str(&format!("({})", size));
    }
    s
}

/// Count with thousands separators, e.g. `65,536`
pub fn format_count(count: usize) -> String {
    let digits = count.to_string();
    let mut s = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i != 0 && (digits.len() - i) % 3 == 0 {
            s.push(',');
        }
        s.push(c);
    }
    s
}
