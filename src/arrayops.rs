use num_traits::{Float, ToPrimitive};

/// Build an evenly spaced grid over `[start, end)` with spacing `step`.
pub fn gridspace<T: Float + ToPrimitive>(start: T, end: T, step: T) -> Vec<T> {
    let distance = end - start;
    let steps = (distance / step).round().to_usize().unwrap_or_default();
    let mut result = Vec::with_capacity(steps);
    for i in 0..steps {
        result.push(start + T::from(i).unwrap_or_else(T::zero) * step);
    }
    result
}

/// Subtract `other` from `target` element-wise, in place.
pub(crate) fn subtract_in_place<T: Float>(target: &mut [T], other: &[T]) {
    for (t, o) in target.iter_mut().zip(other.iter().copied()) {
        *t = *t - o;
    }
}

/// Add `other` into `target` element-wise, in place.
pub(crate) fn add_in_place<T: Float>(target: &mut [T], other: &[T]) {
    for (t, o) in target.iter_mut().zip(other.iter().copied()) {
        *t = *t + o;
    }
}

pub fn isclose<T: Float>(x: T, y: T, rtol: T, atol: T) -> bool {
    (x - y).abs() <= (atol + rtol * y.abs())
}
