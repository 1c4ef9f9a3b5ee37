use crate::model::InputPair;

/// Body-mass index of a validated pair: `weight / height²` in real division.
///
/// Height is squared in integer arithmetic first so the divisor is exact
/// for every height a `u32` can carry before the final conversion.
pub fn compute(pair: InputPair) -> f64 {
    let height = u64::from(pair.height());
    f64::from(pair.weight()) / (height * height) as f64
}
