//! Overflow-checked integer arithmetic.
//!
//! Managed `Int` and `UInt` arithmetic must fail loudly: any operation that
//! would wrap raises an overflow error in the VM, and division by zero has
//! its own error class. These helpers report both conditions through
//! [`ArithmeticError`]; the evaluator translates them into managed errors.

use thiserror::Error;

/// Failure modes of checked arithmetic.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticError {
    #[error("arithmetic operation overflowed")]
    Overflow,

    #[error("division by zero")]
    DivideByZero,
}

/// Result type alias for checked arithmetic.
pub type ArithmeticResult<T> = Result<T, ArithmeticError>;

#[inline]
pub fn int_add(left: i64, right: i64) -> ArithmeticResult<i64> {
    left.checked_add(right).ok_or(ArithmeticError::Overflow)
}

#[inline]
pub fn int_sub(left: i64, right: i64) -> ArithmeticResult<i64> {
    left.checked_sub(right).ok_or(ArithmeticError::Overflow)
}

#[inline]
pub fn int_mul(left: i64, right: i64) -> ArithmeticResult<i64> {
    left.checked_mul(right).ok_or(ArithmeticError::Overflow)
}

/// Checked signed division. Division by zero and `i64::MIN / -1` both fail.
#[inline]
pub fn int_div(left: i64, right: i64) -> ArithmeticResult<i64> {
    if right == 0 {
        return Err(ArithmeticError::DivideByZero);
    }
    left.checked_div(right).ok_or(ArithmeticError::Overflow)
}

#[inline]
pub fn int_rem(left: i64, right: i64) -> ArithmeticResult<i64> {
    if right == 0 {
        return Err(ArithmeticError::DivideByZero);
    }
    // i64::MIN % -1 overflows in hardware even though the result is zero.
    Ok(left.checked_rem(right).unwrap_or(0))
}

pub fn int_pow(base: i64, exp: i64) -> ArithmeticResult<i64> {
    if exp < 0 {
        return Err(ArithmeticError::Overflow);
    }
    let exp = u32::try_from(exp).map_err(|_| ArithmeticError::Overflow)?;
    base.checked_pow(exp).ok_or(ArithmeticError::Overflow)
}

#[inline]
pub fn uint_add(left: u64, right: u64) -> ArithmeticResult<u64> {
    left.checked_add(right).ok_or(ArithmeticError::Overflow)
}

#[inline]
pub fn uint_sub(left: u64, right: u64) -> ArithmeticResult<u64> {
    left.checked_sub(right).ok_or(ArithmeticError::Overflow)
}

#[inline]
pub fn uint_mul(left: u64, right: u64) -> ArithmeticResult<u64> {
    left.checked_mul(right).ok_or(ArithmeticError::Overflow)
}

#[inline]
pub fn uint_div(left: u64, right: u64) -> ArithmeticResult<u64> {
    if right == 0 {
        return Err(ArithmeticError::DivideByZero);
    }
    Ok(left / right)
}

#[inline]
pub fn uint_rem(left: u64, right: u64) -> ArithmeticResult<u64> {
    if right == 0 {
        return Err(ArithmeticError::DivideByZero);
    }
    Ok(left % right)
}

pub fn uint_pow(base: u64, exp: u64) -> ArithmeticResult<u64> {
    let exp = u32::try_from(exp).map_err(|_| ArithmeticError::Overflow)?;
    base.checked_pow(exp).ok_or(ArithmeticError::Overflow)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_add_overflow() {
        assert_eq!(int_add(i64::MAX, 1), Err(ArithmeticError::Overflow));
        assert_eq!(int_add(i64::MIN, -1), Err(ArithmeticError::Overflow));
        assert_eq!(int_add(40, 2), Ok(42));
    }

    #[test]
    fn test_int_div_edge_cases() {
        assert_eq!(int_div(10, 0), Err(ArithmeticError::DivideByZero));
        assert_eq!(int_div(i64::MIN, -1), Err(ArithmeticError::Overflow));
        assert_eq!(int_div(7, -2), Ok(-3));
    }

    #[test]
    fn test_int_rem_min_by_minus_one() {
        assert_eq!(int_rem(i64::MIN, -1), Ok(0));
        assert_eq!(int_rem(7, 0), Err(ArithmeticError::DivideByZero));
    }

    #[test]
    fn test_uint_overflow() {
        assert_eq!(uint_add(u64::MAX, 1), Err(ArithmeticError::Overflow));
        assert_eq!(uint_sub(0, 1), Err(ArithmeticError::Overflow));
        assert_eq!(uint_mul(u64::MAX, 2), Err(ArithmeticError::Overflow));
    }

    #[test]
    fn test_pow() {
        assert_eq!(int_pow(2, 10), Ok(1024));
        assert_eq!(int_pow(2, 63), Err(ArithmeticError::Overflow));
        assert_eq!(int_pow(2, -1), Err(ArithmeticError::Overflow));
        assert_eq!(uint_pow(2, 63), Ok(1u64 << 63));
    }
}
