/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Primitive instances: numeric addition, Sum, Max, Min.

use serde::Deserialize;
use serde::Serialize;

use super::CommutativeMonoid;
use super::Monoid;
use super::Semigroup;

// Numeric primitives combine by addition.

macro_rules! impl_additive {
    ($($t:ty)*) => {$(
        impl Semigroup for $t {
            fn combine(&self, other: &Self) -> Self {
                self + other
            }
        }

        impl Monoid for $t {
            fn empty() -> Self {
                0 as $t
            }
        }

        impl CommutativeMonoid for $t {}
    )*};
}

impl_additive! { i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 isize usize f32 f64 }

// Sum<T>: combine = +

/// Newtype wrapper making addition explicit at the use site.
///
/// - `combine = a + b`
/// - `empty = 0`
///
/// # Example
/// ```
/// use algebra::Semigroup;
/// use algebra::Sum;
///
/// let a = Sum(5.0);
/// let b = Sum(10.0);
/// assert_eq!(a.combine(&b), Sum(15.0));
/// ```
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize
)]
pub struct Sum<T>(pub T);

impl<T: num_traits::Zero + Clone> Semigroup for Sum<T> {
    fn combine(&self, other: &Self) -> Self {
        Sum(self.0.clone() + other.0.clone())
    }
}

impl<T: num_traits::Zero + Clone> Monoid for Sum<T> {
    fn empty() -> Self {
        Sum(T::zero())
    }
}

impl<T: num_traits::Zero + Clone> CommutativeMonoid for Sum<T> {}

impl<T> From<T> for Sum<T> {
    fn from(value: T) -> Self {
        Sum(value)
    }
}

impl<T> Sum<T> {
    /// Get the inner value.
    pub fn get(&self) -> &T {
        &self.0
    }
}

// Max<T>: combine = max

/// Newtype wrapper for an `Ord` type where `combine` is `max`.
///
/// - `combine = max(a, b)`
/// - `empty = T::MIN` (when T: Bounded)
///
/// # Example
/// ```
/// use algebra::Max;
/// use algebra::Semigroup;
///
/// let a = Max(5);
/// let b = Max(10);
/// assert_eq!(a.combine(&b), Max(10));
/// ```
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize
)]
pub struct Max<T>(pub T);

impl<T: Ord + Clone> Semigroup for Max<T> {
    fn combine(&self, other: &Self) -> Self {
        if self.0 >= other.0 {
            self.clone()
        } else {
            other.clone()
        }
    }
}

impl<T: Ord + Clone + num_traits::Bounded> Monoid for Max<T> {
    fn empty() -> Self {
        Max(num_traits::Bounded::min_value())
    }
}

impl<T: Ord + Clone + num_traits::Bounded> CommutativeMonoid for Max<T> {}

impl<T> From<T> for Max<T> {
    fn from(value: T) -> Self {
        Max(value)
    }
}

impl<T: Ord + Clone + num_traits::Bounded> Default for Max<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Max<T> {
    /// Get the inner value.
    pub fn get(&self) -> &T {
        &self.0
    }
}

// Min<T>: combine = min

/// Newtype wrapper for an `Ord` type where `combine` is `min`.
///
/// - `combine = min(a, b)`
/// - `empty = T::MAX` (when T: Bounded)
///
/// # Example
/// ```
/// use algebra::Min;
/// use algebra::Semigroup;
///
/// let a = Min(5);
/// let b = Min(10);
/// assert_eq!(a.combine(&b), Min(5));
/// ```
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize
)]
pub struct Min<T>(pub T);

impl<T: Ord + Clone> Semigroup for Min<T> {
    fn combine(&self, other: &Self) -> Self {
        if self.0 <= other.0 {
            self.clone()
        } else {
            other.clone()
        }
    }
}

impl<T: Ord + Clone + num_traits::Bounded> Monoid for Min<T> {
    fn empty() -> Self {
        Min(num_traits::Bounded::max_value())
    }
}

impl<T: Ord + Clone + num_traits::Bounded> CommutativeMonoid for Min<T> {}

impl<T> From<T> for Min<T> {
    fn from(value: T) -> Self {
        Min(value)
    }
}

impl<T: Ord + Clone + num_traits::Bounded> Default for Min<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Min<T> {
    /// Get the inner value.
    pub fn get(&self) -> &T {
        &self.0
    }
}

// Tests
