// Epoll-based event-driven I/O dispatcher with a zero-copy dual-ended streaming buffer.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
// Copyright 2021-2023 Alexis Sellier <alexis@cloudhead.io>. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! Four-valued logic for predicates which are evaluated by one thread while another thread may
//! still flip them.
//!
//! A plain `bool` read outside a critical section can be stale the moment it is returned. The
//! transitory values record in which *direction* the answer can still change: a value observed by
//! the thread which is the only one able to make it `true` cannot become `true` behind our back,
//! and vice versa.

use std::fmt::{self, Display, Formatter};
use std::ops;

/// Result of evaluating a racy predicate.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Fuzzy {
    /// The predicate is false and will remain false until the calling thread itself changes it.
    False,
    /// The predicate was false at the moment of evaluation, but a concurrent thread may have
    /// made it true already.
    TransitoryFalse,
    /// The predicate was true at the moment of evaluation, but a concurrent thread may have
    /// made it false already.
    TransitoryTrue,
    /// The predicate is true and will remain true until the calling thread itself changes it.
    True,
}

impl Fuzzy {
    /// Stable truth: only the caller can invalidate it.
    pub fn is_true(self) -> bool { self == Fuzzy::True }

    /// Stable falsehood: only the caller can invalidate it.
    pub fn is_false(self) -> bool { self == Fuzzy::False }

    /// True at the moment of evaluation, possibly stale.
    pub fn is_momentary_true(self) -> bool { matches!(self, Fuzzy::True | Fuzzy::TransitoryTrue) }

    /// False at the moment of evaluation, possibly stale.
    pub fn is_momentary_false(self) -> bool {
        matches!(self, Fuzzy::False | Fuzzy::TransitoryFalse)
    }

    /// True, but another thread may have flipped it; a caller acting on this must re-check under
    /// the appropriate lock.
    pub fn is_transitory_true(self) -> bool { self == Fuzzy::TransitoryTrue }

    /// False, but another thread may have flipped it.
    pub fn is_transitory_false(self) -> bool { self == Fuzzy::TransitoryFalse }
}

impl ops::Not for Fuzzy {
    type Output = Fuzzy;

    fn not(self) -> Self::Output {
        match self {
            Fuzzy::False => Fuzzy::True,
            Fuzzy::TransitoryFalse => Fuzzy::TransitoryTrue,
            Fuzzy::TransitoryTrue => Fuzzy::TransitoryFalse,
            Fuzzy::True => Fuzzy::False,
        }
    }
}

impl Display for Fuzzy {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Fuzzy::False => f.write_str("false"),
            Fuzzy::TransitoryFalse => f.write_str("transitory-false"),
            Fuzzy::TransitoryTrue => f.write_str("transitory-true"),
            Fuzzy::True => f.write_str("true"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn momentary_classification() {
        assert!(Fuzzy::True.is_momentary_true());
        assert!(Fuzzy::TransitoryTrue.is_momentary_true());
        assert!(!Fuzzy::TransitoryFalse.is_momentary_true());
        assert!(Fuzzy::False.is_momentary_false());
        assert!(Fuzzy::TransitoryFalse.is_momentary_false());
        assert!(!Fuzzy::TransitoryTrue.is_momentary_false());
    }

    #[test]
    fn stability() {
        assert!(Fuzzy::True.is_true());
        assert!(!Fuzzy::TransitoryTrue.is_true());
        assert!(Fuzzy::False.is_false());
        assert!(!Fuzzy::TransitoryFalse.is_false());
    }

    #[test]
    fn negation() {
        assert_eq!(!Fuzzy::True, Fuzzy::False);
        assert_eq!(!Fuzzy::False, Fuzzy::True);
        assert_eq!(!Fuzzy::TransitoryTrue, Fuzzy::TransitoryFalse);
        assert_eq!(!Fuzzy::TransitoryFalse, Fuzzy::TransitoryTrue);
    }
}
