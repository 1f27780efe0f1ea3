// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A declarative macro for small, copyable flag sets.

/// Declares a transparent flag-set newtype with named constants, set
/// operations and a `Debug` implementation listing the named flags.
#[macro_export]
#[doc(hidden)]
macro_rules! strata_bitflags {
    (
        $(#[$attr:meta])*
        $vis:vis struct $name:ident: $ty:ty {
            $(
                $(#[$flag_attr:meta])*
                const $flag_name:ident = $flag_value:expr;
            )*
        }
    ) => {
        $(#[$attr])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        $vis struct $name {
            bits: $ty,
        }

        impl $name {
            /// The set containing no flags.
            pub const EMPTY: Self = Self { bits: 0 };

            $(
                $(#[$flag_attr])*
                pub const $flag_name: Self = Self { bits: $flag_value };
            )*

            /// Builds a set from raw bits. Unknown bits are preserved.
            pub const fn from_bits_retain(bits: $ty) -> Self {
                Self { bits }
            }

            /// The raw bit pattern.
            pub const fn bits(&self) -> $ty {
                self.bits
            }

            /// `true` when no bit is set.
            pub const fn is_empty(&self) -> bool {
                self.bits == 0
            }

            /// `true` when every flag of `other` is set in `self`.
            pub const fn contains(&self, other: Self) -> bool {
                (self.bits & other.bits) == other.bits
            }

            /// `true` when at least one flag of `other` is set in `self`.
            pub const fn intersects(&self, other: Self) -> bool {
                (self.bits & other.bits) != 0
            }

            /// Sets every flag of `other`.
            pub fn insert(&mut self, other: Self) {
                self.bits |= other.bits;
            }

            /// Clears every flag of `other`.
            pub fn remove(&mut self, other: Self) {
                self.bits &= !other.bits;
            }

            /// Returns `self` with `other` set.
            #[must_use]
            pub const fn union(self, other: Self) -> Self {
                Self { bits: self.bits | other.bits }
            }

            /// Returns `self` with `other` cleared.
            #[must_use]
            pub const fn difference(self, other: Self) -> Self {
                Self { bits: self.bits & !other.bits }
            }
        }

        impl core::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, other: Self) -> Self {
                self.union(other)
            }
        }

        impl core::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, other: Self) {
                self.insert(other);
            }
        }

        impl core::ops::BitAnd for $name {
            type Output = Self;
            fn bitand(self, other: Self) -> Self {
                Self { bits: self.bits & other.bits }
            }
        }

        impl core::ops::Sub for $name {
            type Output = Self;
            fn sub(self, other: Self) -> Self {
                self.difference(other)
            }
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}(", stringify!($name))?;
                let mut rest = self.bits;
                let mut sep = "";
                $(
                    if $flag_value != 0 && (rest & $flag_value) == $flag_value {
                        write!(f, "{}{}", sep, stringify!($flag_name))?;
                        rest &= !$flag_value;
                        sep = " | ";
                    }
                )*
                if rest != 0 {
                    write!(f, "{}{:#x}", sep, rest)?;
                } else if sep.is_empty() {
                    write!(f, "EMPTY")?;
                }
                write!(f, ")")
            }
        }
    };
}

#[cfg(test)]
mod tests {
    strata_bitflags! {
        /// Flags used to exercise the macro.
        pub struct Access: u8 {
            const READ = 1 << 0;
            const WRITE = 1 << 1;
            const READ_WRITE = (1 << 0) | (1 << 1);
            const COHERENT = 1 << 4;
        }
    }

    #[test]
    fn test_set_operations() {
        let mut flags = Access::READ | Access::COHERENT;
        assert!(flags.contains(Access::READ));
        assert!(!flags.contains(Access::READ_WRITE));
        assert!(flags.intersects(Access::READ_WRITE));

        flags.insert(Access::WRITE);
        assert!(flags.contains(Access::READ_WRITE));

        flags.remove(Access::READ);
        assert_eq!(flags, Access::WRITE | Access::COHERENT);
        assert_eq!(flags - Access::COHERENT, Access::WRITE);
        assert_eq!(flags.bits(), 0b1_0010);
        assert!((flags & Access::READ).is_empty());
    }

    #[test]
    fn test_debug_lists_named_flags() {
        assert_eq!(format!("{:?}", Access::EMPTY), "Access(EMPTY)");
        assert_eq!(format!("{:?}", Access::WRITE | Access::COHERENT), "Access(WRITE | COHERENT)");
        assert_eq!(format!("{:?}", Access::READ_WRITE), "Access(READ | WRITE)");
        assert_eq!(format!("{:?}", Access::from_bits_retain(0x41)), "Access(READ | 0x40)");
    }
}
