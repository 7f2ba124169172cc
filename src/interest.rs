use std::num::NonZeroU8;
use std::{fmt, ops};

/// Readiness interest a [`Channel`] registers with its poller.
///
/// Non-empty by construction; "no interest at all" is represented by
/// `Option<Interest>` (same size, the niche is the zero bit pattern).
///
/// [`Channel`]: crate::channel::Channel
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Interest(NonZeroU8);

const READABLE: u8 = 0b01;
const WRITABLE: u8 = 0b10;

impl Interest {
    /// Interest in read readiness.
    pub const READABLE: Interest = Interest(unsafe { NonZeroU8::new_unchecked(READABLE) });

    /// Interest in write readiness.
    pub const WRITABLE: Interest = Interest(unsafe { NonZeroU8::new_unchecked(WRITABLE) });

    /// Add together two `Interest`s. Same as the `BitOr` implementation,
    /// but usable in constant context.
    #[allow(clippy::should_implement_trait)]
    pub const fn add(self, other: Interest) -> Interest {
        Interest(unsafe { NonZeroU8::new_unchecked(self.0.get() | other.0.get()) })
    }

    /// Remove `other` from `self`, `None` if nothing is left.
    pub fn remove(self, other: Interest) -> Option<Interest> {
        NonZeroU8::new(self.0.get() & !other.0.get()).map(Interest)
    }

    pub const fn is_readable(self) -> bool {
        (self.0.get() & READABLE) != 0
    }

    pub const fn is_writable(self) -> bool {
        (self.0.get() & WRITABLE) != 0
    }

    pub(crate) const fn as_u8(self) -> u8 {
        self.0.get()
    }

    pub(crate) fn from_u8(bits: u8) -> Option<Interest> {
        NonZeroU8::new(bits).map(Interest)
    }
}

impl ops::BitOr for Interest {
    type Output = Self;

    #[inline]
    fn bitor(self, other: Self) -> Self {
        self.add(other)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        if self.is_readable() {
            write!(fmt, "READABLE")?;
            one = true;
        }
        if self.is_writable() {
            if one {
                write!(fmt, " | ")?;
            }
            write!(fmt, "WRITABLE")?;
            one = true;
        }
        debug_assert!(one, "printing empty interest");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Interest;

    #[test]
    fn add_and_remove() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.is_readable());
        assert!(both.is_writable());

        let read_only = both.remove(Interest::WRITABLE).unwrap();
        assert!(read_only.is_readable());
        assert!(!read_only.is_writable());

        assert_eq!(read_only.remove(Interest::READABLE), None);
    }

    #[test]
    fn niche_size() {
        assert_eq!(
            std::mem::size_of::<Option<Interest>>(),
            std::mem::size_of::<Interest>()
        );
    }
}
