//! Typed access to memory mapped debug and CTI registers.

/// A memory mapped register, for instance the ARMv8-A external debug registers (EDSCR, etc).
pub trait MemoryMappedRegister: Clone + From<u32> + Into<u32> + Sized + std::fmt::Debug {
    /// The register's offset from the component base address.
    const ADDRESS_OFFSET: u64;
    /// The register's name.
    const NAME: &'static str;
}

/// Defines a 32-bit register as a [`bitfield`] struct and implements [`MemoryMappedRegister`] for it.
///
/// The offset and name follow the struct declaration. `impl From;` additionally generates
/// conversions from and into `u32`.
#[macro_export]
macro_rules! memory_mapped_bitfield_register {
    (
        $(#[$outer:meta])*
        pub struct $name:ident(u32);
        $offset:expr, $reg_name:expr,
        impl From;
        $($rest:tt)*
    ) => {
        $crate::memory_mapped_bitfield_register! {
            $(#[$outer])*
            pub struct $name(u32);
            $offset, $reg_name,
            $($rest)*
        }

        impl From<u32> for $name {
            fn from(raw: u32) -> Self {
                $name(raw)
            }
        }

        impl From<$name> for u32 {
            fn from(register: $name) -> u32 {
                register.0
            }
        }
    };
    (
        $(#[$outer:meta])*
        pub struct $name:ident(u32);
        $offset:expr, $reg_name:expr,
        $($rest:tt)*
    ) => {
        bitfield::bitfield! {
            $(#[$outer])*
            #[derive(Copy, Clone, PartialEq, Eq)]
            pub struct $name(u32);
            impl Debug;
            $($rest)*
        }

        impl $crate::core::memory_mapped_registers::MemoryMappedRegister for $name {
            const ADDRESS_OFFSET: u64 = $offset;
            const NAME: &'static str = $reg_name;
        }
    };
}
