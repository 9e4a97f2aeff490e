/// Trait for types having a constant default value. This is essentially a
/// constant version of `Default`.
pub trait Init {
    /// The default value.
    const INIT: Self;
}

impl<T> Init for Option<T> {
    const INIT: Self = None;
}

impl<T, const N: usize> Init for arrayvec::ArrayVec<T, N> {
    const INIT: Self = Self::new_const();
}

macro_rules! impl_init {
    (
        $(
            $( #[$meta:meta] )*
            $ty:ty => $value:expr,
        )*
    ) => {
        $(
            $( #[$meta] )*
            impl Init for $ty {
                const INIT: Self = $value;
            }
        )*
    };
}

impl_init! {
    bool => false,
    u8 => 0,
    u16 => 0,
    u32 => 0,
    u64 => 0,
    usize => 0,
    () => (),
}
