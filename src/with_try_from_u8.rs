/// Derives, for a fieldless `#[repr(u8)]` enum:
///
///  - a [TryFrom<u8>] implementation,
///  - a `name()` method returning the variant's identifier,
///  - a `COUNT` constant with the number of variants.
///
/// Macro adapted from: <https://stackoverflow.com/a/57578431/6626414>
///
/// ```
/// joker::with_try_from_u8! {
///     #[repr(u8)]
///     #[derive(Debug, Clone, Copy, PartialEq)]
///     enum Direction {
///         Left,
///         Right,
///     }
/// }
///
/// assert_eq!(Ok(Direction::Right), Direction::try_from(1));
/// assert_eq!(Err(()), Direction::try_from(2));
/// assert_eq!("Left", Direction::Left.name());
/// assert_eq!(2, Direction::COUNT);
/// ```
#[macro_export]
macro_rules! with_try_from_u8 {
    ($(#[$meta:meta])* $vis:vis enum $name:ident {
        // match each variant in the enum
        $($(#[$vmeta:meta])* $vname:ident $(= $val:expr)?,)*
    }) => {
        // create the enum
        $(#[$meta])*
        $vis enum $name {
            // Create each variant, verbatim
            $($(#[$vmeta])* $vname $(= $val)?,)*
        }

        #[allow(dead_code)]
        impl $name {
            /// How many variants this enum has.
            pub const COUNT: usize = [$(stringify!($vname)),*].len();

            /// The identifier of this variant, as written in the source.
            pub fn name(self) -> &'static str {
                match self {
                    $($name::$vname => stringify!($vname),)*
                }
            }
        }

        // create the TryFrom implementation:
        impl std::convert::TryFrom<u8> for $name {
            type Error = ();

            fn try_from(v: u8) -> Result<Self, Self::Error> {
                match v {
                    // create a match arm for each variant:
                    $(x if x == $name::$vname as u8 => Ok($name::$vname),)*
                    _ => Err(()),
                }
            }
        }
    }
}
