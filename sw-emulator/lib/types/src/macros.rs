/*++

Licensed under the Apache-2.0 license.

File Name:

    macros.rs

Abstract:

    Macros shared by the emulator crates.

--*/

/// Declares a fieldless enum whose variants map onto literal values of an
/// integer type, plus a catch-all variant for values that map to nothing.
///
/// Conversions in both directions, `Display`, and a `VALID` list of every
/// variant except the catch-all are generated.
#[macro_export]
macro_rules! emu_enum {
    (
        $(#[$($enum_attrs:tt)*])*
        $vis:vis $enum_name:ident;
        $type:ty;
        {
            $(
                $(#[$($attrs:tt)*])*
                $name:ident = $value:literal,
            )*
        };
        $invalid:ident
    ) => {
        $(#[$($enum_attrs)*])*
        $vis enum $enum_name {
            $(
                $(#[$($attrs)*])*
                $name = $value,
            )*
            $invalid
        }

        impl $enum_name {
            /// Every variant that corresponds to a real value.
            pub const VALID: &'static [$enum_name] = &[$($enum_name::$name,)*];
        }

        impl From<$enum_name> for $type {
            fn from(val: $enum_name) -> $type {
                match val {
                    $($enum_name::$name => $value,)*
                    $enum_name::$invalid => panic!(
                        concat!(stringify!($enum_name), "::", stringify!($invalid), " has no value")
                    ),
                }
            }
        }

        impl From<$type> for $enum_name {
            fn from(val: $type) -> $enum_name {
                match val {
                    $($value => $enum_name::$name,)*
                    _ => $enum_name::$invalid,
                }
            }
        }

        impl std::fmt::Display for $enum_name {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                let name = match self {
                    $($enum_name::$name => stringify!($name),)*
                    $enum_name::$invalid => stringify!($invalid),
                };
                f.write_str(name)
            }
        }
    };
}
