/// Declares a closed set of AMI field names.
///
/// Expands to the enum itself plus an `ALL` table, `as_str()`, `Display`,
/// `AsRef<str>` and a case-insensitive `FromStr` (AMI matches keys without
/// regard to case). The parse error must be a newtype over `String`.
///
/// ```ignore
/// define_field_enum! {
///     error_type: ParseThingError,
///     pub enum Thing {
///         First => "First",
///         SecondId => "SecondID",
///     }
/// }
/// ```
macro_rules! define_field_enum {
    (
        error_type: $Err:ident,
        $(#[$meta:meta])*
        $vis:vis enum $Name:ident {
            $( $variant:ident => $wire:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[non_exhaustive]
        #[allow(missing_docs)]
        $vis enum $Name {
            $( $variant, )+
        }

        impl $Name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$Name] = &[ $( $Name::$variant, )+ ];

            /// Field name as written on the wire.
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $( $Name::$variant => $wire, )+
                }
            }
        }

        impl std::fmt::Display for $Name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl AsRef<str> for $Name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl std::str::FromStr for $Name {
            type Err = $Err;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $Name::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str().eq_ignore_ascii_case(s))
                    .ok_or_else(|| $Err(s.to_string()))
            }
        }
    };
}
