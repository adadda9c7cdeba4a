//! Macro for implementing Display and FromStr for wire-format enums
//!
//! Status and priority enums are persisted as lowercase strings (SQLite rows,
//! JSON config files). This macro keeps the two directions in one place.
//!
//! # Example
//!
//! ```rust
//! use netguard_domain::impl_wire_conversions;
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq)]
//! pub enum Lane {
//!     Fast,
//!     Slow,
//! }
//!
//! impl_wire_conversions!(Lane {
//!     Fast => "fast",
//!     Slow => "slow",
//! });
//!
//! assert_eq!(Lane::Fast.to_string(), "fast");
//! assert_eq!("SLOW".parse::<Lane>().unwrap(), Lane::Slow);
//! ```

/// Implements `Display` and `FromStr` for a fieldless enum.
///
/// Parsing is case-insensitive; the wire strings must be lowercase.
#[macro_export]
macro_rules! impl_wire_conversions {
    ($enum_name:ident { $($variant:ident => $str:expr),+ $(,)? }) => {
        impl $enum_name {
            /// Stable lowercase representation used on the wire and in storage.
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $str,)+
                }
            }
        }

        impl ::std::fmt::Display for $enum_name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::std::str::FromStr for $enum_name {
            type Err = ::std::string::String;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                match s.to_lowercase().as_str() {
                    $($str => ::std::result::Result::Ok(Self::$variant),)+
                    _ => ::std::result::Result::Err(::std::format!("Invalid {}: {}", stringify!($enum_name), s)),
                }
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Phase {
        Warm,
        HalfOpen,
    }

    impl_wire_conversions!(Phase {
        Warm => "warm",
        HalfOpen => "half-open",
    });

    #[test]
    fn display_uses_wire_string() {
        assert_eq!(Phase::Warm.to_string(), "warm");
        assert_eq!(Phase::HalfOpen.to_string(), "half-open");
        assert_eq!(Phase::HalfOpen.as_str(), "half-open");
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(Phase::from_str("WARM").unwrap(), Phase::Warm);
        assert_eq!(Phase::from_str("Half-Open").unwrap(), Phase::HalfOpen);
    }

    #[test]
    fn parse_rejects_unknown_values() {
        let err = Phase::from_str("cold").unwrap_err();
        assert!(err.contains("Invalid Phase: cold"));
        assert!(Phase::from_str("").is_err());
    }

    /// Expands next to the crate's one-parameter `Result` alias, the way the
    /// domain type modules use it.
    mod with_result_alias {
        #[allow(unused_imports)]
        use crate::errors::Result;

        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        enum Lane {
            Fast,
            Slow,
        }

        impl_wire_conversions!(Lane {
            Fast => "fast",
            Slow => "slow",
        });

        #[test]
        fn expands_with_crate_result_alias_in_scope() {
            assert_eq!("slow".parse::<Lane>(), Ok(Lane::Slow));
            assert_eq!(Lane::Fast.to_string(), "fast");
            assert!("medium".parse::<Lane>().is_err());
        }
    }
}
