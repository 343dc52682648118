//! Declarative helpers for the static protocol tables.

/// Defines a `#[repr(u32)]` command enum together with code conversions.
macro_rules! define_command_type {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $code:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum $name {
            $($variant = $code),+
        }

        impl $name {
            /// Looks up a command by its wire code.
            pub fn from_u32(code: u32) -> Option<Self> {
                match code {
                    $($code => Some(Self::$variant),)+
                    _ => None,
                }
            }

            pub fn code(self) -> u32 {
                self as u32
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => stringify!($variant),)+
                }
            }
        }

        impl From<$name> for u32 {
            fn from(cmd: $name) -> u32 {
                cmd as u32
            }
        }
    };
}

/// Defines the protocol version enum with string and numeric forms.
macro_rules! define_version {
    ($($variant:ident = ($text:literal, $val:literal)),+ $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq)]
        pub enum Version {
            $($variant),+
        }

        impl Version {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Version::$variant => $text,)+
                }
            }

            pub fn as_bytes(&self) -> &'static [u8] {
                self.as_str().as_bytes()
            }

            pub fn val(&self) -> f32 {
                match self {
                    $(Version::$variant => $val,)+
                }
            }
        }

        impl std::str::FromStr for Version {
            type Err = crate::error::SessionError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s.trim() {
                    $($text => Ok(Version::$variant),)+
                    other => Err(crate::error::SessionError::Config(format!(
                        "unsupported protocol version '{}'",
                        other
                    ))),
                }
            }
        }

        impl std::fmt::Display for Version {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Defines numeric error codes and a lookup for their messages.
macro_rules! define_error_codes {
    ($($name:ident = $code:literal => $msg:literal),+ $(,)?) => {
        $(pub const $name: u32 = $code;)+

        /// Returns the human readable message for an error code.
        pub fn get_error_message(code: u32) -> &'static str {
            match code {
                $($code => $msg,)+
                _ => "Unknown Error",
            }
        }
    };
}
