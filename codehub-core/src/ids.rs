//! Opaque, lexicographically sortable ids.
//!
//! The spec calls for a 26-char opaque id with lexicographic ordering. We
//! derive one from a UUIDv7 (already time-ordered at the bit level) encoded
//! as Crockford base32 -- the same encoding ULID uses, without depending on
//! a ulid-specific crate. See DESIGN.md for why.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

const CROCKFORD_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

fn encode_crockford(bytes: [u8; 16]) -> String {
    // 128 bits -> 26 base32 characters (130 bits, top 2 bits of the first
    // character are always zero), matching ULID's layout.
    let mut value: u128 = u128::from_be_bytes(bytes);
    let mut chars = [0u8; 26];
    for slot in chars.iter_mut().rev() {
        let idx = (value & 0x1f) as usize;
        *slot = CROCKFORD_ALPHABET[idx];
        value >>= 5;
    }
    String::from_utf8(chars.to_vec()).expect("crockford alphabet is ASCII")
}

fn decode_crockford(s: &str) -> Option<[u8; 16]> {
    if s.len() != 26 {
        return None;
    }
    let mut value: u128 = 0;
    for c in s.bytes() {
        let digit = match c {
            b'0'..=b'9' => c - b'0',
            b'A'..=b'H' | b'a'..=b'h' => c.to_ascii_uppercase() - b'A' + 10,
            b'J' | b'j' => 18,
            b'K' | b'k' => 19,
            b'M' | b'm' => 20,
            b'N' | b'n' => 21,
            b'P' | b'p' => 22,
            b'Q' | b'q' => 23,
            b'R' | b'r' => 24,
            b'S' | b's' => 25,
            b'T' | b't' => 26,
            b'V' | b'v' => 27,
            b'W' | b'w' => 28,
            b'X' | b'x' => 29,
            b'Y' | b'y' => 30,
            b'Z' | b'z' => 31,
            _ => return None,
        };
        value = (value << 5) | u128::from(digit);
    }
    Some(value.to_be_bytes())
}

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(into = "String", try_from = "String")]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", encode_crockford(*self.0.as_bytes()))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                let bytes = decode_crockford(s).ok_or(ParseIdError)?;
                Ok(Self(Uuid::from_bytes(bytes)))
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.to_string()
            }
        }

        impl TryFrom<String> for $name {
            type Error = ParseIdError;

            fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
                s.parse()
            }
        }

        impl sqlx::Type<sqlx::Postgres> for $name {
            fn type_info() -> sqlx::postgres::PgTypeInfo {
                <Uuid as sqlx::Type<sqlx::Postgres>>::type_info()
            }
        }

        impl sqlx::Encode<'_, sqlx::Postgres> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut sqlx::postgres::PgArgumentBuffer,
            ) -> std::result::Result<
                sqlx::encode::IsNull,
                Box<dyn std::error::Error + Send + Sync>,
            > {
                <Uuid as sqlx::Encode<sqlx::Postgres>>::encode_by_ref(&self.0, buf)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Postgres> for $name {
            fn decode(
                value: sqlx::postgres::PgValueRef<'r>,
            ) -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
                Ok(Self(<Uuid as sqlx::Decode<sqlx::Postgres>>::decode(value)?))
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseIdError;

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid opaque id")
    }
}

impl std::error::Error for ParseIdError {}

opaque_id!(WorkspaceId);
opaque_id!(UserId);
opaque_id!(SessionId);
opaque_id!(OpId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_display_and_parse() {
        let id = WorkspaceId::new();
        let s = id.to_string();
        assert_eq!(s.len(), 26);
        let parsed: WorkspaceId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn preserves_uuid_v7_lexicographic_time_order() {
        let a = WorkspaceId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = WorkspaceId::new();
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn rejects_wrong_length() {
        assert!("TOOSHORT".parse::<WorkspaceId>().is_err());
    }
}
