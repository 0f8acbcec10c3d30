// Room names: eight alphanumeric characters, shared out of band as the
// session key. Comparison is case-insensitive; names are stored
// uppercased so `abcd1234` and `ABCD1234` land in the same room.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ROOM_NAME_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomName(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomNameError {
    #[error("room name must be exactly {ROOM_NAME_LEN} characters, got {0}")]
    WrongLength(usize),
    #[error("room name may only contain ASCII letters and digits")]
    InvalidCharacter,
}

impl RoomName {
    pub fn parse(raw: &str) -> Result<Self, RoomNameError> {
        if raw.chars().count() != ROOM_NAME_LEN {
            return Err(RoomNameError::WrongLength(raw.chars().count()));
        }
        if !raw.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(RoomNameError::InvalidCharacter);
        }
        Ok(Self(raw.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RoomName {
    type Error = RoomNameError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<RoomName> for String {
    fn from(name: RoomName) -> Self {
        name.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names_parse_and_uppercase() {
        let name = RoomName::parse("abcd1234").expect("name should parse");
        assert_eq!(name.as_str(), "ABCD1234");
    }

    #[test]
    fn case_variants_are_the_same_room() {
        let lower = RoomName::parse("quiet42z").expect("lowercase should parse");
        let upper = RoomName::parse("QUIET42Z").expect("uppercase should parse");
        assert_eq!(lower, upper);
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert_eq!(RoomName::parse("short"), Err(RoomNameError::WrongLength(5)));
        assert_eq!(RoomName::parse("toolongname1"), Err(RoomNameError::WrongLength(12)));
        assert_eq!(RoomName::parse(""), Err(RoomNameError::WrongLength(0)));
    }

    #[test]
    fn non_alphanumeric_is_rejected() {
        assert_eq!(RoomName::parse("abc-1234"), Err(RoomNameError::InvalidCharacter));
        assert_eq!(RoomName::parse("abc 1234"), Err(RoomNameError::InvalidCharacter));
    }
}
