use std::fmt::Display;

use mailparse::{MailAddr, SingleInfo};
use serde::{Deserialize, Serialize, de};

use crate::error::AddressError;

/// A single validated RFC 5321 mailbox.
///
/// Group syntax and empty address lists are rejected at construction, so an
/// `Address` always names exactly one mailbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address(SingleInfo);

impl Address {
    /// Parse one mailbox, accepting both `user@example.com` and
    /// `Display Name <user@example.com>` forms.
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(AddressError::Empty);
        }

        let mut parsed = mailparse::addrparse(raw)
            .map_err(|err| AddressError::Invalid(raw.to_string(), err.to_string()))?;

        if parsed.is_empty() {
            return Err(AddressError::Empty);
        }

        match parsed.remove(0) {
            MailAddr::Single(info) => Ok(Self(info)),
            MailAddr::Group(_) => Err(AddressError::Group(raw.to_string())),
        }
    }

    /// The bare `local@domain` form, without any display name.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.0.addr
    }

    /// The part before the `@`, or the whole address when there is none.
    #[must_use]
    pub fn local_part(&self) -> &str {
        self.0
            .addr
            .rsplit_once('@')
            .map_or(self.0.addr.as_str(), |(local, _)| local)
    }

    /// The part after the last `@`, if any.
    #[must_use]
    pub fn domain(&self) -> Option<&str> {
        self.0.addr.rsplit_once('@').map(|(_, domain)| domain)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.addr)
    }
}

impl TryFrom<&str> for Address {
    type Error = AddressError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.address())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct Addr;

        impl de::Visitor<'_> for Addr {
            type Value = Address;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("an email address")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Address::parse(v)
                    .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(v), &Self))
            }
        }

        deserializer.deserialize_str(Addr)
    }
}
