use core::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::address::Address;

/// Body transfer encoding declared via the `BODY` MAIL parameter.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BodyType {
    #[default]
    SevenBit,
    EightBitMime,
    BinaryMime,
}

impl Display for BodyType {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(match self {
            Self::SevenBit => "7BIT",
            Self::EightBitMime => "8BITMIME",
            Self::BinaryMime => "BINARYMIME",
        })
    }
}

/// The envelope of one mail transaction: reverse-path, forward-paths and the
/// MAIL parameters that shape body reception.
///
/// A `None` sender is the null reverse-path (`<>`), used for bounces.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Envelope {
    sender: Option<Address>,
    recipients: Vec<Address>,
    declared_size: Option<usize>,
    body_type: BodyType,
    utf8: bool,
}

impl Envelope {
    #[must_use]
    pub fn new(sender: Option<Address>) -> Self {
        Self {
            sender,
            ..Self::default()
        }
    }

    #[inline]
    pub const fn sender(&self) -> Option<&Address> {
        self.sender.as_ref()
    }

    #[inline]
    pub fn recipients(&self) -> &[Address] {
        &self.recipients
    }

    pub fn push_recipient(&mut self, recipient: Address) {
        self.recipients.push(recipient);
    }

    #[inline]
    pub const fn declared_size(&self) -> Option<usize> {
        self.declared_size
    }

    pub const fn set_declared_size(&mut self, size: usize) {
        self.declared_size = Some(size);
    }

    #[inline]
    pub const fn body_type(&self) -> BodyType {
        self.body_type
    }

    pub const fn set_body_type(&mut self, body_type: BodyType) {
        self.body_type = body_type;
    }

    /// Whether the client requested SMTPUTF8 handling for this transaction.
    #[inline]
    pub const fn is_utf8(&self) -> bool {
        self.utf8
    }

    pub const fn set_utf8(&mut self, utf8: bool) {
        self.utf8 = utf8;
    }
}
