//! Author/committer/tagger identity lines as they appear inside commit and
//! tag objects: `<role> <name> <<email>> <timestamp> <timezone>`.

use std::fmt::Display;

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};

use crate::errors::GitError;

/// The role prefix of a signature line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureType {
    Author,
    Committer,
    Tagger,
}

impl Display for SignatureType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SignatureType::Author => write!(f, "author"),
            SignatureType::Committer => write!(f, "committer"),
            SignatureType::Tagger => write!(f, "tagger"),
        }
    }
}

impl SignatureType {
    pub fn from_data(data: &[u8]) -> Result<SignatureType, GitError> {
        match data {
            b"author" => Ok(SignatureType::Author),
            b"committer" => Ok(SignatureType::Committer),
            b"tagger" => Ok(SignatureType::Tagger),
            _ => Err(GitError::InvalidSignatureType(
                String::from_utf8_lossy(data).to_string(),
            )),
        }
    }
}

/// One identity line of a commit or tag object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub signature_type: SignatureType,
    pub name: String,
    pub email: String,
    pub timestamp: i64,
    pub timezone: String,
}

impl Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} <{}> {} {}",
            self.name, self.email, self.timestamp, self.timezone
        )
    }
}

impl Signature {
    /// Build a signature stamped with the current time in UTC.
    pub fn now(
        signature_type: SignatureType,
        name: impl Into<String>,
        email: impl Into<String>,
    ) -> Signature {
        Signature {
            signature_type,
            name: name.into(),
            email: email.into(),
            timestamp: chrono::Utc::now().timestamp(),
            timezone: "+0000".to_string(),
        }
    }

    /// Parse a full signature line, e.g.
    /// `author benjamin <benjamin@example.com> 1757467768 +0800`.
    pub fn from_data(data: Vec<u8>) -> Result<Signature, GitError> {
        let invalid = || GitError::InvalidSignatureType(String::from_utf8_lossy(&data).to_string());

        let type_end = data.find_byte(b' ').ok_or_else(invalid)?;
        let signature_type = SignatureType::from_data(&data[..type_end])?;
        let rest = &data[type_end + 1..];

        let email_open = rest.find_byte(b'<').ok_or_else(invalid)?;
        let email_close = rest.find_byte(b'>').ok_or_else(invalid)?;
        if email_close < email_open {
            return Err(invalid());
        }
        let name = rest[..email_open]
            .trim_with(|c| c == ' ')
            .to_str()
            .map_err(|_| invalid())?
            .to_string();
        let email = rest[email_open + 1..email_close]
            .to_str()
            .map_err(|_| invalid())?
            .to_string();

        let tail = rest[email_close + 1..].trim_with(|c| c == ' ');
        let mut parts = tail.splitn_str(2, b" ");
        let timestamp = parts
            .next()
            .and_then(|p| p.to_str().ok())
            .and_then(|p| p.parse::<i64>().ok())
            .ok_or_else(invalid)?;
        let timezone = parts
            .next()
            .and_then(|p| p.to_str().ok())
            .unwrap_or("+0000")
            .to_string();

        Ok(Signature {
            signature_type,
            name,
            email,
            timestamp,
            timezone,
        })
    }

    /// Serialize back into the full line including the role prefix.
    pub fn to_data(&self) -> Result<Vec<u8>, GitError> {
        Ok(format!(
            "{} {} <{}> {} {}",
            self.signature_type, self.name, self.email, self.timestamp, self.timezone
        )
        .into_bytes())
    }
}
