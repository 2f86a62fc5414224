//! The Tag object is an annotated tag: it names another object (usually a
//! commit, possibly another tag), carries a tagger identity and a message.
//! Peeling a tag chain walks `object` pointers until a non-tag is reached.

use std::fmt::Display;
use std::str::FromStr;

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};

use crate::{
    errors::GitError,
    hash::ObjectHash,
    internal::object::{ObjectTrait, signature::Signature, types::ObjectType},
};

#[derive(Eq, Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: ObjectHash,
    pub object_hash: ObjectHash,
    pub object_type: ObjectType,
    pub tag_name: String,
    pub tagger: Signature,
    pub message: String,
}

impl PartialEq for Tag {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "object {}", self.object_hash)?;
        writeln!(f, "type {}", self.object_type)?;
        writeln!(f, "tag {}", self.tag_name)?;
        writeln!(f, "tagger {}", self.tagger)?;
        writeln!(f, "{}", self.message)
    }
}

impl Tag {
    pub fn new(
        object_hash: ObjectHash,
        object_type: ObjectType,
        tag_name: String,
        tagger: Signature,
        message: String,
    ) -> Result<Tag, GitError> {
        let mut tag = Tag {
            id: ObjectHash::default(),
            object_hash,
            object_type,
            tag_name,
            tagger,
            message,
        };
        tag.id = ObjectHash::from_type_and_data(ObjectType::Tag, &tag.to_data()?);
        Ok(tag)
    }
}

impl ObjectTrait for Tag {
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, GitError> {
        let invalid = |what: &str| GitError::InvalidTagObject(what.to_string());

        /// Consume one `<prefix><value>\n` header line, yielding the value.
        fn header_line<'a>(rest: &mut &'a [u8], prefix: &[u8]) -> Option<&'a [u8]> {
            let cur: &'a [u8] = *rest;
            if !cur.starts_with(prefix) {
                return None;
            }
            let end = cur.find_byte(0x0a)?;
            *rest = &cur[end + 1..];
            Some(&cur[prefix.len()..end])
        }

        let mut rest = data;
        let object_hash = header_line(&mut rest, b"object ")
            .ok_or_else(|| invalid("missing object"))
            .and_then(|v| {
                ObjectHash::from_str(v.to_str().map_err(|_| invalid("object id"))?)
                    .map_err(|_| invalid("object id"))
            })?;
        let object_type = header_line(&mut rest, b"type ")
            .ok_or_else(|| invalid("missing type"))
            .and_then(|v| ObjectType::from_string(v.to_str().map_err(|_| invalid("type"))?))?;
        let tag_name = header_line(&mut rest, b"tag ")
            .ok_or_else(|| invalid("missing tag name"))?
            .to_str()
            .map_err(|_| invalid("tag name"))?
            .to_string();
        let tagger_line =
            header_line(&mut rest, b"tagger ").ok_or_else(|| invalid("missing tagger"))?;
        let mut full_tagger = b"tagger ".to_vec();
        full_tagger.extend(tagger_line);
        let tagger = Signature::from_data(full_tagger)?;

        // Skip the blank separator line if present
        if rest.first() == Some(&0x0a) {
            rest = &rest[1..];
        }
        let message = String::from_utf8_lossy(rest).to_string();

        Ok(Tag {
            id: hash,
            object_hash,
            object_type,
            tag_name,
            tagger,
            message,
        })
    }

    fn get_type(&self) -> ObjectType {
        ObjectType::Tag
    }

    fn get_size(&self) -> usize {
        0
    }

    fn to_data(&self) -> Result<Vec<u8>, GitError> {
        let mut data = Vec::new();
        data.extend(b"object ");
        data.extend(self.object_hash.to_string().as_bytes());
        data.extend(&[0x0a]);
        data.extend(b"type ");
        data.extend(self.object_type.to_string().as_bytes());
        data.extend(&[0x0a]);
        data.extend(b"tag ");
        data.extend(self.tag_name.as_bytes());
        data.extend(&[0x0a]);
        data.extend(self.tagger.to_data()?);
        data.extend(&[0x0a, 0x0a]);
        data.extend(self.message.as_bytes());
        Ok(data)
    }
}
