//! Object header, payload framing and split metadata

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::id::{Address, Checksum, ContainerId, ObjectId, OwnerId, SplitId};
use crate::error::{Error, Result};

/// Attribute carrying the MIME type of the payload
pub const CONTENT_TYPE_ATTRIBUTE: &str = "Content-Type";

// =============================================================================
// Object Type
// =============================================================================

/// Object type as seen by the storage core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectType {
    #[default]
    Regular,
    Tombstone,
    StorageGroup,
    Lock,
    Link,
}

impl ObjectType {
    /// Get the canonical name
    pub fn name(&self) -> &'static str {
        match self {
            ObjectType::Regular => "REGULAR",
            ObjectType::Tombstone => "TOMBSTONE",
            ObjectType::StorageGroup => "STORAGE_GROUP",
            ObjectType::Lock => "LOCK",
            ObjectType::Link => "LINK",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ObjectType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "REGULAR" => Ok(ObjectType::Regular),
            "TOMBSTONE" => Ok(ObjectType::Tombstone),
            "STORAGE_GROUP" => Ok(ObjectType::StorageGroup),
            "LOCK" => Ok(ObjectType::Lock),
            "LINK" => Ok(ObjectType::Link),
            other => Err(Error::InvalidAddress(format!("unknown object type {}", other))),
        }
    }
}

/// Key/value attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub key: String,
    pub value: String,
}

impl Attribute {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

// =============================================================================
// Split Metadata
// =============================================================================

/// Split relations carried by a part of a multi-part object.
///
/// V1 chains share a `split_id`; V2 chains reference their first part through
/// `first_id`. The last part and the link object carry the full parent header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<ObjectId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<Header>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<ObjectId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_id: Option<SplitId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_id: Option<ObjectId>,

    /// Children list, set on link objects only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ObjectId>,
}

/// What is known about a split chain when its parent is requested.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_id: Option<SplitId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_part: Option<ObjectId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<ObjectId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_part: Option<ObjectId>,
}

impl SplitInfo {
    /// Fill in whatever `other` knows and `self` does not
    pub fn merge(&mut self, other: &SplitInfo) {
        if self.split_id.is_none() {
            self.split_id = other.split_id;
        }
        if self.last_part.is_none() {
            self.last_part = other.last_part;
        }
        if self.link.is_none() {
            self.link = other.link;
        }
        if self.first_part.is_none() {
            self.first_part = other.first_part;
        }
    }

    /// Both the last part and the link are known
    pub fn is_complete(&self) -> bool {
        self.last_part.is_some() && self.link.is_some()
    }
}

impl fmt::Display for SplitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |id: &Option<ObjectId>| id.map(|i| i.to_string()).unwrap_or_else(|| "-".into());
        write!(
            f,
            "split_id={} last={} link={} first={}",
            self.split_id
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".into()),
            show(&self.last_part),
            show(&self.link),
            show(&self.first_part)
        )
    }
}

// =============================================================================
// Header
// =============================================================================

/// Object header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub id: ObjectId,
    pub container: ContainerId,
    pub owner: OwnerId,
    pub object_type: ObjectType,
    pub creation_epoch: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_epoch: Option<u64>,

    pub payload_size: u64,
    pub payload_hash: Checksum,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<Attribute>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split: Option<SplitHeader>,
}

impl Header {
    pub fn address(&self) -> Address {
        Address::new(self.container, self.id)
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.key == key)
            .map(|a| a.value.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.attribute(CONTENT_TYPE_ATTRIBUTE)
    }

    /// Expired objects have an expiration epoch strictly below `epoch`.
    pub fn is_expired(&self, epoch: u64) -> bool {
        matches!(self.expiration_epoch, Some(exp) if exp < epoch)
    }

    /// Parent ID, taken from the split header or the embedded parent
    pub fn parent_id(&self) -> Option<ObjectId> {
        let split = self.split.as_ref()?;
        split.parent_id.or_else(|| split.parent.as_ref().map(|p| p.id))
    }

    /// Full parent header, if this part carries one
    pub fn parent(&self) -> Option<&Header> {
        self.split.as_ref()?.parent.as_deref()
    }

    pub fn split_id(&self) -> Option<SplitId> {
        self.split.as_ref()?.split_id
    }

    pub fn first_id(&self) -> Option<ObjectId> {
        self.split.as_ref()?.first_id
    }

    pub fn children(&self) -> &[ObjectId] {
        self.split
            .as_ref()
            .map(|s| s.children.as_slice())
            .unwrap_or(&[])
    }

    /// Root objects are user-visible: they are not part of a split chain
    pub fn is_root(&self) -> bool {
        self.parent_id().is_none()
    }

    /// Link objects describe the whole chain (V2 type, or V1 children list)
    pub fn is_link(&self) -> bool {
        self.object_type == ObjectType::Link || !self.children().is_empty()
    }

    /// Identifier derived from every header field except the ID itself.
    pub fn compute_id(&self) -> ObjectId {
        let mut h = Sha256::new();
        h.update(self.container.as_bytes());
        h.update(self.owner.as_bytes());
        h.update(self.object_type.name().as_bytes());
        h.update(self.creation_epoch.to_be_bytes());
        h.update(self.expiration_epoch.unwrap_or(u64::MAX).to_be_bytes());
        h.update(self.payload_size.to_be_bytes());
        h.update(self.payload_hash.as_bytes());
        for attr in &self.attributes {
            h.update((attr.key.len() as u32).to_be_bytes());
            h.update(attr.key.as_bytes());
            h.update((attr.value.len() as u32).to_be_bytes());
            h.update(attr.value.as_bytes());
        }
        if let Some(split) = &self.split {
            if let Some(id) = split.parent_id.or_else(|| split.parent.as_ref().map(|p| p.id)) {
                h.update(b"parent");
                h.update(id.as_bytes());
            }
            if let Some(prev) = &split.previous {
                h.update(b"previous");
                h.update(prev.as_bytes());
            }
            if let Some(sid) = &split.split_id {
                h.update(b"split");
                h.update(sid.as_bytes());
            }
            if let Some(first) = &split.first_id {
                h.update(b"first");
                h.update(first.as_bytes());
            }
            for child in &split.children {
                h.update(child.as_bytes());
            }
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&h.finalize());
        ObjectId::new(out)
    }
}

// =============================================================================
// Object
// =============================================================================

/// Header plus payload.
///
/// The stored form is `u32 LE header length || header JSON || payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    pub header: Header,
    pub payload: Bytes,
}

impl Object {
    /// Start building an object in `container`
    pub fn builder(container: ContainerId) -> ObjectBuilder {
        ObjectBuilder::new(container)
    }

    pub fn address(&self) -> Address {
        self.header.address()
    }

    pub fn id(&self) -> ObjectId {
        self.header.id
    }

    pub fn object_type(&self) -> ObjectType {
        self.header.object_type
    }

    /// Serialize into the stored framing
    pub fn encode(&self) -> Result<Bytes> {
        let header = serde_json::to_vec(&self.header)?;
        let mut buf = BytesMut::with_capacity(4 + header.len() + self.payload.len());
        buf.put_u32_le(header.len() as u32);
        buf.put_slice(&header);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Parse the stored framing, checking the declared payload size
    pub fn decode(mut data: Bytes) -> Result<Object> {
        let header = Self::split_header(&mut data)?;
        if header.payload_size != data.len() as u64 {
            return Err(Error::Corrupted(format!(
                "payload size mismatch for {}: header says {}, got {}",
                header.address(),
                header.payload_size,
                data.len()
            )));
        }
        Ok(Object {
            header,
            payload: data,
        })
    }

    /// Parse only the header part of the stored framing
    pub fn decode_header(data: &[u8]) -> Result<Header> {
        let mut data = Bytes::copy_from_slice(data);
        Self::split_header(&mut data)
    }

    fn split_header(data: &mut Bytes) -> Result<Header> {
        if data.len() < 4 {
            return Err(Error::Corrupted("object frame too short".into()));
        }
        let len = data.get_u32_le() as usize;
        if data.len() < len {
            return Err(Error::Corrupted(format!(
                "object header truncated: need {}, have {}",
                len,
                data.len()
            )));
        }
        let header_bytes = data.split_to(len);
        Ok(serde_json::from_slice(&header_bytes)?)
    }
}

/// Builder sealing an object: payload size, checksum and ID are computed.
#[derive(Debug, Clone)]
pub struct ObjectBuilder {
    header: Header,
    payload: Bytes,
    explicit_id: Option<ObjectId>,
}

impl ObjectBuilder {
    fn new(container: ContainerId) -> Self {
        Self {
            header: Header {
                id: ObjectId::default(),
                container,
                owner: OwnerId::default(),
                object_type: ObjectType::Regular,
                creation_epoch: 0,
                expiration_epoch: None,
                payload_size: 0,
                payload_hash: Checksum::default(),
                attributes: Vec::new(),
                split: None,
            },
            payload: Bytes::new(),
            explicit_id: None,
        }
    }

    pub fn owner(mut self, owner: OwnerId) -> Self {
        self.header.owner = owner;
        self
    }

    pub fn object_type(mut self, object_type: ObjectType) -> Self {
        self.header.object_type = object_type;
        self
    }

    pub fn creation_epoch(mut self, epoch: u64) -> Self {
        self.header.creation_epoch = epoch;
        self
    }

    pub fn expiration_epoch(mut self, epoch: u64) -> Self {
        self.header.expiration_epoch = Some(epoch);
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.attributes.push(Attribute::new(key, value));
        self
    }

    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn split(mut self, split: SplitHeader) -> Self {
        self.header.split = Some(split);
        self
    }

    /// Force the object ID instead of deriving it
    pub fn id(mut self, id: ObjectId) -> Self {
        self.explicit_id = Some(id);
        self
    }

    pub fn build(mut self) -> Object {
        self.header.payload_size = self.payload.len() as u64;
        self.header.payload_hash = Checksum::digest(&self.payload);
        self.header.id = self
            .explicit_id
            .unwrap_or_else(|| self.header.compute_id());
        Object {
            header: self.header,
            payload: self.payload,
        }
    }
}

// =============================================================================
// Typed Payloads
// =============================================================================

/// Payload of a tombstone object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub members: Vec<ObjectId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_id: Option<SplitId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_epoch: Option<u64>,
}

impl Tombstone {
    pub fn new(members: Vec<ObjectId>) -> Self {
        Self {
            members,
            ..Default::default()
        }
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn to_payload(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// Payload of a lock object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockPayload {
    pub members: Vec<ObjectId>,
}

impl LockPayload {
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn to_payload(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}
