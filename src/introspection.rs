//! Per-connection type-ID cache for field descriptors.
//!
//! Each TCP connection carries two independent registries: one for
//! descriptors received from the peer (incoming) and one for descriptors
//! this side has sent (outgoing). Once a descriptor has been assigned an
//! id, later messages reference it by id alone, avoiding repeated full
//! introspection payloads.
//!
//! Registries are mutated only on the task servicing their direction
//! (receive for incoming, send for outgoing), so a plain mutex suffices.

use std::collections::HashMap;

use crate::error::{ClientError, Result};
use crate::pvdata::FieldDesc;
use crate::wire::ByteBuf;

const TAG_NULL: u8 = 0xFF;
const TAG_ONLY_ID: u8 = 0xFE;
const TAG_FULL_WITH_ID: u8 = 0xFD;

/// Bidirectional descriptor cache keyed by a connection-scoped u16 id.
#[derive(Debug, Default)]
pub struct IntrospectionRegistry {
    by_id: HashMap<u16, FieldDesc>,
    ids: HashMap<FieldDesc, u16>,
    next_id: u16,
}

impl IntrospectionRegistry {
    pub fn new() -> Self {
        IntrospectionRegistry::default()
    }

    /// Serialize a descriptor, substituting an id reference when the peer
    /// has already seen it.
    pub fn serialize(&mut self, desc: &FieldDesc, buf: &mut ByteBuf) {
        if let Some(id) = self.ids.get(desc) {
            buf.put_u8(TAG_ONLY_ID);
            buf.put_u16(*id);
            return;
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.ids.insert(desc.clone(), id);
        self.by_id.insert(id, desc.clone());
        buf.put_u8(TAG_FULL_WITH_ID);
        buf.put_u16(id);
        desc.encode(buf);
    }

    /// Deserialize a descriptor reference; `None` for the null tag.
    pub fn deserialize(&mut self, buf: &mut ByteBuf) -> Result<Option<FieldDesc>> {
        match buf.get_u8()? {
            TAG_NULL => Ok(None),
            TAG_ONLY_ID => {
                let id = buf.get_u16()?;
                self.by_id.get(&id).cloned().map(Some).ok_or_else(|| {
                    ClientError::bad_stream(format!("reference to unknown type id {id}"))
                })
            }
            TAG_FULL_WITH_ID => {
                let id = buf.get_u16()?;
                let desc = FieldDesc::decode(buf)?;
                self.ids.insert(desc.clone(), id);
                self.by_id.insert(id, desc.clone());
                Ok(Some(desc))
            }
            t => Err(ClientError::bad_stream(format!(
                "bad introspection tag 0x{t:02x}"
            ))),
        }
    }

    /// Serialize the null descriptor tag.
    pub fn serialize_null(buf: &mut ByteBuf) {
        buf.put_u8(TAG_NULL);
    }

    /// Number of cached descriptors.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
