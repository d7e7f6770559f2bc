use crate::types::Digest;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use commonware_codec::{EncodeSize, Error, FixedSize, Read, ReadExt, Write};
use commonware_cryptography::sha256::hash;

/// Block whose digest is the hash of its encoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub height: u64,
    pub parent: Digest,
    pub payload: Bytes,
    digest: Digest,
}

impl Block {
    pub fn new(height: u64, parent: Digest, payload: Bytes) -> Self {
        let mut buf = BytesMut::with_capacity(u64::SIZE + Digest::SIZE + payload.encode_size());
        height.write(&mut buf);
        parent.write(&mut buf);
        payload.write(&mut buf);
        Self {
            height,
            parent,
            payload,
            digest: hash(&buf),
        }
    }

    /// Block unique to the validator proposing it.
    pub fn for_validator(index: usize, height: u64, parent: Digest) -> Self {
        Self::new(height, parent, Bytes::from(format!("{index}:{height}")))
    }
}

impl crate::Block for Block {
    fn digest(&self) -> Digest {
        self.digest
    }

    fn parent(&self) -> Digest {
        self.parent
    }

    fn height(&self) -> u64 {
        self.height
    }
}

impl Write for Block {
    fn write(&self, buf: &mut impl BufMut) {
        self.height.write(buf);
        self.parent.write(buf);
        self.payload.write(buf);
    }
}

impl EncodeSize for Block {
    fn encode_size(&self) -> usize {
        u64::SIZE + Digest::SIZE + self.payload.encode_size()
    }
}

impl Read for Block {
    /// Maximum payload length.
    type Cfg = usize;

    fn read_cfg(buf: &mut impl Buf, max_payload: &usize) -> Result<Self, Error> {
        let height = u64::read(buf)?;
        let parent = Digest::read(buf)?;
        let payload = Bytes::read_cfg(buf, &(..=*max_payload).into())?;
        Ok(Self::new(height, parent, payload))
    }
}
