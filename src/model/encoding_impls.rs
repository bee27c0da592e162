use crate::encoding::{Decode, Encode, EncodingError};

use super::{LoadId, RowsetId, RowsetMeta, TabletUid, Version};

impl Encode for Version {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.first.encode_to(buf)?;
        self.second.encode_to(buf)
    }
}

impl Decode for Version {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (first, n1) = i64::decode_from(buf)?;
        let (second, n2) = i64::decode_from(&buf[n1..])?;
        Ok((Version { first, second }, n1 + n2))
    }
}

impl Encode for RowsetMeta {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.rowset_id.0.encode_to(buf)?;
        self.tablet_id.encode_to(buf)?;
        self.tablet_uid.0.encode_to(buf)?;
        self.partition_id.encode_to(buf)?;
        self.txn_id.encode_to(buf)?;
        self.load_id.0.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.num_segments.encode_to(buf)?;
        self.num_rows.encode_to(buf)?;
        self.data_disk_size.encode_to(buf)?;
        self.creation_time.encode_to(buf)?;
        self.partial_update.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for RowsetMeta {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (rowset_id, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (tablet_id, n) = i64::decode_from(&buf[offset..])?;
        offset += n;
        let (tablet_uid, n) = u128::decode_from(&buf[offset..])?;
        offset += n;
        let (partition_id, n) = i64::decode_from(&buf[offset..])?;
        offset += n;
        let (txn_id, n) = i64::decode_from(&buf[offset..])?;
        offset += n;
        let (load_id, n) = u128::decode_from(&buf[offset..])?;
        offset += n;
        let (version, n) = Version::decode_from(&buf[offset..])?;
        offset += n;
        let (num_segments, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (num_rows, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (data_disk_size, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (creation_time, n) = i64::decode_from(&buf[offset..])?;
        offset += n;
        let (partial_update, n) = bool::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            RowsetMeta {
                rowset_id: RowsetId(rowset_id),
                tablet_id,
                tablet_uid: TabletUid(tablet_uid),
                partition_id,
                txn_id,
                load_id: LoadId(load_id),
                version,
                num_segments,
                num_rows,
                data_disk_size,
                creation_time,
                partial_update,
            },
            offset,
        ))
    }
}
