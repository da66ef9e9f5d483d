//! Region descriptors and bootstrap metadata layout.
//!
//! The root and meta tables are ordinary tables of this engine: root rows
//! describe meta regions, meta rows describe user-table regions. Each
//! metadata row carries a serialized [`RegionInfo`] under
//! [`COL_REGION_INFO`] and the owning server's address under [`COL_SERVER`].

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Table name of the single root region.
pub const ROOT_TABLE_NAME: &[u8] = b"-ROOT-";
/// Table name of the meta regions discovered by scanning root.
pub const META_TABLE_NAME: &[u8] = b".META.";

/// Column family scanned during region resolution.
pub const META_COLUMN_FAMILY: &str = "info:";
/// Serialized region descriptor column.
pub const COL_REGION_INFO: &[u8] = b"info:regioninfo";
/// Owning server address column.
pub const COL_SERVER: &[u8] = b"info:server";

#[derive(Debug, thiserror::Error)]
pub enum RegionError {
    #[error("corrupt region descriptor: {0}")]
    CorruptDescriptor(#[from] bincode::Error),

    #[error("unparseable server address {address:?}")]
    BadServerAddress { address: String },
}

/// Schema-level description of a table: its name and column families.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: Bytes,
    pub families: Vec<Bytes>,
}

impl TableDescriptor {
    pub fn new(name: impl Into<Bytes>, families: Vec<Bytes>) -> Self {
        Self {
            name: name.into(),
            families,
        }
    }
}

/// Descriptor of one region: a contiguous row range of a table, owned by
/// exactly one server at a time. `start_key` is inclusive; an empty start
/// key marks the table's first region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionInfo {
    pub table: TableDescriptor,
    pub start_key: Bytes,
    pub region_name: Bytes,
}

impl RegionInfo {
    pub fn new(table: TableDescriptor, start_key: impl Into<Bytes>) -> Self {
        let start_key = start_key.into();
        let mut region_name = Vec::with_capacity(table.name.len() + start_key.len() + 1);
        region_name.extend_from_slice(&table.name);
        region_name.push(b',');
        region_name.extend_from_slice(&start_key);
        Self {
            table,
            start_key,
            region_name: region_name.into(),
        }
    }

    /// The well-known descriptor of the single root region.
    pub fn root() -> Self {
        Self::new(
            TableDescriptor::new(ROOT_TABLE_NAME, vec![Bytes::from_static(b"info:")]),
            Bytes::new(),
        )
    }

    /// The descriptor of the first meta region.
    pub fn first_meta() -> Self {
        Self::new(
            TableDescriptor::new(META_TABLE_NAME, vec![Bytes::from_static(b"info:")]),
            Bytes::new(),
        )
    }

    pub fn encode(&self) -> Result<Bytes, RegionError> {
        Ok(bincode::serialize(self)?.into())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RegionError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// `host:port` address of a region server or master.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn parse(address: &str) -> Result<Self, RegionError> {
        let bad = || RegionError::BadServerAddress {
            address: address.to_owned(),
        };
        let (host, port) = address.rsplit_once(':').ok_or_else(bad)?;
        if host.is_empty() {
            return Err(bad());
        }
        let port = port.parse().map_err(|_| bad())?;
        Ok(Self {
            host: host.to_owned(),
            port,
        })
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_descriptor_round_trips() {
        let info = RegionInfo::new(
            TableDescriptor::new(&b"orders"[..], vec![Bytes::from_static(b"cf:")]),
            &b"m"[..],
        );
        let encoded = info.encode().unwrap();
        let decoded = RegionInfo::decode(&encoded).unwrap();
        assert_eq!(decoded, info);
        assert_eq!(decoded.region_name.as_ref(), b"orders,m");
    }

    #[test]
    fn corrupt_descriptor_is_an_error() {
        assert!(matches!(
            RegionInfo::decode(b"\xff\xff garbage"),
            Err(RegionError::CorruptDescriptor(_))
        ));
    }

    #[test]
    fn server_address_parses_and_displays() {
        let addr = ServerAddress::parse("node1:7020").unwrap();
        assert_eq!(addr, ServerAddress::new("node1", 7020));
        assert_eq!(addr.to_string(), "node1:7020");

        assert!(ServerAddress::parse("noport").is_err());
        assert!(ServerAddress::parse(":7020").is_err());
        assert!(ServerAddress::parse("host:notaport").is_err());
    }
}
