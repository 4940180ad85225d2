//! Transfer filters: reversible byte transforms applied to message
//! bodies, and the ordered pipe that chains them.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::status::Status;

/// The longest pipe the wire format can carry (a 1-byte count).
pub const MAX_PIPE_LEN: usize = 255;

/// Filter ID of the built-in gzip filter.
pub const GZIP: u8 = b'g';

/// A reversible byte transform.
///
/// `on_pack` runs on the send path, `on_unpack` on the receive path;
/// for any input `b`, `on_unpack(on_pack(b)) == b`.
pub trait XferFilter: Send + Sync {
    fn id(&self) -> u8;
    fn name(&self) -> &'static str;
    fn on_pack(&self, input: &[u8]) -> Result<Vec<u8>, Status>;
    fn on_unpack(&self, input: &[u8]) -> Result<Vec<u8>, Status>;
}

static FILTERS: RwLock<BTreeMap<u8, Arc<dyn XferFilter>>> = RwLock::new(BTreeMap::new());

/// Register a filter process-wide.
///
/// Registration is idempotent by ID: re-registering the same (id, name)
/// succeeds, while claiming an ID held by a different filter fails.
pub fn register(filter: Arc<dyn XferFilter>) -> Result<(), Status> {
    let mut filters = FILTERS.write();
    match filters.get(&filter.id()) {
        Some(existing) if existing.name() == filter.name() => Ok(()),
        Some(existing) => Err(Status::internal(format!(
            "xfer filter id {:#04x} already registered as {:?}",
            filter.id(),
            existing.name()
        ))),
        None => {
            filters.insert(filter.id(), filter);
            Ok(())
        }
    }
}

/// Look up a registered filter.
pub fn get(id: u8) -> Option<Arc<dyn XferFilter>> {
    FILTERS.read().get(&id).cloned()
}

/// An ordered list of filter IDs.
///
/// Senders apply the filters front to back; receivers reverse them back
/// to front.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XferPipe {
    ids: Vec<u8>,
}

impl XferPipe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter by ID.
    ///
    /// Fails if the filter is unregistered or the pipe is already at
    /// [`MAX_PIPE_LEN`].
    pub fn append(&mut self, id: u8) -> Result<(), Status> {
        if self.ids.len() >= MAX_PIPE_LEN {
            return Err(Status::xfer_error(format!(
                "transfer pipe longer than {MAX_PIPE_LEN}"
            )));
        }
        if get(id).is_none() {
            return Err(Status::xfer_error(format!(
                "unregistered transfer filter id {id:#04x}"
            )));
        }
        self.ids.push(id);
        Ok(())
    }

    /// Build a pipe from validated IDs.
    pub fn from_ids(ids: &[u8]) -> Result<Self, Status> {
        let mut pipe = Self::new();
        for &id in ids {
            pipe.append(id)?;
        }
        Ok(pipe)
    }

    /// Adopt IDs exactly as read off the wire, without a registration
    /// check; resolution happens at [`XferPipe::on_unpack`] time.
    pub fn from_wire(ids: &[u8]) -> Self {
        Self { ids: ids.to_vec() }
    }

    pub fn ids(&self) -> &[u8] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Apply every filter in order (send path).
    pub fn on_pack(&self, input: &[u8]) -> Result<Vec<u8>, Status> {
        let mut data = input.to_vec();
        for &id in &self.ids {
            let filter = get(id).ok_or_else(|| {
                Status::xfer_error(format!("unregistered transfer filter id {id:#04x}"))
            })?;
            data = filter.on_pack(&data)?;
        }
        Ok(data)
    }

    /// Reverse every filter in opposite order (receive path).
    ///
    /// An unknown ID here came off the wire, so it surfaces as a
    /// protocol error rather than a pipe error.
    pub fn on_unpack(&self, input: &[u8]) -> Result<Vec<u8>, Status> {
        let mut data = input.to_vec();
        for &id in self.ids.iter().rev() {
            let filter = get(id).ok_or_else(|| {
                Status::protocol_error(format!("unknown transfer filter id {id:#04x}"))
            })?;
            data = filter.on_unpack(&data)?;
        }
        Ok(data)
    }
}

/// Gzip transfer filter, conventionally registered at ID `b'g'`.
pub struct GzipFilter {
    level: u32,
}

impl GzipFilter {
    pub fn new(level: u32) -> Self {
        Self { level }
    }

    /// Register a gzip filter at [`GZIP`] with the default level.
    pub fn register() -> Result<(), Status> {
        register(Arc::new(GzipFilter::new(6)))
    }
}

impl XferFilter for GzipFilter {
    fn id(&self) -> u8 {
        GZIP
    }

    fn name(&self) -> &'static str {
        "gzip"
    }

    fn on_pack(&self, input: &[u8]) -> Result<Vec<u8>, Status> {
        let mut enc =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(self.level));
        enc.write_all(input).map_err(Status::xfer_error)?;
        enc.finish().map_err(Status::xfer_error)
    }

    fn on_unpack(&self, input: &[u8]) -> Result<Vec<u8>, Status> {
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(input)
            .read_to_end(&mut out)
            .map_err(Status::xfer_error)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_round_trip() {
        GzipFilter::register().unwrap();
        let mut pipe = XferPipe::new();
        pipe.append(GZIP).unwrap();

        let body = b"the quick brown fox jumps over the lazy dog".repeat(10);
        let packed = pipe.on_pack(&body).unwrap();
        assert_ne!(packed, body);
        assert!(packed.len() < body.len());
        assert_eq!(pipe.on_unpack(&packed).unwrap(), body);
    }

    #[test]
    fn duplicate_registration_rules() {
        GzipFilter::register().unwrap();
        // Same (id, name) pair: idempotent.
        GzipFilter::register().unwrap();

        struct Imposter;
        impl XferFilter for Imposter {
            fn id(&self) -> u8 {
                GZIP
            }
            fn name(&self) -> &'static str {
                "imposter"
            }
            fn on_pack(&self, input: &[u8]) -> Result<Vec<u8>, Status> {
                Ok(input.to_vec())
            }
            fn on_unpack(&self, input: &[u8]) -> Result<Vec<u8>, Status> {
                Ok(input.to_vec())
            }
        }
        assert!(register(Arc::new(Imposter)).is_err());
    }

    #[test]
    fn unknown_filter_is_a_protocol_error_on_unpack() {
        let pipe = XferPipe::from_wire(&[0xEE]);
        let err = pipe.on_unpack(b"x").unwrap_err();
        assert_eq!(err.code(), crate::status::code::PROTOCOL_ERROR);
    }

    #[test]
    fn append_rejects_unregistered_ids() {
        let mut pipe = XferPipe::new();
        assert!(pipe.append(0xEF).is_err());
    }
}
