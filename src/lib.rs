pub mod tag;
pub mod crypto;
pub mod record;
pub mod catalog;
pub mod apdu;
pub mod trailer;
pub mod transport;
pub mod session;
pub mod provision;
pub mod config;

pub use tag::{KeyType, RawBlock, SectorKey, TagUid};
pub use crypto::{CodecKeys, CryptoError, KeyDeriver, PayloadCodec};
pub use record::{Field, RecordError, SpoolRecord};
pub use catalog::SpoolNames;
pub use transport::{CardTransport, SimulatedCard, TransportError};
pub use session::{AuthProcedure, KeyCandidateList, KeyMatch, SessionError, TagSession};
pub use provision::{
    ProvisionError, ReadOptions, SpoolReading, TagClass, TagProvisioner, WriteOptions,
    WriteOutcome, WritePlan, WriteStatus,
};
pub use config::{Config, ConfigError};
