//! Record model: digests, request keys, metadata and bins.

pub mod bin;
pub mod digest;
pub mod entry;
pub mod metadata;

pub use bin::{Bin, Particle};
pub use digest::{Digest, RequestKey, DIGEST_SIZE, N_PARTITIONS};
pub use entry::{MutationGuard, Record};
pub use metadata::{EnterpriseMeta, MetadataSnapshot, RecordMetadata, ReplState};
