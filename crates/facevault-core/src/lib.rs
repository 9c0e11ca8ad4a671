//! facevault-core — Identity records, face descriptors, and the match decision.
//!
//! Pure data types shared by the store, the daemon and the CLI. Nothing in
//! this crate performs I/O.

pub mod matcher;
pub mod types;

pub use matcher::{
    compare_descriptors, euclidean_distance, EuclideanMatcher, MatchResult, Matcher,
    DEFAULT_MATCH_THRESHOLD,
};
pub use types::{
    now_millis, Descriptor, DescriptorError, Embedding, OfflineSession, RegistryPatch,
    RegistryRecord, Timestamp, VerifiedAccount, DESCRIPTOR_LEN,
};
