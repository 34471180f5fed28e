//! Raw artifact fetching and document persistence for dexsync.

mod fetch;
mod postgres;
mod store;

pub use fetch::{
    classify_status, ArtifactOrigin, AttemptOutcome, BackoffPolicy, FetchError, HttpClientConfig,
    HttpMirror, MirrorTransport, RawArtifact, SourceFetcher,
};
pub use postgres::PgDocumentStore;
pub use store::{
    open_store, DocumentStore, FieldCondition, FieldFilter, MemoryDocumentStore, StoreError,
    WriteResult,
};

pub const CRATE_NAME: &str = "dex-storage";
