pub mod domain;

pub use domain::{
    IngestSummary, Product, RecordIdentity, RejectCounts, RejectReason, Rejection,
};
