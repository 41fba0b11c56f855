mod service;

pub use service::{RetentionReport, RetentionService};
