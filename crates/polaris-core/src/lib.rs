//! Ingestion pipeline: normalizes raw WebSocket frames into NDJSON records,
//! applies deterministic filtering, and writes crash-safe output files.

pub mod error;
pub mod filter;
pub mod model;
pub mod normalizer;
pub mod pipeline;
pub mod redact;
pub mod session;
pub mod writer;

pub use error::CoreError;
pub use filter::{evaluate, FilterConfig, FilterDecision};
pub use model::{
    DeviceState, MalformedCode, MalformedError, MalformedRecord, Record, Source,
    StateChangeRecord, Tag,
};
pub use normalizer::normalize;
pub use pipeline::Pipeline;
pub use redact::{redact_json_line, RedactingJsonFormatter, Redactor};
pub use session::SessionState;
pub use writer::{sanitize_instance_id, OutputMode, Writer, WriterConfig};
