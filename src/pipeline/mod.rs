//! Stages of a single attempt.
//!
//! Each submodule owns one concern so it can be tested on its own.
//!
//! ## Data Flow
//!
//! ```text
//! source ──▶ input ──▶ runner ──▶ scan/relay ──▶ sink
//! (poll)    (blob)    (process)  (stdout)       (POST)
//! ```
//!
//! 1. [`source`] — poll the coordinator; decide what is worth retrying
//! 2. [`input`]  — pipe or download the task's blob, checking its length
//! 3. [`runner`] — spawn, wait for, interrupt and reap the converter
//! 4. [`scan`]   — find terminal fragments and the close-delimiter in a
//!    converter's own multipart stream with bounded memory
//! 5. [`relay`]  — move stdout into the request body, verbatim or rewritten
//!    from progress lines
//! 6. [`sink`]   — the streaming POST, plus single-file artifact fragments

pub mod input;
pub mod relay;
pub mod runner;
pub mod scan;
pub mod sink;
pub mod source;
