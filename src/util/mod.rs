//! Small shared utilities: base64 codecs.

pub mod b64;
