//! Evidence records and their storage locators.

pub mod locator;
pub mod record;

pub use locator::{build_locator, sanitize_segment, UNLINKED_SEGMENT};
pub use record::{Evidence, EvidenceFilter, EvidenceType, UploadRequest};
