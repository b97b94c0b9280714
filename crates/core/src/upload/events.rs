//! Events produced by the multipart parser for one request.

use std::path::PathBuf;

/// One step of a parsed multipart body.
///
/// Files are identified by their temp path, which the parser makes unique.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    /// A file part started; its bytes go to `temp_path`.
    FileBegin {
        /// Form field name of the part.
        field: String,
        /// File name sent by the client.
        file_name: String,
        /// MIME type sent by the client.
        content_type: Option<String>,
        /// Temp file receiving the bytes.
        temp_path: PathBuf,
    },
    /// A plain form field.
    Field {
        /// Field name.
        name: String,
        /// Field value.
        value: String,
    },
    /// All bytes of a file part were written to `temp_path`.
    FileComplete {
        /// Temp file of the part.
        temp_path: PathBuf,
        /// Bytes received.
        size: u64,
    },
    /// Running total of body bytes received.
    Progress {
        /// Bytes received so far.
        bytes_received: u64,
    },
    /// The client went away mid-transfer.
    Aborted,
    /// The body is not valid multipart.
    ParseError(String),
    /// The body was fully parsed.
    StreamEnd,
}
