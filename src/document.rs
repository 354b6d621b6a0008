use std::fs;
use std::path::Path;

/// Raw document payload ready for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Unsupported file type: .{0} (only PDF files are supported)")]
    Unsupported(String),
    #[error("Document {0} is empty")]
    Empty(String),
}

impl Document {
    /// Wrap in-memory bytes, applying the same checks as [`load`].
    pub fn from_bytes(filename: impl Into<String>, bytes: Vec<u8>) -> Result<Self, DocumentError> {
        let filename = filename.into();
        check_extension(&filename)?;
        if bytes.is_empty() {
            return Err(DocumentError::Empty(filename));
        }
        Ok(Self { filename, bytes })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

fn check_extension(filename: &str) -> Result<(), DocumentError> {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    match ext.as_str() {
        "pdf" => Ok(()),
        _ => Err(DocumentError::Unsupported(ext)),
    }
}

/// Read a document file from disk for upload
pub fn load(path: &Path) -> Result<Document, DocumentError> {
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();
    check_extension(&filename)?;

    let bytes = fs::read(path).map_err(|source| DocumentError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Document::from_bytes(filename, bytes)
}
