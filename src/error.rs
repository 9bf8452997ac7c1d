
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BagError {
    #[error("Path error: {0}")]
    Path(String),
    #[error("Locked node: {0}")]
    Locked(String),
    #[error("Validation failed for '{value}': {reason}")]
    Validation { value: String, reason: String },
    #[error("XML parse error: {message}")]
    XmlParse { message: String, position: Option<u64> },
    #[error("Resolver error: {0}")]
    Resolve(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Pickle error: {0}")]
    Pickle(String),
}

pub type Result<T> = std::result::Result<T, BagError>;

// Helper conversions
impl From<serde_json::Error> for BagError {
    fn from(e: serde_json::Error) -> Self {
        Self::Pickle(e.to_string())
    }
}

impl From<quick_xml::Error> for BagError {
    fn from(e: quick_xml::Error) -> Self {
        Self::XmlParse {
            message: e.to_string(),
            position: None,
        }
    }
}
